//! Typed reads and writes against the image model.
//!
//! Every accessor takes two policy flags: `include_headers` decides whether
//! RVAs below `size_of_headers` resolve into the raw header region, and
//! `allow_virtual_data` decides whether a datum may extend past the physical
//! end of its section (the missing tail reads as zero).

use crate::buffer::{InputCursor, RefBuffer};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::image::address::{section_index_from_rva, va_to_rva};
use crate::packed::{
    PackedByteArray, PackedByteVector, PackedCString, PackedRecord, PackedStruct,
    PackedUtf16CString,
};

fn location_for_rva<'a>(
    image: &'a Image,
    rva: u32,
    include_headers: bool,
) -> Result<(&'a RefBuffer, usize)> {
    if include_headers && rva < image.optional_header.size_of_headers() {
        return Ok((&image.full_headers_buffer, rva as usize));
    }
    let index = section_index_from_rva(image, rva, 1).ok_or_else(|| {
        Error::Malformed(format!("rva {rva:#x} cannot be mapped into the image"))
    })?;
    let header = &image.section_table[index];
    Ok((
        &image.section_data[index],
        (rva - header.virtual_address) as usize,
    ))
}

fn location_for_rva_mut(
    image: &mut Image,
    rva: u32,
    include_headers: bool,
) -> Result<(&mut RefBuffer, usize)> {
    if include_headers && rva < image.optional_header.size_of_headers() {
        return Ok((&mut image.full_headers_buffer, rva as usize));
    }
    let index = section_index_from_rva(image, rva, 1).ok_or_else(|| {
        Error::Malformed(format!("rva {rva:#x} cannot be mapped into the image"))
    })?;
    let header = &image.section_table[index];
    let pos = (rva - header.virtual_address) as usize;
    Ok((&mut image.section_data[index], pos))
}

/// Whether `rva` resolves into headers or a section at all.
pub fn rva_is_resolvable(image: &Image, rva: u32, include_headers: bool) -> bool {
    location_for_rva(image, rva, include_headers).is_ok()
}

/// Reads a packed record at `rva`.
pub fn struct_from_rva<T: PackedRecord>(
    image: &Image,
    rva: u32,
    include_headers: bool,
    allow_virtual_data: bool,
) -> Result<PackedStruct<T>> {
    let (buffer, pos) = location_for_rva(image, rva, include_headers)?;
    let mut cursor = InputCursor::at(buffer, pos);
    PackedStruct::read_from(&mut cursor, allow_virtual_data)
}

/// Reads a packed record at a VA.
pub fn struct_from_va<T: PackedRecord>(
    image: &Image,
    va: u64,
    include_headers: bool,
    allow_virtual_data: bool,
) -> Result<PackedStruct<T>> {
    struct_from_rva(image, va_to_rva(image, va)?, include_headers, allow_virtual_data)
}

/// Writes a packed record back at `rva`.
///
/// With `write_virtual_part` the full record must fit in physical storage;
/// without it, only the physically backed prefix is written.
pub fn struct_to_rva<T: PackedRecord>(
    image: &mut Image,
    rva: u32,
    value: &PackedStruct<T>,
    include_headers: bool,
    write_virtual_part: bool,
) -> Result<usize> {
    let bytes = value.to_bytes()?;
    let (buffer, pos) = location_for_rva_mut(image, rva, include_headers)?;
    let slice = buffer.make_mut();
    let available = slice.len().saturating_sub(pos.min(slice.len()));
    if write_virtual_part && available < bytes.len() {
        return Err(Error::BufferOverrun {
            offset: pos,
            wanted: bytes.len(),
            available,
        });
    }
    let count = bytes.len().min(available);
    slice[pos..pos + count].copy_from_slice(&bytes[..count]);
    Ok(count)
}

/// Writes a packed record back at a VA.
pub fn struct_to_va<T: PackedRecord>(
    image: &mut Image,
    va: u64,
    value: &PackedStruct<T>,
    include_headers: bool,
    write_virtual_part: bool,
) -> Result<usize> {
    struct_to_rva(image, va_to_rva(image, va)?, value, include_headers, write_virtual_part)
}

/// Reads a NUL-terminated byte string at `rva`.
pub fn cstring_from_rva(
    image: &Image,
    rva: u32,
    include_headers: bool,
    allow_virtual_data: bool,
) -> Result<PackedCString> {
    let (buffer, pos) = location_for_rva(image, rva, include_headers)?;
    let mut cursor = InputCursor::at(buffer, pos);
    PackedCString::read_from(&mut cursor, allow_virtual_data)
}

/// Reads a NUL-terminated byte string at a VA.
pub fn cstring_from_va(
    image: &Image,
    va: u64,
    include_headers: bool,
    allow_virtual_data: bool,
) -> Result<PackedCString> {
    cstring_from_rva(image, va_to_rva(image, va)?, include_headers, allow_virtual_data)
}

/// Reads a NUL-terminated UTF-16LE string at `rva`.
pub fn utf16_from_rva(
    image: &Image,
    rva: u32,
    include_headers: bool,
    allow_virtual_data: bool,
) -> Result<PackedUtf16CString> {
    let (buffer, pos) = location_for_rva(image, rva, include_headers)?;
    let mut cursor = InputCursor::at(buffer, pos);
    PackedUtf16CString::read_from(&mut cursor, allow_virtual_data)
}

/// Reads `size` logical bytes at `rva` into a provenance-carrying vector.
pub fn byte_vector_from_rva(
    image: &Image,
    rva: u32,
    size: usize,
    include_headers: bool,
    allow_virtual_data: bool,
) -> Result<PackedByteVector> {
    let (buffer, pos) = location_for_rva(image, rva, include_headers)?;
    let mut cursor = InputCursor::at(buffer, pos);
    PackedByteVector::read_from(&mut cursor, size, allow_virtual_data)
}

/// Reads up to `N` bytes at `rva` into a fixed-capacity array.
pub fn byte_array_from_rva<const N: usize>(
    image: &Image,
    rva: u32,
    size: usize,
    include_headers: bool,
    allow_virtual_data: bool,
) -> Result<PackedByteArray<N>> {
    let (buffer, pos) = location_for_rva(image, rva, include_headers)?;
    let mut cursor = InputCursor::at(buffer, pos);
    PackedByteArray::read_from(&mut cursor, size, allow_virtual_data)
}

/// Strictly physical read of `count` bytes at `rva`.
pub fn bytes_from_rva(
    image: &Image,
    rva: u32,
    count: usize,
    include_headers: bool,
) -> Result<Vec<u8>> {
    let vector = byte_vector_from_rva(image, rva, count, include_headers, false)?;
    Ok(vector.as_slice().to_vec())
}

/// The section data buffer containing `rva`.
pub fn section_data_from_rva(image: &Image, rva: u32) -> Result<&RefBuffer> {
    let index = section_index_from_rva(image, rva, 1).ok_or_else(|| {
        Error::Malformed(format!("rva {rva:#x} is not inside any section"))
    })?;
    Ok(&image.section_data[index])
}

/// The section data buffer containing a VA.
pub fn section_data_from_va(image: &Image, va: u64) -> Result<&RefBuffer> {
    section_data_from_rva(image, va_to_rva(image, va)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{InputBuffer, InputMemoryBuffer};
    use crate::image::ImageLoadOptions;
    use crate::test_fixtures::{SectionSpec, TEST_IMAGE_BASE_64, synthetic_image_bytes};

    fn image() -> Image {
        let mut data = vec![0u8; 0x200];
        data[0x10..0x18].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        data[0x20..0x26].copy_from_slice(b"hello\0");
        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".data", 0x1000, 0x200, data).virtual_size(0x400)],
            &[],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    #[test]
    fn struct_read_reports_rva_provenance() {
        let image = image();
        let value = struct_from_rva::<u64>(&image, 0x1010, true, false).unwrap();
        assert_eq!(*value, 0x1122_3344_5566_7788);
        assert_eq!(value.state().relative_offset(), 0x1010);
        assert_eq!(value.state().absolute_offset(), 0x410);
    }

    #[test]
    fn header_reads_honor_the_policy() {
        let image = image();
        let magic = struct_from_rva::<u16>(&image, 0, true, false).unwrap();
        assert_eq!(*magic, crate::header::DOS_MAGIC);
        assert!(struct_from_rva::<u16>(&image, 0, false, false).is_err());
    }

    #[test]
    fn virtual_tail_reads_are_gated() {
        let image = image();
        // 0x1200 .. 0x1400 exists only virtually.
        assert!(struct_from_rva::<u32>(&image, 0x1300, true, false).is_err());
        let value = struct_from_rva::<u32>(&image, 0x1300, true, true).unwrap();
        assert_eq!(*value, 0);
        assert_eq!(value.physical_size(), 0);
        assert!(value.is_virtual());
    }

    #[test]
    fn strings_and_vectors() {
        let image = image();
        let s = cstring_from_rva(&image, 0x1020, true, false).unwrap();
        assert_eq!(s.as_str(), "hello");
        let v = byte_vector_from_rva(&image, 0x11F0, 0x20, true, true).unwrap();
        assert_eq!(v.physical_size(), 0x10);
        assert_eq!(v.data_size(), 0x20);
        assert!(bytes_from_rva(&image, 0x11F0, 0x20, true).is_err());
    }

    #[test]
    fn writes_go_through_promotion() {
        let mut image = image();
        assert!(!image.section_data[0].is_copied());
        let value = PackedStruct::<u32>::new(0xDEAD_BEEF);
        struct_to_rva(&mut image, 0x1000, &value, true, true).unwrap();
        assert!(image.section_data[0].is_copied());
        let back = struct_from_rva::<u32>(&image, 0x1000, true, false).unwrap();
        assert_eq!(*back, 0xDEAD_BEEF);
    }

    #[test]
    fn partial_write_into_virtual_tail() {
        let mut image = image();
        let value = PackedStruct::<u64>::new(u64::MAX);
        // Starts 4 bytes before the physical end of .data.
        assert!(struct_to_rva(&mut image, 0x11FC, &value, true, true).is_err());
        let written = struct_to_rva(&mut image, 0x11FC, &value, true, false).unwrap();
        assert_eq!(written, 4);
        let back = struct_from_rva::<u32>(&image, 0x11FC, true, false).unwrap();
        assert_eq!(*back, u32::MAX);
    }

    #[test]
    fn va_variants_translate() {
        let image = image();
        let value =
            struct_from_va::<u64>(&image, TEST_IMAGE_BASE_64 + 0x1010, true, false).unwrap();
        assert_eq!(*value, 0x1122_3344_5566_7788);
        let section = section_data_from_va(&image, TEST_IMAGE_BASE_64 + 0x1000).unwrap();
        assert_eq!(section.relative_offset(), 0x1000);
    }
}
