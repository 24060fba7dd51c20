//! RVA / VA / file-offset conversion and section lookup.

use crate::error::{Error, Result};
use crate::image::Image;

/// Index of the first section whose aligned virtual range fully contains
/// `[rva, rva + data_size)`.
pub fn section_index_from_rva(image: &Image, rva: u32, data_size: u32) -> Option<usize> {
    let section_alignment = image.optional_header.section_alignment();
    image
        .section_table
        .iter()
        .position(|header| header.contains_rva(rva, data_size, section_alignment))
}

/// Index of the section whose raw data range contains `offset`.
pub fn section_index_from_file_offset(image: &Image, offset: u32) -> Option<usize> {
    image
        .section_table
        .iter()
        .position(|header| header.contains_file_offset(offset))
}

/// Maps an RVA to its on-disk offset.
///
/// RVAs below `size_of_headers` map to themselves. Inside a section the RVA
/// must also fall inside the aligned raw size; past it the data exists only
/// virtually and there is no file offset to name.
pub fn rva_to_file_offset(image: &Image, rva: u32) -> Result<u32> {
    if rva < image.optional_header.size_of_headers() {
        return Ok(rva);
    }
    let index = section_index_from_rva(image, rva, 0).ok_or_else(|| {
        Error::Malformed(format!("no section contains rva {rva:#x}"))
    })?;
    let header = &image.section_table[index];
    let delta = rva - header.virtual_address;
    let aligned_raw = header.aligned_raw_size(image.optional_header.file_alignment());
    if delta >= aligned_raw {
        return Err(Error::BufferOverrun {
            offset: rva as usize,
            wanted: 1,
            available: 0,
        });
    }
    Ok(header.pointer_to_raw_data + delta)
}

/// Maps an on-disk offset back to an RVA. Mirror of [`rva_to_file_offset`].
pub fn file_offset_to_rva(image: &Image, offset: u32) -> Result<u32> {
    if offset < image.optional_header.size_of_headers() {
        return Ok(offset);
    }
    let index = section_index_from_file_offset(image, offset).ok_or_else(|| {
        Error::Malformed(format!("no section contains file offset {offset:#x}"))
    })?;
    let header = &image.section_table[index];
    Ok(header.virtual_address + (offset - header.pointer_to_raw_data))
}

/// Converts a VA to an RVA against the image base, range-checked.
pub fn va_to_rva(image: &Image, va: u64) -> Result<u32> {
    let rva = va.checked_sub(image.image_base()).ok_or_else(|| {
        Error::Malformed(format!(
            "va {va:#x} is below the image base {:#x}",
            image.image_base()
        ))
    })?;
    u32::try_from(rva)
        .map_err(|_| Error::Malformed(format!("va {va:#x} is out of the 32-bit rva range")))
}

/// Converts an RVA to a VA against the image base.
pub fn rva_to_va(image: &Image, rva: u32) -> Result<u64> {
    image
        .image_base()
        .checked_add(u64::from(rva))
        .ok_or_else(|| Error::Malformed(format!("va for rva {rva:#x} overflows")))
}
