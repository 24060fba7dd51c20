//! The owning PE image model and its loader.
//!
//! [`Image`] owns everything between the first byte of the DOS header and
//! the end of the overlay: headers, data directories, the section table, a
//! [`RefBuffer`] per section, the raw header region, and the overlay. Section
//! buffers either share the source bytes or own private copies, governed by
//! [`ImageLoadOptions::copy_memory`].
//!
//! Loading is strict only about what it must be strict about: a missing DOS
//! or PE signature is fatal, everything else degrades into diagnostics on
//! [`Image::errors`] and parsing continues.

use log::debug;

use crate::buffer::{InputBuffer, InputCursor, InputMemoryBuffer, RefBuffer};
use crate::data_directories::DataDirectories;
use crate::error::{Error, Result};
use crate::error_list::{ErrorList, error_codes};
use crate::header::{CoffHeader, DosHeader, SIZEOF_DOS_HEADER, parse_image_signature};
use crate::optional_header::OptionalHeader;
use crate::packed::PackedStruct;
use crate::section_table::SectionHeader;
use crate::utils::{is_aligned, shannon_entropy};

pub mod accessor;
pub mod address;
pub mod builder;

/// The maximum number of sections a PE image may carry (a strict Windows
/// loader limit).
pub const MAX_NUMBER_OF_SECTIONS: usize = 65279;

error_codes! {
    /// Non-fatal problems found while assembling the image model.
    pub enum ImageError("image_loader") {
        TooManySections => "Number of sections exceeds the configured limit",
        UnalignedSectionVirtualAddress => "Section virtual address is not aligned to the section alignment",
        UnalignedSectionRawAddress => "Section raw data pointer is not aligned to the file alignment",
        UnalignedSectionRawSize => "Section raw data size is not aligned to the file alignment",
        SectionRawDataOutOfBounds => "Section raw data extends beyond the end of the file",
        SizeOfHeadersOutOfBounds => "size_of_headers extends beyond the end of the file",
    }
}

/// Options governing how an [`Image`] is assembled from bytes.
#[derive(Debug, Copy, Clone)]
pub struct ImageLoadOptions {
    /// Eagerly copy section data, DOS stub, headers and overlay instead of
    /// sharing the source buffer.
    pub copy_memory: bool,
    /// Tolerate headers and directory slots cut short by the physical end of
    /// the file.
    pub allow_virtual_headers: bool,
    /// The source is a memory dump: raw data layout equals virtual layout.
    pub loaded_to_memory: bool,
    /// Capture bytes after the last section as the overlay.
    pub load_overlay: bool,
    /// Record alignment diagnostics for each section.
    pub validate_sections: bool,
    /// Hard cap on parsed sections; the excess is dropped with a diagnostic.
    pub max_number_of_sections: usize,
}

impl Default for ImageLoadOptions {
    fn default() -> Self {
        ImageLoadOptions {
            copy_memory: false,
            allow_virtual_headers: true,
            loaded_to_memory: false,
            load_overlay: true,
            validate_sections: true,
            max_number_of_sections: MAX_NUMBER_OF_SECTIONS,
        }
    }
}

/// An analyzed, owning PE32/PE32+ image.
#[derive(Debug, Clone)]
pub struct Image {
    pub dos_header: PackedStruct<DosHeader>,
    /// Bytes between the DOS header and `e_lfanew`, Rich header included.
    pub dos_stub: RefBuffer,
    /// `PE\0\0`.
    pub image_signature: PackedStruct<u32>,
    pub file_header: PackedStruct<CoffHeader>,
    pub optional_header: OptionalHeader,
    pub data_directories: DataDirectories,
    /// Parallel to [`Image::section_data`].
    pub section_table: Vec<PackedStruct<SectionHeader>>,
    /// Parallel to [`Image::section_table`].
    pub section_data: Vec<RefBuffer>,
    /// The first `size_of_headers` bytes, used to fill gaps on rebuild.
    pub full_headers_buffer: RefBuffer,
    /// Bytes after the last section's raw data.
    pub overlay: RefBuffer,
    /// Raw layout equals virtual layout.
    pub loaded_to_memory: bool,
    pub errors: ErrorList<ImageError>,
}

impl Image {
    /// Assembles an image from a byte source.
    ///
    /// Fails only when the DOS header, image signature, file header, or
    /// optional header cannot be decoded at all; any further irregularity is
    /// recorded on [`Image::errors`].
    pub fn load(source: &InputMemoryBuffer, options: &ImageLoadOptions) -> Result<Self> {
        let mut errors = ErrorList::new();
        let mut cursor = InputCursor::new(source);

        let dos_header = DosHeader::parse(&mut cursor)?;
        debug!("dos header: {:?}", *dos_header);
        let e_lfanew = dos_header.pe_pointer as usize;

        let stub_len = e_lfanew.checked_sub(SIZEOF_DOS_HEADER).ok_or_else(|| {
            Error::Malformed(format!("e_lfanew ({e_lfanew:#x}) precedes the DOS stub"))
        })?;
        let dos_stub = RefBuffer::from_input(
            source.reduce(SIZEOF_DOS_HEADER, stub_len.min(
                source.size().saturating_sub(SIZEOF_DOS_HEADER),
            ))?,
            options.copy_memory,
        );

        cursor.set_rpos(e_lfanew);
        let image_signature = parse_image_signature(&mut cursor)?;
        let file_header = PackedStruct::<CoffHeader>::read_from(&mut cursor, false)
            .map_err(|_| Error::Malformed("file header is out of bounds".into()))?;
        debug!("file header: {:?}", *file_header);

        let size_of_optional_header = file_header.size_of_optional_header as usize;
        if size_of_optional_header < 2 {
            return Err(Error::Malformed(
                "size_of_optional_header leaves no room for the magic".into(),
            ));
        }
        let optional_header = OptionalHeader::parse(
            &mut cursor,
            size_of_optional_header,
            options.allow_virtual_headers,
        )?;
        debug!(
            "optional header: magic {:#x}, image base {:#x}, {} data directories",
            optional_header.magic(),
            optional_header.image_base(),
            optional_header.number_of_rva_and_sizes()
        );

        let data_directories = DataDirectories::parse(
            &mut cursor,
            optional_header.number_of_rva_and_sizes() as usize,
            options.allow_virtual_headers,
        )?;

        // Section headers follow the declared optional header size, which may
        // differ from where directory parsing left the cursor.
        let section_table_offset = e_lfanew
            .checked_add(crate::header::SIZEOF_IMAGE_SIGNATURE)
            .and_then(|o| o.checked_add(crate::header::SIZEOF_COFF_HEADER))
            .and_then(|o| o.checked_add(size_of_optional_header))
            .ok_or_else(|| Error::Malformed("section table offset overflows".into()))?;
        cursor.set_rpos(section_table_offset);

        let mut number_of_sections = file_header.number_of_sections as usize;
        if number_of_sections > options.max_number_of_sections {
            errors.add_error(ImageError::TooManySections);
            number_of_sections = options.max_number_of_sections;
        }
        let mut section_table = Vec::with_capacity(number_of_sections);
        for i in 0..number_of_sections {
            let header = PackedStruct::<SectionHeader>::read_from(
                &mut cursor,
                options.allow_virtual_headers,
            )?;
            debug!("({}) {:?}", i, *header);
            section_table.push(header);
        }

        let section_alignment = optional_header.section_alignment();
        let file_alignment = optional_header.file_alignment();
        let mut section_data = Vec::with_capacity(section_table.len());
        let mut last_section_end = 0usize;
        for (i, header) in section_table.iter().enumerate() {
            if options.validate_sections && !options.loaded_to_memory {
                if section_alignment.is_power_of_two()
                    && !is_aligned(header.virtual_address as usize, section_alignment as usize)
                {
                    errors.add_error_with_index(ImageError::UnalignedSectionVirtualAddress, i);
                }
                if file_alignment.is_power_of_two() {
                    if !is_aligned(header.pointer_to_raw_data as usize, file_alignment as usize) {
                        errors.add_error_with_index(ImageError::UnalignedSectionRawAddress, i);
                    }
                    if !is_aligned(header.size_of_raw_data as usize, file_alignment as usize) {
                        errors.add_error_with_index(ImageError::UnalignedSectionRawSize, i);
                    }
                }
            }

            let (raw_offset, raw_size) = if options.loaded_to_memory {
                (
                    header.virtual_address as usize,
                    header.aligned_virtual_size(section_alignment) as usize,
                )
            } else {
                (
                    header.pointer_to_raw_data as usize,
                    header.size_of_raw_data as usize,
                )
            };

            let available = source.size().saturating_sub(raw_offset.min(source.size()));
            let captured = raw_size.min(available);
            if captured < raw_size {
                errors.add_error_with_index(ImageError::SectionRawDataOutOfBounds, i);
            }
            let window = if raw_offset <= source.size() {
                source
                    .reduce(raw_offset, captured)?
                    .with_relative_offset(header.virtual_address as usize)
            } else {
                source
                    .reduce(0, 0)?
                    .with_relative_offset(header.virtual_address as usize)
            };
            section_data.push(RefBuffer::from_input(window, options.copy_memory));
            if header.size_of_raw_data != 0 {
                last_section_end = last_section_end.max(raw_offset + captured);
            }
        }

        let size_of_headers = optional_header.size_of_headers() as usize;
        let headers_captured = size_of_headers.min(source.size());
        if headers_captured < size_of_headers {
            errors.add_error(ImageError::SizeOfHeadersOutOfBounds);
        }
        let full_headers_buffer =
            RefBuffer::from_input(source.reduce(0, headers_captured)?, options.copy_memory);

        last_section_end = last_section_end.max(headers_captured);
        let overlay = if options.load_overlay && last_section_end < source.size() {
            RefBuffer::from_input(
                source.reduce(last_section_end, source.size() - last_section_end)?,
                options.copy_memory,
            )
        } else {
            RefBuffer::from_vec(Vec::new(), source.size(), 0)
        };

        Ok(Image {
            dos_header,
            dos_stub,
            image_signature,
            file_header,
            optional_header,
            data_directories,
            section_table,
            section_data,
            full_headers_buffer,
            overlay,
            loaded_to_memory: options.loaded_to_memory,
            errors,
        })
    }

    pub fn is_64bit(&self) -> bool {
        self.optional_header.is_64bit()
    }

    /// Preferred load address from the optional header.
    pub fn image_base(&self) -> u64 {
        self.optional_header.image_base()
    }

    pub fn machine(&self) -> u16 {
        self.file_header.machine
    }

    /// Shannon entropy of the whole captured image: headers, section raw
    /// data, and overlay.
    pub fn entropy(&self) -> f64 {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(self.full_headers_buffer.as_slice());
        for data in &self.section_data {
            bytes.extend_from_slice(data.as_slice());
        }
        bytes.extend_from_slice(self.overlay.as_slice());
        shannon_entropy(&bytes)
    }

    /// Shannon entropy of one section's raw data.
    pub fn section_entropy(&self, index: usize) -> Option<f64> {
        self.section_data
            .get(index)
            .map(|data| shannon_entropy(data.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_directories::DirectoryType;
    use crate::test_fixtures::{SectionSpec, synthetic_image_bytes};

    #[test]
    fn loads_a_synthetic_pe64() {
        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".text", 0x1000, 0x200, vec![0xC3; 0x20])],
            &[],
        );
        let source = InputMemoryBuffer::from_vec(bytes);
        let image = Image::load(&source, &ImageLoadOptions::default()).unwrap();
        assert!(image.is_64bit());
        assert_eq!(image.section_table.len(), 1);
        assert_eq!(image.section_table.len(), image.section_data.len());
        assert_eq!(image.section_table[0].name(), Some(".text"));
        assert_eq!(image.section_data[0].as_slice()[0], 0xC3);
        assert!(!image.data_directories.has_nonempty_directory(DirectoryType::Exports));
        assert!(!image.errors.has_errors());
    }

    #[test]
    fn section_raw_data_clamped_to_eof() {
        let mut bytes = synthetic_image_bytes(
            false,
            &[SectionSpec::new(".data", 0x1000, 0x200, vec![0xAA; 0x200])],
            &[],
        );
        bytes.truncate(bytes.len() - 0x100);
        let source = InputMemoryBuffer::from_vec(bytes);
        let image = Image::load(&source, &ImageLoadOptions::default()).unwrap();
        assert!(
            image
                .errors
                .has_error_with_index(ImageError::SectionRawDataOutOfBounds, 0)
        );
        assert_eq!(image.section_data[0].as_slice().len(), 0x100);
    }

    #[test]
    fn overlay_is_captured() {
        let mut bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".data", 0x1000, 0x200, vec![0xAA; 0x200])],
            &[],
        );
        bytes.extend_from_slice(b"OVERLAY!");
        let source = InputMemoryBuffer::from_vec(bytes);
        let image = Image::load(&source, &ImageLoadOptions::default()).unwrap();
        assert_eq!(image.overlay.as_slice(), b"OVERLAY!");
    }
}
