//! The debug directory.
//!
//! An array of fixed-size entries, each pointing at a typed payload. The
//! payloads this crate decodes beyond raw capture are the ones tooling
//! actually meets: CodeView PDB 7.0 / 2.0 records, `IMAGE_DEBUG_MISC`, and
//! reproducible-build hashes. Everything else is kept as bytes with its
//! type id.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::byte_vector_from_rva;
use crate::image::address::file_offset_to_rva;
use crate::packed::{PackedByteVector, PackedStruct, packed_size_of};

/// `IMAGE_DEBUG_TYPE_CODEVIEW`
pub const IMAGE_DEBUG_TYPE_CODEVIEW: u32 = 2;
/// `IMAGE_DEBUG_TYPE_FPO`
pub const IMAGE_DEBUG_TYPE_FPO: u32 = 3;
/// `IMAGE_DEBUG_TYPE_MISC`
pub const IMAGE_DEBUG_TYPE_MISC: u32 = 4;
/// `IMAGE_DEBUG_TYPE_VC_FEATURE`
pub const IMAGE_DEBUG_TYPE_VC_FEATURE: u32 = 12;
/// `IMAGE_DEBUG_TYPE_POGO`
pub const IMAGE_DEBUG_TYPE_POGO: u32 = 13;
/// `IMAGE_DEBUG_TYPE_REPRO`
pub const IMAGE_DEBUG_TYPE_REPRO: u32 = 16;
/// `IMAGE_DEBUG_TYPE_EX_DLLCHARACTERISTICS`
pub const IMAGE_DEBUG_TYPE_EX_DLLCHARACTERISTICS: u32 = 20;

/// CodeView PDB 7.0 magic (`RSDS`).
pub const CODEVIEW_PDB70_MAGIC: u32 = 0x5344_5352;
/// CodeView PDB 2.0 magic (`NB10`).
pub const CODEVIEW_PDB20_MAGIC: u32 = 0x3031_424E;

/// `IMAGE_DEBUG_DIRECTORY`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_DEBUG_DIRECTORY"))]
pub struct ImageDebugDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub data_type: u32,
    pub size_of_data: u32,
    /// RVA of the payload; zero when the payload is not mapped.
    pub address_of_raw_data: u32,
    /// File offset of the payload.
    pub pointer_to_raw_data: u32,
}

error_codes! {
    /// Debug directory diagnostics.
    pub enum DebugError("debug_loader") {
        TooManyDebugDirectories => "Number of debug directory entries exceeds the configured limit",
        UnmatchedDirectorySize => "Directory size is not a multiple of the debug entry size",
        InvalidDebugData => "Debug entry payload cannot be read",
        InvalidCodeViewRecord => "CodeView record is truncated or carries an unknown magic",
        InvalidMiscRecord => "IMAGE_DEBUG_MISC record is truncated",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct DebugLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    pub max_debug_directories: u32,
    /// Decode known payload kinds instead of keeping bytes only.
    pub parse_payloads: bool,
}

impl Default for DebugLoadOptions {
    fn default() -> Self {
        DebugLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            max_debug_directories: 0x100,
            parse_payloads: true,
        }
    }
}

/// A decoded debug payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum DebugPayload {
    /// No bytes (or a zero-sized entry).
    #[default]
    Empty,
    /// `RSDS`: GUID + age + UTF-8 PDB path.
    CodeViewPdb70 {
        guid: [u8; 16],
        age: u32,
        pdb_path: String,
    },
    /// `NB10`: offset + timestamp signature + age + PDB path.
    CodeViewPdb20 {
        offset: u32,
        signature: u32,
        age: u32,
        pdb_path: String,
    },
    /// `IMAGE_DEBUG_MISC`, which names the external `.dbg` file.
    Misc {
        data_type: u32,
        unicode: bool,
        data: Vec<u8>,
    },
    /// Reproducible-build hash (length-prefixed when non-empty).
    Repro { hash: Vec<u8> },
    /// Anything else, kept verbatim.
    Raw,
}

/// One debug directory entry plus its captured payload.
#[derive(Debug, Clone, Default)]
pub struct DebugDirectoryEntry {
    pub descriptor: PackedStruct<ImageDebugDirectory>,
    /// The payload bytes as found in the image.
    pub raw_data: PackedByteVector,
    pub payload: DebugPayload,
    pub errors: ErrorList<DebugError>,
}

/// The decoded debug directory.
#[derive(Debug, Clone, Default)]
pub struct DebugDirectoryDetails {
    pub entries: Vec<DebugDirectoryEntry>,
    pub errors: ErrorList<DebugError>,
}

fn read_utf8_until_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parse_payload(entry: &mut DebugDirectoryEntry) {
    let bytes = entry.raw_data.as_slice();
    if bytes.is_empty() {
        entry.payload = DebugPayload::Empty;
        return;
    }
    match entry.descriptor.data_type {
        IMAGE_DEBUG_TYPE_CODEVIEW => {
            let Ok(magic) = bytes.pread_with::<u32>(0, scroll::LE) else {
                entry.errors.add_error(DebugError::InvalidCodeViewRecord);
                return;
            };
            match magic {
                CODEVIEW_PDB70_MAGIC if bytes.len() >= 24 => {
                    let mut guid = [0u8; 16];
                    guid.copy_from_slice(&bytes[4..20]);
                    let age = bytes.pread_with::<u32>(20, scroll::LE).unwrap_or(0);
                    entry.payload = DebugPayload::CodeViewPdb70 {
                        guid,
                        age,
                        pdb_path: read_utf8_until_nul(&bytes[24..]),
                    };
                }
                CODEVIEW_PDB20_MAGIC if bytes.len() >= 16 => {
                    let offset = bytes.pread_with::<u32>(4, scroll::LE).unwrap_or(0);
                    let signature = bytes.pread_with::<u32>(8, scroll::LE).unwrap_or(0);
                    let age = bytes.pread_with::<u32>(12, scroll::LE).unwrap_or(0);
                    entry.payload = DebugPayload::CodeViewPdb20 {
                        offset,
                        signature,
                        age,
                        pdb_path: read_utf8_until_nul(&bytes[16..]),
                    };
                }
                _ => {
                    entry.errors.add_error(DebugError::InvalidCodeViewRecord);
                    entry.payload = DebugPayload::Raw;
                }
            }
        }
        IMAGE_DEBUG_TYPE_MISC => {
            // data_type, length, unicode + 3 reserved bytes, then data.
            if bytes.len() < 12 {
                entry.errors.add_error(DebugError::InvalidMiscRecord);
                entry.payload = DebugPayload::Raw;
                return;
            }
            let data_type = bytes.pread_with::<u32>(0, scroll::LE).unwrap_or(0);
            let length = bytes.pread_with::<u32>(4, scroll::LE).unwrap_or(0) as usize;
            let unicode = bytes[8] != 0;
            let data_end = length.clamp(12, bytes.len());
            entry.payload = DebugPayload::Misc {
                data_type,
                unicode,
                data: bytes[12..data_end].to_vec(),
            };
        }
        IMAGE_DEBUG_TYPE_REPRO => {
            // A length-prefixed hash; pre-VS2019 images carry no payload.
            let hash = if bytes.len() >= 4 {
                let length = bytes.pread_with::<u32>(0, scroll::LE).unwrap_or(0) as usize;
                bytes[4..].get(..length).unwrap_or(&bytes[4..]).to_vec()
            } else {
                Vec::new()
            };
            entry.payload = DebugPayload::Repro { hash };
        }
        _ => entry.payload = DebugPayload::Raw,
    }
}

/// Loads the debug directory, or `None` when the image has none.
pub fn load(image: &Image, options: &DebugLoadOptions) -> Result<Option<DebugDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::Debug)
        .filter(|d| d.virtual_address != 0 && d.size != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let entry_size = packed_size_of::<ImageDebugDirectory>() as u32;
    let mut details = DebugDirectoryDetails::default();
    if dir.size % entry_size != 0 {
        details.errors.add_error(DebugError::UnmatchedDirectorySize);
    }
    let mut count = dir.size / entry_size;
    if count > options.max_debug_directories {
        details
            .errors
            .add_error(DebugError::TooManyDebugDirectories);
        count = options.max_debug_directories;
    }

    for i in 0..count {
        let descriptor = match crate::image::accessor::struct_from_rva::<ImageDebugDirectory>(
            image,
            dir.virtual_address + i * entry_size,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                details.errors.add_error(DebugError::InvalidDebugData);
                break;
            }
        };
        debug!(
            "debug entry {}: type {}, {:#x} bytes",
            i, descriptor.data_type, descriptor.size_of_data
        );
        let mut entry = DebugDirectoryEntry {
            descriptor,
            ..DebugDirectoryEntry::default()
        };

        if entry.descriptor.size_of_data != 0 {
            let rva = if entry.descriptor.address_of_raw_data != 0 {
                Some(entry.descriptor.address_of_raw_data)
            } else {
                file_offset_to_rva(image, entry.descriptor.pointer_to_raw_data).ok()
            };
            match rva.and_then(|rva| {
                byte_vector_from_rva(
                    image,
                    rva,
                    entry.descriptor.size_of_data as usize,
                    options.include_headers,
                    options.allow_virtual_data,
                )
                .ok()
            }) {
                Some(raw_data) => entry.raw_data = raw_data,
                None => entry.errors.add_error(DebugError::InvalidDebugData),
            }
        }

        if options.parse_payloads {
            parse_payload(&mut entry);
        }
        details.entries.push(entry);
    }

    Ok(Some(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::data_directories::{DataDirectory, DirectoryType};
    use crate::image::ImageLoadOptions;
    use crate::test_fixtures::{SectionSpec, synthetic_image_bytes};
    use scroll::Pwrite;

    const DEBUG_RVA: u32 = 0x2000;

    fn debug_image() -> Image {
        let mut data = vec![0u8; 0x300];
        // Entry 0: CodeView RSDS at 0x2100. Entry 1: repro at 0x2200.
        let codeview = ImageDebugDirectory {
            data_type: IMAGE_DEBUG_TYPE_CODEVIEW,
            size_of_data: 24 + 8,
            address_of_raw_data: DEBUG_RVA + 0x100,
            pointer_to_raw_data: 0x500,
            ..ImageDebugDirectory::default()
        };
        let repro = ImageDebugDirectory {
            data_type: IMAGE_DEBUG_TYPE_REPRO,
            size_of_data: 4 + 32,
            address_of_raw_data: DEBUG_RVA + 0x200,
            pointer_to_raw_data: 0x600,
            ..ImageDebugDirectory::default()
        };
        data.pwrite_with(codeview, 0, scroll::LE).unwrap();
        data.pwrite_with(repro, 28, scroll::LE).unwrap();

        data.pwrite_with(CODEVIEW_PDB70_MAGIC, 0x100, scroll::LE).unwrap();
        for (i, b) in (1u8..=16).enumerate() {
            data[0x104 + i] = b;
        }
        data.pwrite_with(3u32, 0x114, scroll::LE).unwrap();
        data[0x118..0x120].copy_from_slice(b"a.pdb\0\0\0");

        data.pwrite_with(32u32, 0x200, scroll::LE).unwrap();
        for i in 0..32 {
            data[0x204 + i] = 0xA0 + i as u8;
        }

        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".rdata", DEBUG_RVA, 0x300, data)],
            &[(
                DirectoryType::Debug as usize,
                DataDirectory {
                    virtual_address: DEBUG_RVA,
                    size: 2 * 28,
                },
            )],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    #[test]
    fn packed_entry_size() {
        assert_eq!(packed_size_of::<ImageDebugDirectory>(), 28);
    }

    #[test]
    fn decodes_codeview_and_repro_entries() {
        let image = debug_image();
        let details = load(&image, &DebugLoadOptions::default()).unwrap().unwrap();
        assert_eq!(details.entries.len(), 2);

        match &details.entries[0].payload {
            DebugPayload::CodeViewPdb70 { guid, age, pdb_path } => {
                assert_eq!(guid[0], 1);
                assert_eq!(guid[15], 16);
                assert_eq!(*age, 3);
                assert_eq!(pdb_path, "a.pdb");
            }
            other => panic!("expected RSDS payload, got {other:?}"),
        }
        match &details.entries[1].payload {
            DebugPayload::Repro { hash } => {
                assert_eq!(hash.len(), 32);
                assert_eq!(hash[0], 0xA0);
            }
            other => panic!("expected repro payload, got {other:?}"),
        }
        assert!(!details.errors.has_errors());
    }

    #[test]
    fn entry_cap_truncates() {
        let image = debug_image();
        let options = DebugLoadOptions {
            max_debug_directories: 1,
            ..DebugLoadOptions::default()
        };
        let details = load(&image, &options).unwrap().unwrap();
        assert_eq!(details.entries.len(), 1);
        assert!(details.errors.has_error(DebugError::TooManyDebugDirectories));
    }

    #[test]
    fn truncated_codeview_is_diagnosed() {
        let mut data = vec![0u8; 0x100];
        let entry = ImageDebugDirectory {
            data_type: IMAGE_DEBUG_TYPE_CODEVIEW,
            size_of_data: 8,
            address_of_raw_data: DEBUG_RVA + 0x80,
            ..ImageDebugDirectory::default()
        };
        data.pwrite_with(entry, 0, scroll::LE).unwrap();
        data.pwrite_with(CODEVIEW_PDB70_MAGIC, 0x80, scroll::LE).unwrap();
        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".rdata", DEBUG_RVA, 0x100, data)],
            &[(
                DirectoryType::Debug as usize,
                DataDirectory {
                    virtual_address: DEBUG_RVA,
                    size: 28,
                },
            )],
        );
        let image =
            Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap();
        let details = load(&image, &DebugLoadOptions::default()).unwrap().unwrap();
        assert!(
            details.entries[0]
                .errors
                .has_error(DebugError::InvalidCodeViewRecord)
        );
    }
}
