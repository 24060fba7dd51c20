//! The delay-load import directory.
//!
//! Delay imports reuse the import walk: the Import Name Table plays the ILT,
//! the delay IAT plays the IAT, and an optional unload table shadows the IAT
//! in a third parallel array. Descriptors declare whether their fields are
//! RVAs (`rva_based`) or legacy VAs, which this loader translates before
//! walking.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::ErrorList;
use crate::image::Image;
use crate::image::accessor::{cstring_from_rva, struct_from_rva};
use crate::image::address::va_to_rva;
use crate::import::{ImportError, ImportLoadOptions, ImportedLibrary, walk_thunks};
use crate::packed::PackedStruct;

/// `IMAGE_DELAYLOAD_DESCRIPTOR`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_DELAYLOAD_DESCRIPTOR"))]
pub struct ImageDelayLoadDescriptor {
    /// `AllAttributes`; bit 0 selects RVA-based fields.
    pub all_attributes: u32,
    /// Library name (RVA or VA per [`Self::is_rva_based`]).
    pub name: u32,
    /// Location that receives the module handle after loading.
    pub module_handle: u32,
    /// The delay-load Import Address Table.
    pub delay_import_address_table: u32,
    /// The Import Name Table (plays the ILT role).
    pub delay_import_name_table: u32,
    /// Optional bound IAT.
    pub bound_delay_import_table: u32,
    /// Optional unload information table, parallel to the IAT.
    pub unload_delay_import_table: u32,
    /// Timestamp of the bound target; zero when not bound.
    pub time_date_stamp: u32,
}

impl ImageDelayLoadDescriptor {
    pub fn is_null(&self) -> bool {
        self.all_attributes == 0
            && self.name == 0
            && self.module_handle == 0
            && self.delay_import_address_table == 0
            && self.delay_import_name_table == 0
            && self.bound_delay_import_table == 0
            && self.unload_delay_import_table == 0
            && self.time_date_stamp == 0
    }

    /// Whether address fields are RVAs rather than legacy VAs.
    pub fn is_rva_based(&self) -> bool {
        self.all_attributes & 1 != 0
    }

    pub fn is_bound(&self) -> bool {
        self.time_date_stamp == crate::import::BOUND_LIBRARY_TIMESTAMP
    }
}

/// One delay-loaded library.
#[derive(Debug, Clone, Default)]
pub struct DelayImportedLibrary {
    pub descriptor: PackedStruct<ImageDelayLoadDescriptor>,
    /// The shared walk result: name, functions, per-entry diagnostics.
    pub library: ImportedLibrary,
}

/// The decoded delay-import directory.
#[derive(Debug, Clone, Default)]
pub struct DelayImportDirectoryDetails {
    pub libraries: Vec<DelayImportedLibrary>,
    pub errors: ErrorList<ImportError>,
}

fn field_to_rva(image: &Image, descriptor: &ImageDelayLoadDescriptor, field: u32) -> Option<u32> {
    if field == 0 {
        return None;
    }
    if descriptor.is_rva_based() {
        Some(field)
    } else {
        va_to_rva(image, u64::from(field)).ok()
    }
}

/// Loads the delay-import directory, or `None` when the image has none.
pub fn load(
    image: &Image,
    options: &ImportLoadOptions,
) -> Result<Option<DelayImportDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::DelayImport)
        .filter(|d| d.virtual_address != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let mut details = DelayImportDirectoryDetails::default();
    let mut descriptor_rva = dir.virtual_address;
    loop {
        let descriptor = match struct_from_rva::<ImageDelayLoadDescriptor>(
            image,
            descriptor_rva,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                details.errors.add_error(ImportError::InvalidThunk);
                break;
            }
        };
        descriptor_rva = descriptor_rva.wrapping_add(descriptor.packed_size() as u32);
        if descriptor.name == 0 || descriptor.is_null() {
            break;
        }

        let mut entry = DelayImportedLibrary {
            descriptor,
            ..DelayImportedLibrary::default()
        };
        entry.library.descriptor = PackedStruct::new(crate::import::ImageImportDescriptor {
            lookup_table: entry.descriptor.delay_import_name_table,
            address_table: entry.descriptor.delay_import_address_table,
            name: entry.descriptor.name,
            time_date_stamp: entry.descriptor.time_date_stamp,
            ..crate::import::ImageImportDescriptor::default()
        });

        match field_to_rva(image, &entry.descriptor, entry.descriptor.name) {
            Some(name_rva) => match cstring_from_rva(
                image,
                name_rva,
                options.include_headers,
                options.allow_virtual_data,
            ) {
                Ok(name) => {
                    if name.is_empty() {
                        entry.library.errors.add_error(ImportError::EmptyLibraryName);
                    }
                    entry.library.library_name = name;
                }
                Err(_) => entry.library.errors.add_error(ImportError::InvalidLibraryName),
            },
            None => entry.library.errors.add_error(ImportError::InvalidLibraryName),
        }
        debug!(
            "delay import descriptor for {:?}: int {:#x}, iat {:#x}",
            entry.library.library_name.as_str(),
            entry.descriptor.delay_import_name_table,
            entry.descriptor.delay_import_address_table
        );

        let address_rva =
            field_to_rva(image, &entry.descriptor, entry.descriptor.delay_import_address_table);
        let Some(address_rva) = address_rva else {
            if entry.descriptor.delay_import_name_table == 0 {
                entry.library.errors.add_error(ImportError::ZeroIatAndIlt);
            } else {
                entry.library.errors.add_error(ImportError::ZeroIat);
            }
            details.libraries.push(entry);
            continue;
        };
        let lookup_rva =
            field_to_rva(image, &entry.descriptor, entry.descriptor.delay_import_name_table);
        let unload_rva = field_to_rva(
            image,
            &entry.descriptor,
            entry.descriptor.unload_delay_import_table,
        );

        let bound = entry.descriptor.is_bound();
        walk_thunks(
            image,
            options,
            bound,
            lookup_rva,
            address_rva,
            unload_rva,
            &mut entry.library,
        );
        details.libraries.push(entry);
    }

    Ok(Some(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::data_directories::{DataDirectory, DirectoryType};
    use crate::image::ImageLoadOptions;
    use crate::import::{IMPORT_BY_ORDINAL_64, ImportKind};
    use crate::test_fixtures::{SectionSpec, synthetic_image_bytes};
    use scroll::Pwrite;

    const DIR_RVA: u32 = 0x2000;

    fn delay_image(unload_matches: bool) -> Image {
        let mut data = vec![0u8; 0x400];
        let base = DIR_RVA;
        let descriptor = ImageDelayLoadDescriptor {
            all_attributes: 1,
            name: base + 0x180,
            delay_import_address_table: base + 0x100,
            delay_import_name_table: base + 0x140,
            unload_delay_import_table: base + 0x1C0,
            ..ImageDelayLoadDescriptor::default()
        };
        data.pwrite_with(descriptor, 0, scroll::LE).unwrap();
        let thunks: [u64; 2] = [IMPORT_BY_ORDINAL_64 | 0x42, 0];
        for (i, &thunk) in thunks.iter().enumerate() {
            data.pwrite_with(thunk, 0x100 + i * 8, scroll::LE).unwrap();
            data.pwrite_with(thunk, 0x140 + i * 8, scroll::LE).unwrap();
            let unload = if unload_matches || thunk == 0 { thunk } else { thunk ^ 4 };
            data.pwrite_with(unload, 0x1C0 + i * 8, scroll::LE).unwrap();
        }
        data[0x180..0x18A].copy_from_slice(b"delay.dll\0");

        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".didat", DIR_RVA, 0x400, data)],
            &[(
                DirectoryType::DelayImport as usize,
                DataDirectory {
                    virtual_address: DIR_RVA,
                    size: 0x400,
                },
            )],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    #[test]
    fn walks_all_three_tables() {
        let image = delay_image(true);
        let delays = load(&image, &ImportLoadOptions::default()).unwrap().unwrap();
        assert_eq!(delays.libraries.len(), 1);
        let library = &delays.libraries[0].library;
        assert_eq!(library.library_name.as_str(), "delay.dll");
        assert_eq!(library.functions.len(), 1);
        assert_eq!(library.functions[0].kind, ImportKind::Ordinal(0x42));
        assert!(library.functions[0].unload.is_some());
        assert!(!library.functions[0].errors.has_errors());
    }

    #[test]
    fn unload_mismatch_is_diagnosed() {
        let image = delay_image(false);
        let delays = load(&image, &ImportLoadOptions::default()).unwrap().unwrap();
        let function = &delays.libraries[0].library.functions[0];
        assert!(
            function
                .errors
                .has_error(ImportError::AddressAndUnloadTableThunksDiffer)
        );
    }
}
