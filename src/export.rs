//! The export directory.
//!
//! Exports come in three flavors: plain address exports, named exports (one
//! address may carry several names), and forwarders, whose address-table
//! entry points back inside the export directory at a `dll.symbol` string.
//! The loader reports every symbol it can see together with per-symbol
//! diagnostics; the editor operations let callers grow a directory without
//! touching any bytes.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::{cstring_from_rva, rva_is_resolvable, struct_from_rva};
use crate::packed::{PackedCString, PackedStruct};

/// `IMAGE_EXPORT_DIRECTORY`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_EXPORT_DIRECTORY"))]
pub struct ImageExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// RVA of the exporting module's name.
    pub name: u32,
    /// Ordinal base added to address-table indices.
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

error_codes! {
    /// Export directory diagnostics.
    pub enum ExportError("export_loader") {
        InvalidLibraryName => "Invalid exported library name",
        InvalidAddressList => "Unable to read the export address table",
        InvalidNameList => "Unable to read the export name or name-ordinal table",
        InvalidRva => "Exported RVA does not map into the image",
        InvalidForwardedName => "Invalid forwarded export name",
        InvalidNameOrdinal => "Export name ordinal does not select an address table entry",
        InvalidNameRva => "Export name RVA cannot be read",
        EmptyName => "Exported name is empty",
        UnsortedNames => "Export name table is not lexicographically sorted",
        TooManyFunctions => "Number of exported functions exceeds the configured limit",
        TooManyNames => "Number of exported names exceeds the configured limit",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct ExportLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    /// Cap on address-table entries walked.
    pub max_number_of_functions: u32,
    /// Cap on name-table entries walked.
    pub max_number_of_names: u32,
}

impl Default for ExportLoadOptions {
    fn default() -> Self {
        ExportLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            max_number_of_functions: 0x1_0000,
            max_number_of_names: 0x1_0000,
        }
    }
}

/// One entry of the export name table, attached to its symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportedName {
    pub name: PackedCString,
    pub name_rva: PackedStruct<u32>,
    pub name_ordinal: PackedStruct<u16>,
}

/// One address-table entry and everything hanging off it.
#[derive(Debug, Clone, Default)]
pub struct ExportedSymbol {
    /// Zero-based index into the address table; the exported ordinal is
    /// `directory.base + rva_ordinal`.
    pub rva_ordinal: u32,
    pub rva: PackedStruct<u32>,
    /// `dll.symbol` target when this entry forwards.
    pub forwarded_name: Option<PackedCString>,
    pub names: Vec<ExportedName>,
    pub errors: ErrorList<ExportError>,
}

impl ExportedSymbol {
    pub fn is_forwarded(&self) -> bool {
        self.forwarded_name.is_some()
    }
}

/// The decoded export directory.
#[derive(Debug, Clone, Default)]
pub struct ExportDirectoryDetails {
    pub descriptor: PackedStruct<ImageExportDirectory>,
    pub library_name: PackedCString,
    pub symbols: Vec<ExportedSymbol>,
    pub errors: ErrorList<ExportError>,
}

impl ExportDirectoryDetails {
    /// The symbol at address-table index `rva_ordinal`.
    pub fn symbol_by_ordinal(&self, rva_ordinal: u32) -> Option<&ExportedSymbol> {
        self.symbols.iter().find(|s| s.rva_ordinal == rva_ordinal)
    }

    pub fn symbol_by_ordinal_mut(&mut self, rva_ordinal: u32) -> Option<&mut ExportedSymbol> {
        self.symbols.iter_mut().find(|s| s.rva_ordinal == rva_ordinal)
    }

    /// The first symbol carrying `name`.
    pub fn symbol_by_name(&self, name: &str) -> Option<&ExportedSymbol> {
        self.symbols
            .iter()
            .find(|s| s.names.iter().any(|n| n.name.as_str() == name))
    }

    /// Registers a plain address export at `rva_ordinal`.
    pub fn add(&mut self, rva_ordinal: u32, rva: u32) -> &mut ExportedSymbol {
        let index = match self.symbols.iter().position(|s| s.rva_ordinal == rva_ordinal) {
            Some(index) => index,
            None => {
                self.symbols.push(ExportedSymbol {
                    rva_ordinal,
                    ..ExportedSymbol::default()
                });
                self.symbols.len() - 1
            }
        };
        let symbol = &mut self.symbols[index];
        symbol.rva = PackedStruct::new(rva);
        symbol.forwarded_name = None;
        symbol
    }

    /// Registers a named export at `rva_ordinal`.
    pub fn add_named(&mut self, rva_ordinal: u32, name: &str, rva: u32) -> &mut ExportedSymbol {
        let symbol = self.add(rva_ordinal, rva);
        symbol.names.push(ExportedName {
            name: PackedCString::new(name),
            ..ExportedName::default()
        });
        symbol
    }

    /// Registers a named forwarder at `rva_ordinal`.
    pub fn add_forwarded(
        &mut self,
        rva_ordinal: u32,
        name: &str,
        forwarded_name: &str,
    ) -> &mut ExportedSymbol {
        let symbol = self.add_named(rva_ordinal, name, 0);
        symbol.forwarded_name = Some(PackedCString::new(forwarded_name));
        symbol
    }

    /// The lowest address-table index not yet in use.
    pub fn get_first_free_ordinal(&self) -> Result<u32> {
        let mut used: Vec<u32> = self.symbols.iter().map(|s| s.rva_ordinal).collect();
        used.sort_unstable();
        used.dedup();
        let mut expected = 0u32;
        for ordinal in used {
            if ordinal != expected {
                return Ok(expected);
            }
            expected = expected.checked_add(1).ok_or_else(|| {
                Error::Malformed("export ordinal space is saturated".into())
            })?;
        }
        Ok(expected)
    }

    /// One past the highest address-table index in use.
    pub fn get_last_free_ordinal(&self) -> Result<u32> {
        match self.symbols.iter().map(|s| s.rva_ordinal).max() {
            None => Ok(0),
            Some(max) => max.checked_add(1).ok_or_else(|| {
                Error::Malformed("export ordinal space is saturated".into())
            }),
        }
    }
}

/// Loads the export directory, or `None` when the image has none.
pub fn load(image: &Image, options: &ExportLoadOptions) -> Result<Option<ExportDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::Exports)
        .filter(|d| d.virtual_address != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let mut details = ExportDirectoryDetails {
        descriptor: struct_from_rva::<ImageExportDirectory>(
            image,
            dir.virtual_address,
            options.include_headers,
            options.allow_virtual_data,
        )?,
        ..ExportDirectoryDetails::default()
    };
    let descriptor = *details.descriptor;
    debug!(
        "export directory: {} functions, {} names",
        descriptor.number_of_functions, descriptor.number_of_names
    );

    match cstring_from_rva(
        image,
        descriptor.name,
        options.include_headers,
        options.allow_virtual_data,
    ) {
        Ok(name) => details.library_name = name,
        Err(_) => details.errors.add_error(ExportError::InvalidLibraryName),
    }

    let dir_start = dir.virtual_address;
    let dir_end = dir.virtual_address.saturating_add(dir.size);

    let mut function_count = descriptor.number_of_functions;
    if function_count > options.max_number_of_functions {
        details.errors.add_error(ExportError::TooManyFunctions);
        function_count = options.max_number_of_functions;
    }
    for i in 0..function_count {
        let entry_rva = descriptor.address_of_functions.wrapping_add(i * 4);
        let rva = match struct_from_rva::<u32>(
            image,
            entry_rva,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(rva) => rva,
            Err(_) => {
                details.errors.add_error(ExportError::InvalidAddressList);
                break;
            }
        };
        if *rva == 0 {
            continue;
        }
        let mut symbol = ExportedSymbol {
            rva_ordinal: i,
            rva,
            ..ExportedSymbol::default()
        };
        if *symbol.rva >= dir_start && *symbol.rva < dir_end {
            match cstring_from_rva(
                image,
                *symbol.rva,
                options.include_headers,
                options.allow_virtual_data,
            ) {
                Ok(name) => symbol.forwarded_name = Some(name),
                Err(_) => symbol.errors.add_error(ExportError::InvalidForwardedName),
            }
        } else if !rva_is_resolvable(image, *symbol.rva, options.include_headers) {
            symbol.errors.add_error(ExportError::InvalidRva);
        }
        details.symbols.push(symbol);
    }

    let mut name_count = descriptor.number_of_names;
    if name_count > options.max_number_of_names {
        details.errors.add_error(ExportError::TooManyNames);
        name_count = options.max_number_of_names;
    }
    let mut previous_name: Option<String> = None;
    for i in 0..name_count {
        let name_ordinal = match struct_from_rva::<u16>(
            image,
            descriptor.address_of_name_ordinals.wrapping_add(i * 2),
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(ordinal) => ordinal,
            Err(_) => {
                details.errors.add_error(ExportError::InvalidNameList);
                break;
            }
        };
        if u32::from(*name_ordinal) >= descriptor.number_of_functions {
            details
                .errors
                .add_error_with_index(ExportError::InvalidNameOrdinal, i as usize);
            continue;
        }
        let name_rva = match struct_from_rva::<u32>(
            image,
            descriptor.address_of_names.wrapping_add(i * 4),
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(rva) => rva,
            Err(_) => {
                details.errors.add_error(ExportError::InvalidNameList);
                break;
            }
        };
        let name = match cstring_from_rva(
            image,
            *name_rva,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(name) => name,
            Err(_) => {
                details
                    .errors
                    .add_error_with_index(ExportError::InvalidNameRva, i as usize);
                continue;
            }
        };

        if let Some(prev) = &previous_name {
            if !details.errors.has_error(ExportError::UnsortedNames)
                && name.as_str() < prev.as_str()
            {
                details.errors.add_error(ExportError::UnsortedNames);
            }
        }
        previous_name = Some(name.as_str().to_owned());

        let ordinal = u32::from(*name_ordinal);
        match details.symbol_by_ordinal_mut(ordinal) {
            Some(symbol) => {
                if name.is_empty() {
                    symbol.errors.add_error(ExportError::EmptyName);
                }
                symbol.names.push(ExportedName {
                    name,
                    name_rva,
                    name_ordinal,
                });
            }
            None => {
                details
                    .errors
                    .add_error_with_index(ExportError::InvalidNameOrdinal, i as usize);
            }
        }
    }

    Ok(Some(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::data_directories::{DataDirectory, DirectoryType};
    use crate::image::ImageLoadOptions;
    use crate::packed::packed_size_of;
    use crate::test_fixtures::{SectionSpec, synthetic_image_bytes};
    use scroll::Pwrite;

    const EXPORT_RVA: u32 = 0x2000;

    /// Lays out an export directory at `EXPORT_RVA` inside a `.edata` section:
    /// descriptor, then address table, name table, ordinal table, strings.
    fn export_image(names_sorted: bool) -> Image {
        let mut data = vec![0u8; 0x400];
        let base = EXPORT_RVA;
        let descriptor = ImageExportDirectory {
            name: base + 0x100,
            base: 1,
            number_of_functions: 4,
            number_of_names: 2,
            address_of_functions: base + 0x40,
            address_of_names: base + 0x60,
            address_of_name_ordinals: base + 0x70,
            ..ImageExportDirectory::default()
        };
        data.pwrite_with(descriptor, 0, scroll::LE).unwrap();
        // Address table: ordinal 0 → code rva, 1 → zero (hole), 2 → forwarder,
        // 3 → unmapped.
        data.pwrite_with(0x1000u32, 0x40, scroll::LE).unwrap();
        data.pwrite_with(0u32, 0x44, scroll::LE).unwrap();
        data.pwrite_with(base + 0x120, 0x48, scroll::LE).unwrap();
        data.pwrite_with(0x9_0000u32, 0x4C, scroll::LE).unwrap();
        // Name table + ordinal table.
        let (first, second) = if names_sorted {
            (base + 0x140, base + 0x150)
        } else {
            (base + 0x150, base + 0x140)
        };
        data.pwrite_with(first, 0x60, scroll::LE).unwrap();
        data.pwrite_with(second, 0x64, scroll::LE).unwrap();
        data.pwrite_with(0u16, 0x70, scroll::LE).unwrap();
        data.pwrite_with(2u16, 0x72, scroll::LE).unwrap();
        // Strings.
        data[0x100..0x108].copy_from_slice(b"lib.dll\0");
        data[0x120..0x12E].copy_from_slice(b"other.fwdsym\0\0");
        data[0x140..0x146].copy_from_slice(b"alpha\0");
        data[0x150..0x155].copy_from_slice(b"beta\0");

        let bytes = synthetic_image_bytes(
            true,
            &[
                SectionSpec::new(".text", 0x1000, 0x200, vec![0xC3; 0x200]),
                SectionSpec::new(".edata", EXPORT_RVA, 0x400, data),
            ],
            &[(
                DirectoryType::Exports as usize,
                DataDirectory {
                    virtual_address: EXPORT_RVA,
                    size: 0x400,
                },
            )],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    #[test]
    fn absent_directory_is_none() {
        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".text", 0x1000, 0x200, vec![0; 0x200])],
            &[],
        );
        let image =
            Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap();
        assert!(load(&image, &ExportLoadOptions::default()).unwrap().is_none());
    }

    #[test]
    fn decodes_symbols_names_and_forwarders() {
        let image = export_image(true);
        let exports = load(&image, &ExportLoadOptions::default()).unwrap().unwrap();
        assert_eq!(exports.library_name.as_str(), "lib.dll");
        // The zero entry at ordinal 1 is skipped.
        assert_eq!(exports.symbols.len(), 3);

        let plain = exports.symbol_by_ordinal(0).unwrap();
        assert_eq!(*plain.rva, 0x1000);
        assert_eq!(plain.names.len(), 1);
        assert_eq!(plain.names[0].name.as_str(), "alpha");

        let forwarded = exports.symbol_by_ordinal(2).unwrap();
        assert!(forwarded.is_forwarded());
        assert_eq!(
            forwarded.forwarded_name.as_ref().unwrap().as_str(),
            "other.fwdsym"
        );
        assert_eq!(exports.symbol_by_name("beta").unwrap().rva_ordinal, 2);

        let unmapped = exports.symbol_by_ordinal(3).unwrap();
        assert!(unmapped.errors.has_error(ExportError::InvalidRva));

        assert!(!exports.errors.has_error(ExportError::UnsortedNames));
        assert_eq!(packed_size_of::<ImageExportDirectory>(), 40);
    }

    #[test]
    fn diagnoses_unsorted_names() {
        let image = export_image(false);
        let exports = load(&image, &ExportLoadOptions::default()).unwrap().unwrap();
        assert!(exports.errors.has_error(ExportError::UnsortedNames));
    }

    #[test]
    fn function_cap_truncates_with_a_diagnostic() {
        let image = export_image(true);
        let options = ExportLoadOptions {
            max_number_of_functions: 1,
            ..ExportLoadOptions::default()
        };
        let exports = load(&image, &options).unwrap().unwrap();
        assert_eq!(exports.symbols.len(), 1);
        assert!(exports.errors.has_error(ExportError::TooManyFunctions));
    }

    #[test]
    fn editor_roundtrip() {
        let mut exports = ExportDirectoryDetails::default();
        exports.library_name = PackedCString::new("lib");
        exports.add(0, 0x123);
        exports.add_named(3, "name2", 0x456);
        exports.add_forwarded(2, "name3", "fwd_name3");

        let by_name = exports.symbol_by_name("name2").unwrap();
        assert_eq!(by_name.rva_ordinal, 3);
        assert_eq!(*by_name.rva, 0x456);
        assert_eq!(exports.get_first_free_ordinal().unwrap(), 1);
        assert_eq!(exports.get_last_free_ordinal().unwrap(), 4);
        assert!(
            exports
                .symbol_by_ordinal(2)
                .unwrap()
                .forwarded_name
                .as_ref()
                .is_some_and(|f| f.as_str() == "fwd_name3")
        );
    }

    #[test]
    fn free_ordinals_on_empty_directory() {
        let exports = ExportDirectoryDetails::default();
        assert_eq!(exports.get_first_free_ordinal().unwrap(), 0);
        assert_eq!(exports.get_last_free_ordinal().unwrap(), 0);
    }
}
