//! The import directory.
//!
//! Each imported library is a descriptor plus two parallel thunk arrays: the
//! Import Lookup Table names what is wanted, the Import Address Table is
//! where the loader patches resolved addresses. On disk the two normally
//! agree entry for entry; they legitimately disagree when the library is
//! bound (the IAT then holds pre-resolved VAs) or the image was captured
//! from memory. Delay imports reuse the same walk through
//! [`crate::delay_import`], adding a third parallel unload table.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::{cstring_from_rva, struct_from_rva};
use crate::packed::{PackedCString, PackedStruct};

/// Ordinal flag of a PE32 thunk.
pub const IMPORT_BY_ORDINAL_32: u32 = 0x8000_0000;
/// Ordinal flag of a PE32+ thunk.
pub const IMPORT_BY_ORDINAL_64: u64 = 0x8000_0000_0000_0000;
/// A bound library's descriptor carries this timestamp.
pub const BOUND_LIBRARY_TIMESTAMP: u32 = 0xFFFF_FFFF;

/// `IMAGE_IMPORT_DESCRIPTOR`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_IMPORT_DESCRIPTOR"))]
pub struct ImageImportDescriptor {
    /// RVA of the Import Lookup Table (aka `OriginalFirstThunk`); zero in
    /// old borland-style images.
    pub lookup_table: u32,
    /// `0xFFFFFFFF` when bound.
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    /// RVA of the library name.
    pub name: u32,
    /// RVA of the Import Address Table (aka `FirstThunk`).
    pub address_table: u32,
}

impl ImageImportDescriptor {
    pub fn is_null(&self) -> bool {
        self.lookup_table == 0
            && self.time_date_stamp == 0
            && self.forwarder_chain == 0
            && self.name == 0
            && self.address_table == 0
    }

    pub fn is_bound(&self) -> bool {
        self.time_date_stamp == BOUND_LIBRARY_TIMESTAMP
    }
}

error_codes! {
    /// Import and delay-import diagnostics.
    pub enum ImportError("import_loader") {
        InvalidLibraryName => "Imported library name cannot be read",
        EmptyLibraryName => "Imported library name is empty",
        ZeroIat => "Import descriptor has no import address table",
        ZeroIatAndIlt => "Import descriptor has neither lookup nor address table",
        InvalidThunk => "Import thunk cannot be read",
        InvalidImportName => "Import hint/name entry cannot be read",
        LookupAndAddressTableThunksDiffer => "Lookup and address table thunks differ",
        AddressAndUnloadTableThunksDiffer => "Address and unload table thunks differ",
        TooManyImports => "Number of imported functions exceeds the configured limit",
        InvalidUnloadTable => "Delay-import unload table cannot be read",
    }
}

/// Options for [`load`] (and, via delegation, the delay-import loader).
#[derive(Debug, Copy, Clone)]
pub struct ImportLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    /// Cap on thunks walked per library.
    pub max_number_of_imports: u32,
}

impl Default for ImportLoadOptions {
    fn default() -> Self {
        ImportLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            max_number_of_imports: 0x1_0000,
        }
    }
}

/// What one thunk asks for.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ImportKind {
    /// The thunk could not be classified (read failure).
    #[default]
    Unresolved,
    /// Import by ordinal: the low 16 bits of the thunk.
    Ordinal(u16),
    /// Import by hint and name.
    Name {
        hint: PackedStruct<u16>,
        name: PackedCString,
    },
}

/// One walked thunk pair (triple for delay imports).
#[derive(Debug, Clone, Default)]
pub struct ImportedFunction {
    /// ILT thunk, widened to 64 bits; provenance reflects the real width.
    pub lookup: Option<PackedStruct<u64>>,
    /// IAT thunk, widened to 64 bits.
    pub address: Option<PackedStruct<u64>>,
    /// Unload-table thunk (delay imports only).
    pub unload: Option<PackedStruct<u64>>,
    pub kind: ImportKind,
    /// Resolved VA recorded from the IAT of a bound library.
    pub imported_va: Option<u64>,
    pub errors: ErrorList<ImportError>,
}

/// One imported library and its walked thunks.
#[derive(Debug, Clone, Default)]
pub struct ImportedLibrary {
    pub descriptor: PackedStruct<ImageImportDescriptor>,
    pub library_name: PackedCString,
    pub functions: Vec<ImportedFunction>,
    pub errors: ErrorList<ImportError>,
}

impl ImportedLibrary {
    pub fn is_bound(&self) -> bool {
        self.descriptor.is_bound()
    }
}

/// The decoded import directory.
#[derive(Debug, Clone, Default)]
pub struct ImportDirectoryDetails {
    pub libraries: Vec<ImportedLibrary>,
    pub errors: ErrorList<ImportError>,
}

/// Reads one thunk of the image's width, widened to 64 bits.
pub(crate) fn thunk_from_rva(
    image: &Image,
    rva: u32,
    options: &ImportLoadOptions,
) -> Result<PackedStruct<u64>> {
    if image.is_64bit() {
        struct_from_rva::<u64>(image, rva, options.include_headers, options.allow_virtual_data)
    } else {
        let narrow = struct_from_rva::<u32>(
            image,
            rva,
            options.include_headers,
            options.allow_virtual_data,
        )?;
        let mut wide = PackedStruct::<u64>::new(u64::from(*narrow));
        wide.copy_metadata_from(narrow.state());
        Ok(wide)
    }
}

pub(crate) fn thunk_size(image: &Image) -> u32 {
    if image.is_64bit() { 8 } else { 4 }
}

pub(crate) fn is_ordinal_thunk(image: &Image, thunk: u64) -> bool {
    if image.is_64bit() {
        thunk & IMPORT_BY_ORDINAL_64 != 0
    } else {
        (thunk as u32) & IMPORT_BY_ORDINAL_32 != 0
    }
}

/// Classifies a thunk: ordinal when the top bit is set, hint/name otherwise.
pub(crate) fn classify_thunk(
    image: &Image,
    thunk: u64,
    options: &ImportLoadOptions,
    errors: &mut ErrorList<ImportError>,
) -> ImportKind {
    if is_ordinal_thunk(image, thunk) {
        return ImportKind::Ordinal(thunk as u16);
    }
    let hint_name_rva = thunk as u32;
    let hint = match struct_from_rva::<u16>(
        image,
        hint_name_rva,
        options.include_headers,
        options.allow_virtual_data,
    ) {
        Ok(hint) => hint,
        Err(_) => {
            errors.add_error(ImportError::InvalidImportName);
            return ImportKind::Unresolved;
        }
    };
    match cstring_from_rva(
        image,
        hint_name_rva.wrapping_add(2),
        options.include_headers,
        options.allow_virtual_data,
    ) {
        Ok(name) => ImportKind::Name { hint, name },
        Err(_) => {
            errors.add_error(ImportError::InvalidImportName);
            ImportKind::Unresolved
        }
    }
}

/// Walks the parallel thunk arrays of one library.
///
/// `lookup_rva` and `unload_rva` may be absent; `address_rva` drives
/// termination when the lookup table is missing.
pub(crate) fn walk_thunks(
    image: &Image,
    options: &ImportLoadOptions,
    bound: bool,
    lookup_rva: Option<u32>,
    address_rva: u32,
    unload_rva: Option<u32>,
    library: &mut ImportedLibrary,
) {
    let step = thunk_size(image);
    for index in 0..options.max_number_of_imports {
        let offset = index * step;
        let lookup = match lookup_rva {
            Some(rva) => match thunk_from_rva(image, rva.wrapping_add(offset), options) {
                Ok(thunk) => Some(thunk),
                Err(_) => {
                    library.errors.add_error(ImportError::InvalidThunk);
                    return;
                }
            },
            None => None,
        };
        let address = match thunk_from_rva(image, address_rva.wrapping_add(offset), options) {
            Ok(thunk) => Some(thunk),
            Err(_) => {
                library.errors.add_error(ImportError::InvalidThunk);
                return;
            }
        };
        let unload = unload_rva.and_then(|rva| {
            match thunk_from_rva(image, rva.wrapping_add(offset), options) {
                Ok(thunk) => Some(thunk),
                Err(_) => {
                    library.errors.add_error(ImportError::InvalidUnloadTable);
                    None
                }
            }
        });

        let lookup_value = lookup.as_ref().map(|t| **t);
        let address_value = address.as_ref().map(|t| **t).unwrap_or(0);
        match lookup_value {
            Some(0) if address_value == 0 => return,
            None if address_value == 0 => return,
            _ => {}
        }

        let mut function = ImportedFunction {
            lookup,
            address,
            unload,
            ..ImportedFunction::default()
        };

        // The lookup table names the import; a bound IAT holds resolved VAs.
        let classifying = lookup_value.unwrap_or(address_value);
        function.kind = classify_thunk(image, classifying, options, &mut function.errors);
        if bound && lookup_value.is_some() {
            function.imported_va = Some(address_value);
        }

        if let Some(lookup_value) = lookup_value {
            if !bound
                && !image.loaded_to_memory
                && lookup_value != address_value
            {
                function
                    .errors
                    .add_error(ImportError::LookupAndAddressTableThunksDiffer);
            }
        }
        if let Some(unload) = &function.unload {
            if **unload != address_value && **unload != 0 {
                function
                    .errors
                    .add_error(ImportError::AddressAndUnloadTableThunksDiffer);
            }
        }

        library.functions.push(function);
    }
    library.errors.add_error(ImportError::TooManyImports);
}

/// Loads the import directory, or `None` when the image has none.
pub fn load(image: &Image, options: &ImportLoadOptions) -> Result<Option<ImportDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::Imports)
        .filter(|d| d.virtual_address != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let mut details = ImportDirectoryDetails::default();
    let mut descriptor_rva = dir.virtual_address;
    loop {
        let descriptor = match struct_from_rva::<ImageImportDescriptor>(
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

        let mut library = ImportedLibrary {
            descriptor,
            ..ImportedLibrary::default()
        };
        match cstring_from_rva(
            image,
            library.descriptor.name,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(name) => {
                if name.is_empty() {
                    library.errors.add_error(ImportError::EmptyLibraryName);
                }
                library.library_name = name;
            }
            Err(_) => library.errors.add_error(ImportError::InvalidLibraryName),
        }
        debug!(
            "import descriptor for {:?}: ilt {:#x}, iat {:#x}",
            library.library_name.as_str(),
            library.descriptor.lookup_table,
            library.descriptor.address_table
        );

        if library.descriptor.address_table == 0 {
            if library.descriptor.lookup_table == 0 {
                library.errors.add_error(ImportError::ZeroIatAndIlt);
            } else {
                library.errors.add_error(ImportError::ZeroIat);
            }
            details.libraries.push(library);
            continue;
        }

        let bound = library.descriptor.is_bound();
        let lookup_rva = match library.descriptor.lookup_table {
            0 => None,
            rva => Some(rva),
        };
        let address_table = library.descriptor.address_table;
        walk_thunks(
            image,
            options,
            bound,
            lookup_rva,
            address_table,
            None,
            &mut library,
        );
        details.libraries.push(library);
    }

    Ok(Some(details))
}
