//! The bound import directory.
//!
//! A flat array of descriptors, each optionally followed by module forwarder
//! references. Name fields are 16-bit offsets relative to the start of the
//! directory, not RVAs.

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::{cstring_from_rva, struct_from_rva};
use crate::packed::{PackedCString, PackedStruct, packed_size_of};

/// `IMAGE_BOUND_IMPORT_DESCRIPTOR` (also the shape of a forwarder ref).
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_BOUND_IMPORT_DESCRIPTOR"))]
pub struct ImageBoundImportDescriptor {
    /// Timestamp the import was bound against.
    pub time_date_stamp: u32,
    /// Library name offset, relative to the directory start.
    pub offset_module_name: u16,
    /// Forwarder refs that follow this descriptor; zero for refs themselves.
    pub number_of_module_forwarder_refs: u16,
}

error_codes! {
    /// Bound import diagnostics.
    pub enum BoundImportError("bound_import_loader") {
        InvalidLibraryName => "Invalid bound import library name",
        NameOffsetOverlapsDescriptors => "Library name offset overlaps bound import descriptors",
        InvalidBoundImportEntry => "Invalid bound import entry",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct BoundImportLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
}

impl Default for BoundImportLoadOptions {
    fn default() -> Self {
        BoundImportLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
        }
    }
}

/// A forwarder reference of a bound library.
#[derive(Debug, Clone, Default)]
pub struct BoundForwarderRef {
    pub descriptor: PackedStruct<ImageBoundImportDescriptor>,
    pub library_name: PackedCString,
    pub errors: ErrorList<BoundImportError>,
}

/// One bound library and its forwarder references.
#[derive(Debug, Clone, Default)]
pub struct BoundLibrary {
    pub descriptor: PackedStruct<ImageBoundImportDescriptor>,
    pub library_name: PackedCString,
    pub references: Vec<BoundForwarderRef>,
    pub errors: ErrorList<BoundImportError>,
}

/// The decoded bound import directory.
#[derive(Debug, Clone, Default)]
pub struct BoundImportDirectoryDetails {
    pub libraries: Vec<BoundLibrary>,
    pub errors: ErrorList<BoundImportError>,
}

fn read_name(
    image: &Image,
    start_rva: u32,
    offset_module_name: u16,
    options: &BoundImportLoadOptions,
    name: &mut PackedCString,
    errors: &mut ErrorList<BoundImportError>,
) {
    if offset_module_name == 0 {
        return;
    }
    let Some(name_rva) = start_rva.checked_add(u32::from(offset_module_name)) else {
        errors.add_error(BoundImportError::InvalidLibraryName);
        return;
    };
    match cstring_from_rva(
        image,
        name_rva,
        options.include_headers,
        options.allow_virtual_data,
    ) {
        Ok(value) => *name = value,
        Err(_) => errors.add_error(BoundImportError::InvalidLibraryName),
    }
}

/// Loads the bound import directory, or `None` when the image has none.
pub fn load(
    image: &Image,
    options: &BoundImportLoadOptions,
) -> Result<Option<BoundImportDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::BoundImport)
        .filter(|d| d.virtual_address != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let start_rva = dir.virtual_address;
    let descriptor_size = packed_size_of::<ImageBoundImportDescriptor>() as u32;
    let mut details = BoundImportDirectoryDetails::default();
    let mut current_rva = start_rva;
    let mut descriptor_count = 0u32;

    'outer: loop {
        let descriptor = match struct_from_rva::<ImageBoundImportDescriptor>(
            image,
            current_rva,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                details
                    .errors
                    .add_error(BoundImportError::InvalidBoundImportEntry);
                break;
            }
        };
        current_rva = current_rva.wrapping_add(descriptor_size);
        descriptor_count += 1;
        if descriptor.offset_module_name == 0 {
            break;
        }

        let mut library = BoundLibrary {
            descriptor,
            ..BoundLibrary::default()
        };
        read_name(
            image,
            start_rva,
            library.descriptor.offset_module_name,
            options,
            &mut library.library_name,
            &mut library.errors,
        );

        for _ in 0..library.descriptor.number_of_module_forwarder_refs {
            let mut reference = BoundForwarderRef::default();
            match struct_from_rva::<ImageBoundImportDescriptor>(
                image,
                current_rva,
                options.include_headers,
                options.allow_virtual_data,
            ) {
                Ok(descriptor) => reference.descriptor = descriptor,
                Err(_) => {
                    reference
                        .errors
                        .add_error(BoundImportError::InvalidBoundImportEntry);
                    library.references.push(reference);
                    details.libraries.push(library);
                    break 'outer;
                }
            }
            current_rva = current_rva.wrapping_add(descriptor_size);
            descriptor_count += 1;
            read_name(
                image,
                start_rva,
                reference.descriptor.offset_module_name,
                options,
                &mut reference.library_name,
                &mut reference.errors,
            );
            library.references.push(reference);
        }
        details.libraries.push(library);
    }

    // Names must not overlap the descriptor array (terminator included).
    let descriptors_end_offset = descriptor_count.saturating_mul(descriptor_size);
    for library in &mut details.libraries {
        if !library.errors.has_errors()
            && u32::from(library.descriptor.offset_module_name) < descriptors_end_offset
        {
            library
                .errors
                .add_error(BoundImportError::NameOffsetOverlapsDescriptors);
        }
        for reference in &mut library.references {
            if !reference.errors.has_errors()
                && reference.descriptor.offset_module_name != 0
                && u32::from(reference.descriptor.offset_module_name) < descriptors_end_offset
            {
                reference
                    .errors
                    .add_error(BoundImportError::NameOffsetOverlapsDescriptors);
            }
        }
    }

    Ok(Some(details))
}
