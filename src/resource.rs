//! The resource directory tree.
//!
//! Resources form a three-level tree by convention (type / name / language),
//! though nothing stops an image from nesting deeper or looping. Entry
//! offsets are relative to the start of the resource directory, with the
//! high bit selecting "subdirectory" over "leaf data". Cycles are broken by
//! a visited set: a repeated subdirectory offset is recorded as a bare
//! back-reference instead of recursing.

pub mod accelerator;
pub mod bitmap;
pub mod message_table;
pub mod string_table;

use std::collections::HashSet;

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::{byte_vector_from_rva, struct_from_rva};
use crate::packed::{PackedByteVector, PackedStruct, packed_size_of};

/// Windows resource type identifier for cursors.
pub const RT_CURSOR: u16 = 1;
/// Windows resource type identifier for bitmaps.
pub const RT_BITMAP: u16 = 2;
/// Windows resource type identifier for icons.
pub const RT_ICON: u16 = 3;
/// Windows resource type identifier for menus.
pub const RT_MENU: u16 = 4;
/// Windows resource type identifier for dialog boxes.
pub const RT_DIALOG: u16 = 5;
/// Windows resource type identifier for string tables.
pub const RT_STRING: u16 = 6;
/// Windows resource type identifier for accelerators.
pub const RT_ACCELERATOR: u16 = 9;
/// Windows resource type identifier for raw data.
pub const RT_RCDATA: u16 = 10;
/// Windows resource type identifier for message tables.
pub const RT_MESSAGETABLE: u16 = 11;
/// Windows resource type identifier for version information.
pub const RT_VERSION: u16 = 16;
/// Windows resource type identifier for manifests.
pub const RT_MANIFEST: u16 = 24;

/// High bit of `name_or_id`: the name is a string.
pub const IMAGE_RESOURCE_NAME_IS_STRING: u32 = 0x8000_0000;
/// High bit of `offset_to_data`: the target is a subdirectory.
pub const IMAGE_RESOURCE_DATA_IS_DIRECTORY: u32 = 0x8000_0000;
/// Mask extracting the offset or id from either field.
pub const IMAGE_RESOURCE_MASK: u32 = 0x7FFF_FFFF;

/// `IMAGE_RESOURCE_DIRECTORY`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_RESOURCE_DIRECTORY"))]
pub struct ImageResourceDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// Named entries precede id entries.
    pub number_of_named_entries: u16,
    pub number_of_id_entries: u16,
}

/// `IMAGE_RESOURCE_DIRECTORY_ENTRY`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_RESOURCE_DIRECTORY_ENTRY"))]
pub struct ImageResourceDirectoryEntry {
    /// Id, or directory-relative offset of a length-prefixed UTF-16 name.
    pub name_or_id: u32,
    /// Directory-relative offset of a subdirectory or data entry.
    pub offset_to_data: u32,
}

impl ImageResourceDirectoryEntry {
    pub fn is_string_name(&self) -> bool {
        self.name_or_id & IMAGE_RESOURCE_NAME_IS_STRING != 0
    }

    pub fn is_directory(&self) -> bool {
        self.offset_to_data & IMAGE_RESOURCE_DATA_IS_DIRECTORY != 0
    }

    pub fn target_offset(&self) -> u32 {
        self.offset_to_data & IMAGE_RESOURCE_MASK
    }
}

/// `IMAGE_RESOURCE_DATA_ENTRY`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_RESOURCE_DATA_ENTRY"))]
pub struct ImageResourceDataEntry {
    /// RVA of the raw data (not directory-relative).
    pub offset_to_data: u32,
    pub size: u32,
    pub code_page: u32,
    pub reserved: u32,
}

error_codes! {
    /// Resource tree diagnostics.
    pub enum ResourceError("resource_reader") {
        InvalidDirectory => "Resource directory cannot be read",
        InvalidDirectoryEntry => "Resource directory entry cannot be read",
        InvalidEntryName => "Resource entry name cannot be read",
        InvalidDataEntry => "Resource data entry cannot be read",
        InvalidData => "Resource raw data cannot be read",
        LoopedDirectory => "Resource subdirectory offset was already visited",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct ResourceLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    /// Capture leaf raw data, not just the data entries.
    pub load_raw_data: bool,
}

impl Default for ResourceLoadOptions {
    fn default() -> Self {
        ResourceLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            load_raw_data: true,
        }
    }
}

/// How an entry is addressed.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceName {
    Id(u32),
    Name(String),
}

/// What an entry points at.
#[derive(Debug, Clone)]
pub enum ResourceNode {
    Directory(ResourceDirectory),
    Data(ResourceDataEntry),
    /// A back-edge: the directory-relative offset of an already visited
    /// subdirectory.
    LoopedDirectory(u32),
    /// Nothing decodable.
    Invalid,
}

/// A leaf: the data entry and, when requested, the raw bytes.
#[derive(Debug, Clone, Default)]
pub struct ResourceDataEntry {
    pub descriptor: PackedStruct<ImageResourceDataEntry>,
    pub data: Option<PackedByteVector>,
    pub errors: ErrorList<ResourceError>,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub descriptor: PackedStruct<ImageResourceDirectoryEntry>,
    pub name: ResourceName,
    pub node: ResourceNode,
    pub errors: ErrorList<ResourceError>,
}

/// One directory level of the tree.
#[derive(Debug, Clone, Default)]
pub struct ResourceDirectory {
    pub descriptor: PackedStruct<ImageResourceDirectory>,
    pub entries: Vec<ResourceEntry>,
    pub errors: ErrorList<ResourceError>,
}

impl ResourceDirectory {
    /// The entry with numeric id `id`.
    pub fn entry_by_id(&self, id: u32) -> Option<&ResourceEntry> {
        self.entries
            .iter()
            .find(|e| matches!(&e.name, ResourceName::Id(i) if *i == id))
    }

    /// The entry named `name`.
    pub fn entry_by_name(&self, name: &str) -> Option<&ResourceEntry> {
        self.entries
            .iter()
            .find(|e| matches!(&e.name, ResourceName::Name(n) if n == name))
    }
}

/// The decoded resource directory.
#[derive(Debug, Clone, Default)]
pub struct ResourceDirectoryDetails {
    pub root: ResourceDirectory,
    pub errors: ErrorList<ResourceError>,
}

impl ResourceDirectoryDetails {
    /// Walks type / name-or-id / first-language to a leaf's data entry.
    pub fn first_leaf_of_type(&self, type_id: u16) -> Option<&ResourceDataEntry> {
        fn first_leaf(dir: &ResourceDirectory) -> Option<&ResourceDataEntry> {
            for entry in &dir.entries {
                match &entry.node {
                    ResourceNode::Data(data) => return Some(data),
                    ResourceNode::Directory(sub) => {
                        if let Some(found) = first_leaf(sub) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        match &self.root.entry_by_id(u32::from(type_id))?.node {
            ResourceNode::Directory(sub) => first_leaf(sub),
            ResourceNode::Data(data) => Some(data),
            _ => None,
        }
    }
}

/// Reads a length-prefixed UTF-16 directory string.
fn name_at(image: &Image, rva: u32, options: &ResourceLoadOptions) -> Result<String> {
    let length = struct_from_rva::<u16>(
        image,
        rva,
        options.include_headers,
        options.allow_virtual_data,
    )?;
    let mut units = Vec::with_capacity(usize::from(*length));
    for i in 0..u32::from(*length) {
        let unit = struct_from_rva::<u16>(
            image,
            rva.wrapping_add(2 + i * 2),
            options.include_headers,
            options.allow_virtual_data,
        )?;
        units.push(*unit);
    }
    Ok(String::from_utf16_lossy(&units))
}

fn parse_data_entry(
    image: &Image,
    root_rva: u32,
    offset: u32,
    options: &ResourceLoadOptions,
) -> ResourceNode {
    let mut data_entry = ResourceDataEntry::default();
    match struct_from_rva::<ImageResourceDataEntry>(
        image,
        root_rva.wrapping_add(offset),
        options.include_headers,
        options.allow_virtual_data,
    ) {
        Ok(descriptor) => data_entry.descriptor = descriptor,
        Err(_) => {
            data_entry.errors.add_error(ResourceError::InvalidDataEntry);
            return ResourceNode::Data(data_entry);
        }
    }
    if options.load_raw_data && data_entry.descriptor.size != 0 {
        match byte_vector_from_rva(
            image,
            data_entry.descriptor.offset_to_data,
            data_entry.descriptor.size as usize,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(data) => data_entry.data = Some(data),
            Err(_) => data_entry.errors.add_error(ResourceError::InvalidData),
        }
    }
    ResourceNode::Data(data_entry)
}

fn parse_directory(
    image: &Image,
    root_rva: u32,
    offset: u32,
    options: &ResourceLoadOptions,
    visited: &mut HashSet<u32>,
) -> ResourceDirectory {
    let mut directory = ResourceDirectory::default();
    let descriptor = match struct_from_rva::<ImageResourceDirectory>(
        image,
        root_rva.wrapping_add(offset),
        options.include_headers,
        options.allow_virtual_data,
    ) {
        Ok(descriptor) => descriptor,
        Err(_) => {
            directory.errors.add_error(ResourceError::InvalidDirectory);
            return directory;
        }
    };
    directory.descriptor = descriptor;

    let total = u32::from(descriptor.number_of_named_entries)
        + u32::from(descriptor.number_of_id_entries);
    let entry_size = packed_size_of::<ImageResourceDirectoryEntry>() as u32;
    let entries_offset = offset + packed_size_of::<ImageResourceDirectory>() as u32;

    for i in 0..total {
        let entry_descriptor = match struct_from_rva::<ImageResourceDirectoryEntry>(
            image,
            root_rva.wrapping_add(entries_offset + i * entry_size),
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                directory
                    .errors
                    .add_error_with_index(ResourceError::InvalidDirectoryEntry, i as usize);
                break;
            }
        };

        let mut entry = ResourceEntry {
            descriptor: entry_descriptor,
            name: ResourceName::Id(entry_descriptor.name_or_id),
            node: ResourceNode::Invalid,
            errors: ErrorList::new(),
        };
        if entry_descriptor.is_string_name() {
            let name_rva =
                root_rva.wrapping_add(entry_descriptor.name_or_id & IMAGE_RESOURCE_MASK);
            match name_at(image, name_rva, options) {
                Ok(name) => entry.name = ResourceName::Name(name),
                Err(_) => {
                    entry.errors.add_error(ResourceError::InvalidEntryName);
                    entry.name = ResourceName::Name(String::new());
                }
            }
        }

        let target = entry_descriptor.target_offset();
        entry.node = if entry_descriptor.is_directory() {
            if visited.insert(target) {
                ResourceNode::Directory(parse_directory(image, root_rva, target, options, visited))
            } else {
                entry.errors.add_error(ResourceError::LoopedDirectory);
                ResourceNode::LoopedDirectory(target)
            }
        } else {
            parse_data_entry(image, root_rva, target, options)
        };
        directory.entries.push(entry);
    }

    directory
}

/// Loads the resource directory, or `None` when the image has none.
pub fn load(
    image: &Image,
    options: &ResourceLoadOptions,
) -> Result<Option<ResourceDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::Resource)
        .filter(|d| d.virtual_address != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };
    debug!("resource directory at rva {:#x}", dir.virtual_address);

    let mut visited = HashSet::new();
    visited.insert(0);
    let root = parse_directory(image, dir.virtual_address, 0, options, &mut visited);
    Ok(Some(ResourceDirectoryDetails {
        root,
        errors: ErrorList::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::data_directories::{DataDirectory, DirectoryType};
    use crate::image::{Image, ImageLoadOptions};
    use crate::test_fixtures::{SectionSpec, synthetic_image_bytes};
    use scroll::Pwrite;

    pub(crate) const RSRC_RVA: u32 = 0x3000;

    fn write_directory(data: &mut [u8], offset: usize, named: u16, ids: u16) {
        let dir = ImageResourceDirectory {
            number_of_named_entries: named,
            number_of_id_entries: ids,
            ..ImageResourceDirectory::default()
        };
        data.pwrite_with(dir, offset, scroll::LE).unwrap();
    }

    fn write_entry(data: &mut [u8], offset: usize, name_or_id: u32, target: u32) {
        let entry = ImageResourceDirectoryEntry {
            name_or_id,
            offset_to_data: target,
        };
        data.pwrite_with(entry, offset, scroll::LE).unwrap();
    }

    /// Builds `.rsrc` bytes with a root → type → language → data chain and a
    /// looping sibling. Layout (directory-relative): root at 0, type dir at
    /// 0x20, lang dir at 0x40, data entry at 0x60, payload at 0x100, name
    /// string at 0x80.
    pub(crate) fn resource_image(payload: &[u8], type_id: u32, with_loop: bool) -> Image {
        let mut data = vec![0u8; 0x400];
        write_directory(&mut data, 0, 0, 1);
        write_entry(
            &mut data,
            16,
            type_id,
            0x20 | IMAGE_RESOURCE_DATA_IS_DIRECTORY,
        );

        let lang_entries: u16 = if with_loop { 2 } else { 1 };
        write_directory(&mut data, 0x20, 1, lang_entries);
        // A named entry pointing at the language directory.
        write_entry(
            &mut data,
            0x20 + 16,
            0x80 | IMAGE_RESOURCE_NAME_IS_STRING,
            0x40 | IMAGE_RESOURCE_DATA_IS_DIRECTORY,
        );
        // An id entry pointing the same place (cycle once visited).
        write_entry(
            &mut data,
            0x20 + 24,
            0x409,
            if with_loop {
                0x20 | IMAGE_RESOURCE_DATA_IS_DIRECTORY
            } else {
                0x60
            },
        );

        write_directory(&mut data, 0x40, 0, 1);
        write_entry(&mut data, 0x40 + 16, 0x409, 0x60);

        let data_entry = ImageResourceDataEntry {
            offset_to_data: RSRC_RVA + 0x100,
            size: payload.len() as u32,
            code_page: 1252,
            reserved: 0,
        };
        data.pwrite_with(data_entry, 0x60, scroll::LE).unwrap();
        data[0x100..0x100 + payload.len()].copy_from_slice(payload);

        // Name string "EN" (length-prefixed UTF-16).
        data.pwrite_with(2u16, 0x80, scroll::LE).unwrap();
        data.pwrite_with(u16::from(b'E'), 0x82, scroll::LE).unwrap();
        data.pwrite_with(u16::from(b'N'), 0x84, scroll::LE).unwrap();

        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".rsrc", RSRC_RVA, 0x400, data)],
            &[(
                DirectoryType::Resource as usize,
                DataDirectory {
                    virtual_address: RSRC_RVA,
                    size: 0x400,
                },
            )],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    #[test]
    fn walks_the_tree_to_leaf_data() {
        let image = resource_image(b"PAYLOAD", u32::from(RT_RCDATA), false);
        let resources = load(&image, &ResourceLoadOptions::default()).unwrap().unwrap();
        let type_entry = resources.root.entry_by_id(u32::from(RT_RCDATA)).unwrap();
        let ResourceNode::Directory(type_dir) = &type_entry.node else {
            panic!("expected a type subdirectory");
        };
        let named = type_dir.entry_by_name("EN").unwrap();
        let ResourceNode::Directory(lang_dir) = &named.node else {
            panic!("expected a language subdirectory");
        };
        let ResourceNode::Data(leaf) = &lang_dir.entries[0].node else {
            panic!("expected leaf data");
        };
        assert_eq!(leaf.descriptor.code_page, 1252);
        assert_eq!(leaf.data.as_ref().unwrap().as_slice(), b"PAYLOAD");

        let direct = type_dir.entry_by_id(0x409).unwrap();
        assert!(matches!(direct.node, ResourceNode::Data(_)));
    }

    #[test]
    fn cycles_become_back_references() {
        let image = resource_image(b"X", u32::from(RT_RCDATA), true);
        let resources = load(&image, &ResourceLoadOptions::default()).unwrap().unwrap();
        let type_entry = resources.root.entry_by_id(u32::from(RT_RCDATA)).unwrap();
        let ResourceNode::Directory(type_dir) = &type_entry.node else {
            panic!("expected a type subdirectory");
        };
        let looped = type_dir.entry_by_id(0x409).unwrap();
        assert!(matches!(looped.node, ResourceNode::LoopedDirectory(0x20)));
        assert!(looped.errors.has_error(ResourceError::LoopedDirectory));
    }

    #[test]
    fn first_leaf_helper_finds_data() {
        let image = resource_image(b"ABC", u32::from(RT_ACCELERATOR), false);
        let resources = load(&image, &ResourceLoadOptions::default()).unwrap().unwrap();
        let leaf = resources.first_leaf_of_type(RT_ACCELERATOR).unwrap();
        assert_eq!(leaf.data.as_ref().unwrap().as_slice(), b"ABC");
    }
}
