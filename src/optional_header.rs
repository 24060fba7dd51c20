//! The PE32 / PE32+ optional header.
//!
//! The two variants are structurally distinct records (different field
//! widths, and PE32+ drops `base_of_data`), so they are modeled as a tagged
//! sum with accessors for the logically shared fields. The file header's
//! `size_of_optional_header` governs how many bytes physically exist; the
//! unfilled tail is virtual and round-trips as such.

use scroll::{Pread, Pwrite, SizeWith};

use crate::buffer::{InputCursor, OutputBuffer};
use crate::error::{Error, Result};
use crate::packed::{PackedStruct, packed_size_of};

/// Optional header magic for PE32.
pub const MAGIC_32: u16 = 0x10b;
/// Optional header magic for PE32+.
pub const MAGIC_64: u16 = 0x20b;

/// Maximum linear address of a PE32 image (RVAs are 32-bit).
pub const MAX_RVA: u32 = u32::MAX;

/// `IMAGE_OPTIONAL_HEADER32` without the trailing data directories.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_OPTIONAL_HEADER32"))]
pub struct OptionalHeader32 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    /// Absent in PE32+.
    pub base_of_data: u32,
    pub image_base: u32,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// `IMAGE_OPTIONAL_HEADER64` without the trailing data directories.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_OPTIONAL_HEADER64"))]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// The bitness-tagged optional header.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionalHeader {
    Pe32(PackedStruct<OptionalHeader32>),
    Pe32Plus(PackedStruct<OptionalHeader64>),
}

macro_rules! shared_field {
    ($(#[$meta:meta])* $getter:ident, $setter:ident, $field:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $getter(&self) -> $ty {
            match self {
                OptionalHeader::Pe32(h) => h.$field as $ty,
                OptionalHeader::Pe32Plus(h) => h.$field as $ty,
            }
        }

        pub fn $setter(&mut self, value: $ty) {
            match self {
                OptionalHeader::Pe32(h) => h.$field = value as _,
                OptionalHeader::Pe32Plus(h) => h.$field = value as _,
            }
        }
    };
}

impl OptionalHeader {
    /// Reads the variant selected by the leading magic, consuming at most
    /// `size_of_optional_header` bytes of the cursor. A truncated header is
    /// legal; the missing tail stays zero and is recorded as virtual. The
    /// cursor is left where the data directories begin.
    pub fn parse(
        cursor: &mut InputCursor,
        size_of_optional_header: usize,
        allow_virtual_data: bool,
    ) -> Result<Self> {
        let start = cursor.rpos();
        let mut magic_bytes = [0u8; 2];
        if cursor.read(&mut magic_bytes) != 2 {
            return Err(Error::Malformed(
                "cannot read optional header magic".into(),
            ));
        }
        cursor.set_rpos(start);
        let magic = u16::from_le_bytes(magic_bytes);
        let header = match magic {
            MAGIC_32 => OptionalHeader::Pe32(PackedStruct::read_from_until(
                cursor,
                size_of_optional_header,
                allow_virtual_data,
            )?),
            MAGIC_64 => OptionalHeader::Pe32Plus(PackedStruct::read_from_until(
                cursor,
                size_of_optional_header,
                allow_virtual_data,
            )?),
            magic => return Err(Error::BadMagic(u64::from(magic))),
        };
        // Data directories live in the remainder of size_of_optional_header;
        // the caller parses them from the current cursor position.
        cursor.set_rpos(start + size_of_optional_header.min(header.packed_size()));
        Ok(header)
    }

    /// Serializes the header, honoring the recorded physical size unless
    /// `write_virtual_part`.
    pub fn write_to(&self, out: &mut dyn OutputBuffer, write_virtual_part: bool) -> Result<usize> {
        match self {
            OptionalHeader::Pe32(h) => h.write_to(out, write_virtual_part),
            OptionalHeader::Pe32Plus(h) => h.write_to(out, write_virtual_part),
        }
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self, OptionalHeader::Pe32Plus(_))
    }

    pub fn magic(&self) -> u16 {
        match self {
            OptionalHeader::Pe32(h) => h.magic,
            OptionalHeader::Pe32Plus(h) => h.magic,
        }
    }

    /// Preferred load address.
    pub fn image_base(&self) -> u64 {
        match self {
            OptionalHeader::Pe32(h) => u64::from(h.image_base),
            OptionalHeader::Pe32Plus(h) => h.image_base,
        }
    }

    pub fn set_image_base(&mut self, image_base: u64) {
        match self {
            OptionalHeader::Pe32(h) => h.image_base = image_base as u32,
            OptionalHeader::Pe32Plus(h) => h.image_base = image_base,
        }
    }

    /// Size of the record prefix that physically existed in the file.
    pub fn physical_size(&self) -> usize {
        match self {
            OptionalHeader::Pe32(h) => h.physical_size(),
            OptionalHeader::Pe32Plus(h) => h.physical_size(),
        }
    }

    /// Packed size of the full record for this bitness.
    pub fn packed_size(&self) -> usize {
        match self {
            OptionalHeader::Pe32(_) => packed_size_of::<OptionalHeader32>(),
            OptionalHeader::Pe32Plus(_) => packed_size_of::<OptionalHeader64>(),
        }
    }

    shared_field!(
        /// RVA of the entry point, zero when absent.
        address_of_entry_point, set_address_of_entry_point, address_of_entry_point, u32
    );
    shared_field!(section_alignment, set_section_alignment, section_alignment, u32);
    shared_field!(file_alignment, set_file_alignment, file_alignment, u32);
    shared_field!(size_of_image, set_size_of_image, size_of_image, u32);
    shared_field!(size_of_headers, set_size_of_headers, size_of_headers, u32);
    shared_field!(check_sum, set_check_sum, check_sum, u32);
    shared_field!(subsystem, set_subsystem, subsystem, u16);
    shared_field!(dll_characteristics, set_dll_characteristics, dll_characteristics, u16);
    shared_field!(
        /// Declared number of data-directory entries that follow the record.
        number_of_rva_and_sizes, set_number_of_rva_and_sizes, number_of_rva_and_sizes, u32
    );
}
