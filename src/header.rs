//! DOS header, image signature, and COFF file header.

use scroll::{Pread, Pwrite, SizeWith};

use crate::buffer::InputCursor;
use crate::error::{Error, Result};
use crate::packed::PackedStruct;

/// DOS header magic: `MZ`.
pub const DOS_MAGIC: u16 = 0x5A4D;
/// Image signature: `PE\0\0`, little endian.
pub const PE_MAGIC: u32 = 0x0000_4550;

/// Size of [`DosHeader`].
pub const SIZEOF_DOS_HEADER: usize = 64;
/// Size of the `PE\0\0` image signature.
pub const SIZEOF_IMAGE_SIGNATURE: usize = 4;
/// Size of [`CoffHeader`].
pub const SIZEOF_COFF_HEADER: usize = 20;

// Machine types this crate cares about when picking per-architecture parsers.

/// x86.
pub const MACHINE_I386: u16 = 0x14c;
/// x64.
pub const MACHINE_AMD64: u16 = 0x8664;
/// ARM little endian.
pub const MACHINE_ARM: u16 = 0x1c0;
/// ARM Thumb-2 little endian.
pub const MACHINE_ARMNT: u16 = 0x1c4;
/// ARM64 little endian.
pub const MACHINE_ARM64: u16 = 0xaa64;
/// Intel Itanium.
pub const MACHINE_IA64: u16 = 0x200;

/// `IMAGE_FILE_DLL`
pub const IMAGE_FILE_DLL: u16 = 0x2000;
/// `IMAGE_FILE_EXECUTABLE_IMAGE`
pub const IMAGE_FILE_EXECUTABLE_IMAGE: u16 = 0x0002;
/// `IMAGE_FILE_RELOCS_STRIPPED`
pub const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;
/// `IMAGE_FILE_LARGE_ADDRESS_AWARE`
pub const IMAGE_FILE_LARGE_ADDRESS_AWARE: u16 = 0x0020;

/// `IMAGE_DOS_HEADER`: the DOS-era header every PE still begins with.
///
/// Only [`signature`](Self::signature) (aka `e_magic`) and
/// [`pe_pointer`](Self::pe_pointer) (aka `e_lfanew`) matter to the Windows
/// loader; the rest is kept verbatim for round-tripping.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_DOS_HEADER"))]
pub struct DosHeader {
    /// `e_magic`: must be [`DOS_MAGIC`].
    pub signature: u16,
    /// `e_cblp`: bytes used in the last 512-byte page.
    pub bytes_on_last_page: u16,
    /// `e_cp`: 512-byte pages in the file.
    pub pages_in_file: u16,
    /// `e_crlc`: DOS relocation count.
    pub relocations: u16,
    /// `e_cparhdr`: header size in 16-byte paragraphs.
    pub size_of_header_in_paragraphs: u16,
    /// `e_minalloc`
    pub minimum_extra_paragraphs_needed: u16,
    /// `e_maxalloc`
    pub maximum_extra_paragraphs_needed: u16,
    /// `e_ss`: initial (relative) SS.
    pub initial_relative_ss: u16,
    /// `e_sp`: initial SP.
    pub initial_sp: u16,
    /// `e_csum`
    pub checksum: u16,
    /// `e_ip`: initial IP.
    pub initial_ip: u16,
    /// `e_cs`: initial (relative) CS.
    pub initial_relative_cs: u16,
    /// `e_lfarlc`: file offset of the DOS relocation table.
    pub file_address_of_relocation_table: u16,
    /// `e_ovno`
    pub overlay_number: u16,
    /// `e_res[4]`
    pub reserved: [u16; 4],
    /// `e_oemid`
    pub oem_id: u16,
    /// `e_oeminfo`
    pub oem_info: u16,
    /// `e_res2[10]`
    pub reserved2: [u16; 10],
    /// `e_lfanew`: signed file offset of the NT headers.
    pub pe_pointer: i32,
}

impl DosHeader {
    /// Reads and validates the DOS header at the cursor.
    pub fn parse(cursor: &mut InputCursor) -> Result<PackedStruct<Self>> {
        let header = PackedStruct::<DosHeader>::read_from(cursor, false).map_err(|_| {
            Error::Malformed("DOS header is too short".into())
        })?;
        if header.signature != DOS_MAGIC {
            return Err(Error::BadMagic(u64::from(header.signature)));
        }
        if header.pe_pointer < SIZEOF_DOS_HEADER as i32 {
            return Err(Error::Malformed(format!(
                "e_lfanew ({:#x}) points into the DOS header",
                header.pe_pointer
            )));
        }
        Ok(header)
    }
}

/// `IMAGE_FILE_HEADER`: the COFF file header following the image signature.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_FILE_HEADER"))]
pub struct CoffHeader {
    /// The architecture this image targets.
    pub machine: u16,
    pub number_of_sections: u16,
    /// Seconds since the Unix epoch, or a reproducible-build hash.
    pub time_date_stamp: u32,
    /// Deprecated for images; kept for round-tripping.
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    /// Governs how many optional-header bytes physically exist.
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl CoffHeader {
    pub fn is_dll(&self) -> bool {
        self.characteristics & IMAGE_FILE_DLL != 0
    }
}

/// Reads and validates the `PE\0\0` signature at the cursor.
pub fn parse_image_signature(cursor: &mut InputCursor) -> Result<PackedStruct<u32>> {
    let signature = PackedStruct::<u32>::read_from(cursor, false).map_err(|_| {
        Error::Malformed("image signature is out of bounds".into())
    })?;
    if *signature != PE_MAGIC {
        return Err(Error::BadMagic(u64::from(*signature)));
    }
    Ok(signature)
}
