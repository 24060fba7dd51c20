//! Synthetic PE images for unit tests.

use scroll::Pwrite;

use crate::data_directories::{DataDirectory, NUM_DATA_DIRECTORIES, SIZEOF_DATA_DIRECTORY};
use crate::header::{
    CoffHeader, DOS_MAGIC, DosHeader, MACHINE_AMD64, MACHINE_I386, PE_MAGIC, SIZEOF_COFF_HEADER,
    SIZEOF_DOS_HEADER, SIZEOF_IMAGE_SIGNATURE,
};
use crate::optional_header::{MAGIC_32, MAGIC_64, OptionalHeader32, OptionalHeader64};
use crate::packed::packed_size_of;
use crate::section_table::{
    IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_READ, SectionHeader,
};

pub const TEST_IMAGE_BASE_64: u64 = 0x1_4000_0000;
pub const TEST_IMAGE_BASE_32: u64 = 0x40_0000;

pub const E_LFANEW: usize = 0x80;
pub const FILE_ALIGNMENT: u32 = 0x200;
pub const SECTION_ALIGNMENT: u32 = 0x1000;
pub const SIZE_OF_HEADERS: u32 = 0x400;

pub struct SectionSpec {
    pub name: &'static str,
    pub rva: u32,
    pub raw_size: u32,
    pub data: Vec<u8>,
    pub virtual_size: u32,
    pub characteristics: u32,
}

impl SectionSpec {
    pub fn new(name: &'static str, rva: u32, raw_size: u32, data: Vec<u8>) -> Self {
        SectionSpec {
            name,
            rva,
            raw_size,
            virtual_size: (data.len() as u32).max(raw_size),
            data,
            characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
        }
    }

    pub fn virtual_size(mut self, virtual_size: u32) -> Self {
        self.virtual_size = virtual_size;
        self
    }

    pub fn characteristics(mut self, characteristics: u32) -> Self {
        self.characteristics = characteristics;
        self
    }
}

/// Lays out a well-formed single-arch image: DOS header at 0, stub, NT
/// headers at [`E_LFANEW`], sixteen directory slots (`dirs` fills chosen
/// indices), section headers, then raw section data at file-aligned offsets.
pub fn synthetic_image_bytes(
    is_64: bool,
    sections: &[SectionSpec],
    dirs: &[(usize, DataDirectory)],
) -> Vec<u8> {
    let opt_size = if is_64 {
        packed_size_of::<OptionalHeader64>()
    } else {
        packed_size_of::<OptionalHeader32>()
    };
    let size_of_optional_header =
        (opt_size + NUM_DATA_DIRECTORIES * SIZEOF_DATA_DIRECTORY) as u16;

    let mut raw_offset = SIZE_OF_HEADERS;
    let mut headers: Vec<SectionHeader> = Vec::new();
    for spec in sections {
        let mut header = SectionHeader {
            virtual_size: spec.virtual_size,
            virtual_address: spec.rva,
            size_of_raw_data: spec.raw_size,
            pointer_to_raw_data: if spec.raw_size == 0 { 0 } else { raw_offset },
            characteristics: spec.characteristics,
            ..SectionHeader::default()
        };
        header.set_name(spec.name);
        raw_offset += crate::utils::align_up(spec.raw_size, FILE_ALIGNMENT);
        headers.push(header);
    }
    let file_size = raw_offset as usize;
    let size_of_image = headers
        .iter()
        .map(|h| h.virtual_address + crate::utils::align_up(h.virtual_size.max(1), SECTION_ALIGNMENT))
        .max()
        .unwrap_or(SECTION_ALIGNMENT);

    let mut bytes = vec![0u8; file_size.max(SIZE_OF_HEADERS as usize)];

    let dos = DosHeader {
        signature: DOS_MAGIC,
        pe_pointer: E_LFANEW as i32,
        ..DosHeader::default()
    };
    bytes.pwrite_with(dos, 0, scroll::LE).unwrap();
    // A recognizable stub pattern between the DOS header and e_lfanew.
    for (i, b) in bytes[SIZEOF_DOS_HEADER..E_LFANEW].iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(3);
    }

    let mut offset = E_LFANEW;
    bytes.pwrite_with(PE_MAGIC, offset, scroll::LE).unwrap();
    offset += SIZEOF_IMAGE_SIGNATURE;
    let coff = CoffHeader {
        machine: if is_64 { MACHINE_AMD64 } else { MACHINE_I386 },
        number_of_sections: headers.len() as u16,
        size_of_optional_header,
        characteristics: 0x0002,
        ..CoffHeader::default()
    };
    bytes.pwrite_with(coff, offset, scroll::LE).unwrap();
    offset += SIZEOF_COFF_HEADER;

    if is_64 {
        let opt = OptionalHeader64 {
            magic: MAGIC_64,
            address_of_entry_point: 0x1000,
            base_of_code: 0x1000,
            image_base: TEST_IMAGE_BASE_64,
            section_alignment: SECTION_ALIGNMENT,
            file_alignment: FILE_ALIGNMENT,
            size_of_image,
            size_of_headers: SIZE_OF_HEADERS,
            number_of_rva_and_sizes: NUM_DATA_DIRECTORIES as u32,
            ..OptionalHeader64::default()
        };
        bytes.pwrite_with(opt, offset, scroll::LE).unwrap();
        offset += packed_size_of::<OptionalHeader64>();
    } else {
        let opt = OptionalHeader32 {
            magic: MAGIC_32,
            address_of_entry_point: 0x1000,
            base_of_code: 0x1000,
            image_base: TEST_IMAGE_BASE_32 as u32,
            section_alignment: SECTION_ALIGNMENT,
            file_alignment: FILE_ALIGNMENT,
            size_of_image,
            size_of_headers: SIZE_OF_HEADERS,
            number_of_rva_and_sizes: NUM_DATA_DIRECTORIES as u32,
            ..OptionalHeader32::default()
        };
        bytes.pwrite_with(opt, offset, scroll::LE).unwrap();
        offset += packed_size_of::<OptionalHeader32>();
    }

    for index in 0..NUM_DATA_DIRECTORIES {
        let dd = dirs
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, dd)| *dd)
            .unwrap_or_default();
        bytes.pwrite_with(dd, offset, scroll::LE).unwrap();
        offset += SIZEOF_DATA_DIRECTORY;
    }

    for header in &headers {
        bytes.pwrite_with(*header, offset, scroll::LE).unwrap();
        offset += packed_size_of::<SectionHeader>();
    }

    for (spec, header) in sections.iter().zip(&headers) {
        let start = header.pointer_to_raw_data as usize;
        if start == 0 {
            continue;
        }
        let take = spec.data.len().min(spec.raw_size as usize);
        bytes[start..start + take].copy_from_slice(&spec.data[..take]);
    }

    bytes
}

