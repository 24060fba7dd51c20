//! Exception handling and stack unwinding for ARM and ARM64.
//!
//! Both architectures share one directory shape: 8-byte runtime functions
//! whose second word either packs the whole unwind description into bits or
//! points at an extended `.xdata` record. The extended record is a main
//! header (with an overflow header when its counts saturate), an epilog
//! scope array, a byte-granular unwind code stream, and an optional
//! exception handler RVA. Opcode lengths are fixed per leading-byte family,
//! 1 to 4 bytes.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::header::{MACHINE_ARM, MACHINE_ARM64, MACHINE_ARMNT};
use crate::image::Image;
use crate::image::accessor::{byte_vector_from_rva, struct_from_rva};
use crate::packed::PackedStruct;

/// Size of an ARM-family runtime function descriptor.
pub const ARM_RUNTIME_FUNCTION_SIZE: usize = 8;

/// Which ARM flavor a directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmArch {
    /// ARM / Thumb-2 (`ARMNT`).
    Arm,
    /// ARM64.
    Arm64,
}

/// An ARM-family `RUNTIME_FUNCTION`: begin address plus packed-or-pointer
/// unwind data.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Default, Pread, Pwrite, SizeWith)]
pub struct ArmRuntimeFunction {
    pub begin_address: u32,
    pub unwind_data: u32,
}

impl ArmRuntimeFunction {
    /// The low two bits: 0 selects an `.xdata` pointer, 1 a packed record,
    /// 2 a packed fragment.
    pub fn flag(&self) -> u8 {
        (self.unwind_data & 3) as u8
    }

    pub fn is_packed(&self) -> bool {
        self.flag() != 0
    }

    /// RVA of the extended record when not packed.
    pub fn xdata_rva(&self) -> u32 {
        self.unwind_data & !3
    }
}

error_codes! {
    /// ARM-family exception directory diagnostics.
    pub enum ArmExceptionError("arm_exception_loader") {
        UnmatchedDirectorySize => "Directory size is not a multiple of the runtime function size",
        InvalidRuntimeFunction => "Runtime function cannot be read",
        InvalidUnwindRecord => "Extended unwind record cannot be read",
        UnsupportedVersion => "Extended unwind record version is not zero",
        UnorderedEpilogScopes => "Epilog scope start offsets are not monotonically non-decreasing",
        UnknownUnwindCode => "Unknown unwind operation code",
        TruncatedUnwindCodes => "Unwind code stream ends inside an operation",
        InvalidExceptionHandlerRva => "Exception handler RVA cannot be read",
        TooManyRuntimeFunctions => "Number of runtime functions exceeds the configured limit",
        TooManyEpilogScopes => "Number of epilog scopes exceeds the configured limit",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct ArmExceptionLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    pub load_unwind_records: bool,
    pub max_runtime_functions: u32,
    pub max_epilog_scopes: u32,
}

impl Default for ArmExceptionLoadOptions {
    fn default() -> Self {
        ArmExceptionLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            load_unwind_records: true,
            max_runtime_functions: 0x10_0000,
            max_epilog_scopes: 0x1_0000,
        }
    }
}

/// A packed unwind description, kept as its raw bits plus the flavor needed
/// to interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedUnwindData {
    pub raw: u32,
    pub arch: ArmArch,
}

impl PackedUnwindData {
    /// The packed-vs-fragment flag (1 or 2).
    pub fn flag(&self) -> u8 {
        (self.raw & 3) as u8
    }

    /// Function length in bytes.
    pub fn function_length(&self) -> u32 {
        match self.arch {
            // Length fields count 2-byte units on ARM, 4-byte on ARM64.
            ArmArch::Arm => ((self.raw >> 2) & 0x7FF) * 2,
            ArmArch::Arm64 => ((self.raw >> 2) & 0x7FF) * 4,
        }
    }

    /// Frame size in bytes.
    pub fn frame_size(&self) -> u32 {
        match self.arch {
            ArmArch::Arm => ((self.raw >> 23) & 0x1FF) * 4,
            ArmArch::Arm64 => ((self.raw >> 23) & 0x1FF) * 16,
        }
    }
}

/// One epilog scope of an extended record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpilogScope {
    pub raw: u32,
    /// Offset of the epilog start from the function begin, in code units.
    pub start_offset: u32,
    /// Index into the unwind code stream.
    pub start_index: u32,
}

/// One unwind operation, kept as its raw bytes (1-4 per the opcode family).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArmUnwindCode {
    pub bytes: Vec<u8>,
}

impl ArmUnwindCode {
    pub fn opcode(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }
}

/// A decoded extended (`.xdata`) unwind record.
#[derive(Debug, Clone, Default)]
pub struct ExtendedUnwindRecord {
    /// Function length in bytes.
    pub function_length: u32,
    pub version: u8,
    /// `X`: exception data follows the code words.
    pub has_exception_data: bool,
    /// `E`: the single epilog is described by the header itself.
    pub epilog_in_header: bool,
    /// `F` (ARM only): this record describes a function fragment.
    pub fragment: bool,
    pub epilog_count: u32,
    pub code_words: u32,
    pub epilog_scopes: Vec<EpilogScope>,
    pub unwind_codes: Vec<ArmUnwindCode>,
    pub exception_handler_rva: Option<PackedStruct<u32>>,
    pub errors: ErrorList<ArmExceptionError>,
}

/// What a runtime function's unwind data resolved to.
#[derive(Debug, Clone)]
pub enum ArmUnwindRecord {
    Packed(PackedUnwindData),
    Extended(ExtendedUnwindRecord),
}

/// One runtime function plus its unwind record.
#[derive(Debug, Clone, Default)]
pub struct ArmRuntimeFunctionEntry {
    pub descriptor: PackedStruct<ArmRuntimeFunction>,
    pub record: Option<ArmUnwindRecord>,
    pub errors: ErrorList<ArmExceptionError>,
}

/// The decoded ARM-family exception directory.
#[derive(Debug, Clone)]
pub struct ArmExceptionDirectoryDetails {
    pub arch: ArmArch,
    pub runtime_functions: Vec<ArmRuntimeFunctionEntry>,
    pub errors: ErrorList<ArmExceptionError>,
}

/// Fixed length of an ARM64 unwind opcode, by leading byte.
fn arm64_code_length(byte: u8) -> Option<usize> {
    Some(match byte {
        0x00..=0xBF => 1,          // alloc_s, save_r19r20_x, save_fplr, save_fplr_x
        0xC0..=0xC7 => 2,          // alloc_m
        0xC8..=0xDD => 2,          // save_regp .. save_freg
        0xDE => 2,                 // save_freg_x
        0xDF => return None,
        0xE0 => 4,                 // alloc_l
        0xE1 => 1,                 // set_fp
        0xE2 => 2,                 // add_fp
        0xE3 => 1,                 // nop
        0xE4 => 1,                 // end
        0xE5 => 1,                 // end_c
        0xE6 => 1,                 // save_next
        0xE7 => 3,                 // save_any_reg
        0xE8..=0xFF => return None,
    })
}

/// Fixed length of an ARM (Thumb-2) unwind opcode, by leading byte.
fn arm_code_length(byte: u8) -> Option<usize> {
    Some(match byte {
        0x00..=0x7F => 1,          // add sp, sp, #imm
        0x80..=0xBF => 2,          // pop {register mask}
        0xC0..=0xCF => 1,          // mov sp, r<n>
        0xD0..=0xE7 => 1,          // pop {r4-r<n>[, lr]}, vpop
        0xE8..=0xEB => 2,          // addw sp, sp, #imm
        0xEC..=0xED => 2,          // pop {mask} (16-bit)
        0xEE..=0xEF => 2,          // microsoft-specific, ldr lr
        0xF0..=0xF4 => return None,
        0xF5..=0xF6 => 2,          // vpop wide
        0xF7 | 0xF9 => 3,          // alloc large (16-bit operand)
        0xF8 | 0xFA => 4,          // alloc large (24-bit operand)
        0xFB..=0xFF => 1,          // nops and ends
    })
}

fn is_end_opcode(arch: ArmArch, byte: u8) -> bool {
    match arch {
        ArmArch::Arm64 => byte == 0xE4,
        ArmArch::Arm => matches!(byte, 0xFD..=0xFF),
    }
}

fn decode_code_stream(record: &mut ExtendedUnwindRecord, arch: ArmArch, bytes: &[u8]) {
    let mut offset = 0usize;
    while offset < bytes.len() {
        let opcode = bytes[offset];
        let length = match arch {
            ArmArch::Arm64 => arm64_code_length(opcode),
            ArmArch::Arm => arm_code_length(opcode),
        };
        let Some(length) = length else {
            record.errors.add_error(ArmExceptionError::UnknownUnwindCode);
            return;
        };
        if offset + length > bytes.len() {
            record
                .errors
                .add_error(ArmExceptionError::TruncatedUnwindCodes);
            return;
        }
        record.unwind_codes.push(ArmUnwindCode {
            bytes: bytes[offset..offset + length].to_vec(),
        });
        if is_end_opcode(arch, opcode) {
            return;
        }
        offset += length;
    }
}

fn parse_extended_record(
    image: &Image,
    arch: ArmArch,
    rva: u32,
    options: &ArmExceptionLoadOptions,
) -> Option<ExtendedUnwindRecord> {
    let word = struct_from_rva::<u32>(
        image,
        rva,
        options.include_headers,
        options.allow_virtual_data,
    )
    .ok()?;
    let word = *word;

    let mut record = ExtendedUnwindRecord {
        version: ((word >> 18) & 0x3) as u8,
        has_exception_data: (word >> 20) & 1 != 0,
        epilog_in_header: (word >> 21) & 1 != 0,
        ..ExtendedUnwindRecord::default()
    };
    let (mut epilog_count, mut code_words);
    match arch {
        ArmArch::Arm => {
            record.function_length = (word & 0x3FFFF) * 2;
            record.fragment = (word >> 22) & 1 != 0;
            epilog_count = (word >> 23) & 0x1F;
            code_words = (word >> 28) & 0xF;
        }
        ArmArch::Arm64 => {
            record.function_length = (word & 0x3FFFF) * 4;
            epilog_count = (word >> 22) & 0x1F;
            code_words = (word >> 27) & 0x1F;
        }
    }
    if record.version != 0 {
        record.errors.add_error(ArmExceptionError::UnsupportedVersion);
    }

    let mut pos = rva.wrapping_add(4);
    if epilog_count == 0 && code_words == 0 {
        // The counts overflowed into an extension word.
        let Ok(extension) = struct_from_rva::<u32>(
            image,
            pos,
            options.include_headers,
            options.allow_virtual_data,
        ) else {
            record
                .errors
                .add_error(ArmExceptionError::InvalidUnwindRecord);
            return Some(record);
        };
        epilog_count = *extension & 0xFFFF;
        code_words = (*extension >> 16) & 0xFF;
        pos = pos.wrapping_add(4);
    }
    record.epilog_count = epilog_count;
    record.code_words = code_words;

    if !record.epilog_in_header {
        let mut count = epilog_count;
        if count > options.max_epilog_scopes {
            record
                .errors
                .add_error(ArmExceptionError::TooManyEpilogScopes);
            count = options.max_epilog_scopes;
        }
        for _ in 0..count {
            let Ok(raw) = struct_from_rva::<u32>(
                image,
                pos,
                options.include_headers,
                options.allow_virtual_data,
            ) else {
                // A half-populated record stays in place with its error.
                record
                    .errors
                    .add_error(ArmExceptionError::InvalidUnwindRecord);
                return Some(record);
            };
            let raw = *raw;
            let scope = match arch {
                ArmArch::Arm => EpilogScope {
                    raw,
                    start_offset: (raw & 0x3FFFF) * 2,
                    start_index: raw >> 24,
                },
                ArmArch::Arm64 => EpilogScope {
                    raw,
                    start_offset: (raw & 0x3FFFF) * 4,
                    start_index: raw >> 22,
                },
            };
            record.epilog_scopes.push(scope);
            pos = pos.wrapping_add(4);
        }
        if crate::utils::first_unsorted_index(&record.epilog_scopes, |s| {
            u64::from(s.start_offset)
        })
        .is_some()
        {
            record
                .errors
                .add_error(ArmExceptionError::UnorderedEpilogScopes);
        }
    }

    match byte_vector_from_rva(
        image,
        pos,
        code_words as usize * 4,
        options.include_headers,
        options.allow_virtual_data,
    ) {
        Ok(stream) => decode_code_stream(&mut record, arch, stream.as_slice()),
        Err(_) => record
            .errors
            .add_error(ArmExceptionError::TruncatedUnwindCodes),
    }
    pos = pos.wrapping_add(code_words * 4);

    if record.has_exception_data {
        match struct_from_rva::<u32>(
            image,
            pos,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(rva) => record.exception_handler_rva = Some(rva),
            Err(_) => record
                .errors
                .add_error(ArmExceptionError::InvalidExceptionHandlerRva),
        }
    }

    Some(record)
}

/// Selects the ARM flavor for the image's machine, if any.
pub fn arch_for_machine(machine: u16) -> Option<ArmArch> {
    match machine {
        MACHINE_ARM64 => Some(ArmArch::Arm64),
        MACHINE_ARM | MACHINE_ARMNT => Some(ArmArch::Arm),
        _ => None,
    }
}

/// Loads the ARM-family exception directory, or `None` when the image has
/// none or targets another architecture.
pub fn load(
    image: &Image,
    options: &ArmExceptionLoadOptions,
) -> Result<Option<ArmExceptionDirectoryDetails>> {
    let Some(arch) = arch_for_machine(image.machine()) else {
        return Ok(None);
    };
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::Exception)
        .filter(|d| d.virtual_address != 0 && d.size != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let mut details = ArmExceptionDirectoryDetails {
        arch,
        runtime_functions: Vec::new(),
        errors: ErrorList::new(),
    };
    if dir.size as usize % ARM_RUNTIME_FUNCTION_SIZE != 0 {
        details
            .errors
            .add_error(ArmExceptionError::UnmatchedDirectorySize);
    }
    let mut count = dir.size / ARM_RUNTIME_FUNCTION_SIZE as u32;
    if count > options.max_runtime_functions {
        details
            .errors
            .add_error(ArmExceptionError::TooManyRuntimeFunctions);
        count = options.max_runtime_functions;
    }
    debug!("{:?} exception directory: {} runtime functions", arch, count);

    for i in 0..count {
        let descriptor = match struct_from_rva::<ArmRuntimeFunction>(
            image,
            dir.virtual_address + i * ARM_RUNTIME_FUNCTION_SIZE as u32,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                details
                    .errors
                    .add_error(ArmExceptionError::InvalidRuntimeFunction);
                break;
            }
        };
        let mut entry = ArmRuntimeFunctionEntry {
            descriptor,
            ..ArmRuntimeFunctionEntry::default()
        };
        if options.load_unwind_records {
            if entry.descriptor.is_packed() {
                entry.record = Some(ArmUnwindRecord::Packed(PackedUnwindData {
                    raw: entry.descriptor.unwind_data,
                    arch,
                }));
            } else {
                match parse_extended_record(image, arch, entry.descriptor.xdata_rva(), options) {
                    Some(record) => entry.record = Some(ArmUnwindRecord::Extended(record)),
                    None => entry
                        .errors
                        .add_error(ArmExceptionError::InvalidUnwindRecord),
                }
            }
        }
        details.runtime_functions.push(entry);
    }

    Ok(Some(details))
}
