//! Exception handling and stack unwinding for x64.
//!
//! The exception directory is an array of [`RuntimeFunction`] records; each
//! points at a variable-length `UNWIND_INFO` describing how to undo the
//! function's prolog. Unwind codes occupy 2-byte slots, some opcodes
//! spilling into one or two extension slots. The trailing region is either a
//! language-specific handler (RVA plus scope table) or a chained parent
//! function, never both.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::header::MACHINE_AMD64;
use crate::image::Image;
use crate::image::accessor::{byte_vector_from_rva, struct_from_rva};
use crate::packed::{PackedStruct, packed_size_of};

/// The function has an exception handler.
pub const UNW_FLAG_EHANDLER: u8 = 0x01;
/// The function has a termination handler.
pub const UNW_FLAG_UHANDLER: u8 = 0x02;
/// This record chains to a previous `RUNTIME_FUNCTION`.
pub const UNW_FLAG_CHAININFO: u8 = 0x04;

/// info == register number
pub const UWOP_PUSH_NONVOL: u8 = 0;
/// no info, alloc size in next 1 or 2 slots
pub const UWOP_ALLOC_LARGE: u8 = 1;
/// info == size of allocation / 8 - 1
pub const UWOP_ALLOC_SMALL: u8 = 2;
/// no info, FP = RSP + frame_register_offset
pub const UWOP_SET_FPREG: u8 = 3;
/// info == register number, offset in next slot
pub const UWOP_SAVE_NONVOL: u8 = 4;
/// info == register number, offset in next 2 slots
pub const UWOP_SAVE_NONVOL_FAR: u8 = 5;
/// version 2 epilog descriptor (was `UWOP_SAVE_XMM` in version 1)
pub const UWOP_EPILOG: u8 = 6;
/// version 2 spare code (was `UWOP_SAVE_XMM_FAR` in version 1)
pub const UWOP_SPARE_CODE: u8 = 7;
/// info == XMM register number, offset in next slot
pub const UWOP_SAVE_XMM128: u8 = 8;
/// info == XMM register number, offset in next 2 slots
pub const UWOP_SAVE_XMM128_FAR: u8 = 9;
/// info == 0: no error code, 1: error code
pub const UWOP_PUSH_MACHFRAME: u8 = 10;
/// version 2 large frame-pointer establishment, offset in next 2 slots
pub const UWOP_SET_FPREG_LARGE: u8 = 11;

/// Size of a [`RuntimeFunction`] descriptor.
pub const RUNTIME_FUNCTION_SIZE: usize = 12;
/// Size of one unwind code slot.
pub const UNWIND_CODE_SIZE: usize = 2;

/// An unwind entry for a range of a function.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("RUNTIME_FUNCTION"))]
pub struct RuntimeFunction {
    /// Function start RVA.
    pub begin_address: u32,
    /// Function end RVA (exclusive).
    pub end_address: u32,
    /// RVA of the `UNWIND_INFO` record.
    pub unwind_info_address: u32,
}

/// An x64 register used during unwinding.
///
/// `0` - `15` are general purpose registers, `17` - `32` XMM registers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Register(pub u8);

impl Register {
    fn xmm(number: u8) -> Self {
        Register(number + 17)
    }

    /// Returns the x64 register name.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "$rax",
            1 => "$rcx",
            2 => "$rdx",
            3 => "$rbx",
            4 => "$rsp",
            5 => "$rbp",
            6 => "$rsi",
            7 => "$rdi",
            8 => "$r8",
            9 => "$r9",
            10 => "$r10",
            11 => "$r11",
            12 => "$r12",
            13 => "$r13",
            14 => "$r14",
            15 => "$r15",
            16 => "$rip",
            17 => "$xmm0",
            18 => "$xmm1",
            19 => "$xmm2",
            20 => "$xmm3",
            21 => "$xmm4",
            22 => "$xmm5",
            23 => "$xmm6",
            24 => "$xmm7",
            25 => "$xmm8",
            26 => "$xmm9",
            27 => "$xmm10",
            28 => "$xmm11",
            29 => "$xmm12",
            30 => "$xmm13",
            31 => "$xmm14",
            32 => "$xmm15",
            _ => "",
        }
    }
}

/// An unsigned offset to a value in the local stack frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StackFrameOffset {
    /// Offset from the current RSP.
    RSP(u32),
    /// Offset from the established frame pointer.
    FP(u32),
}

impl StackFrameOffset {
    fn with_frame(offset: u32, frame_register: Register) -> Self {
        match frame_register {
            Register(0) => StackFrameOffset::RSP(offset),
            Register(_) => StackFrameOffset::FP(offset),
        }
    }
}

/// An unwind operation corresponding to code in the function prolog.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum UnwindOperation {
    /// Push a nonvolatile integer register, decrementing RSP by 8.
    PushNonVolatile(Register),
    /// Allocate a fixed-size area on the stack.
    Alloc(u32),
    /// Establish the frame pointer register at an offset of the current RSP.
    SetFPRegister,
    /// Version 2 `SetFPRegister` with a large scaled offset.
    SetFPRegisterLarge(u32),
    /// Save a nonvolatile integer register on the stack with a MOV.
    SaveNonVolatile(Register, StackFrameOffset),
    /// Save all 128 bits of a nonvolatile XMM register on the stack.
    SaveXMM128(Register, StackFrameOffset),
    /// Version 2 epilog descriptor.
    Epilog {
        offset_low_or_size: u8,
        offset_high_or_flags: u8,
    },
    /// Version 2 spare code, two slots.
    SpareCode,
    /// Push a machine frame, recording a hardware interrupt or exception.
    PushMachineFrame(bool),
}

/// One decoded unwind code.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnwindCode {
    /// Prolog offset of the instruction this code undoes.
    pub code_offset: u8,
    pub operation: UnwindOperation,
}

error_codes! {
    /// x64 exception directory diagnostics.
    pub enum ExceptionError("exception_loader") {
        UnmatchedDirectorySize => "Directory size is not a multiple of the runtime function size",
        InvalidRuntimeFunction => "Runtime function cannot be read",
        InvalidUnwindInfo => "Unwind info record cannot be read",
        UnsupportedUnwindVersion => "Unwind info version is neither 1 nor 2",
        UnknownUnwindCode => "Unknown unwind operation code",
        VersionGatedUnwindCode => "Unwind operation code requires unwind info version 2",
        TruncatedUnwindCodes => "Unwind code array is shorter than an operation needs",
        PushNonvolOutOfOrder => "PUSH_NONVOL unwind code appears before other prolog codes",
        MultipleSetFpreg => "SET_FPREG and SET_FPREG_LARGE are mutually exclusive",
        HandlerAndChainFlags => "Handler and chained-info flags are mutually exclusive",
        InvalidHandlerRva => "Exception handler RVA cannot be read",
        InvalidScopeTable => "Scope table cannot be read",
        TooManyScopeEntries => "Number of scope table entries exceeds the configured limit",
        TooManyRuntimeFunctions => "Number of runtime functions exceeds the configured limit",
        ChainDepthExceeded => "Chained unwind info nests deeper than the configured limit",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct ExceptionLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    /// Decode unwind info, not just the runtime function array.
    pub load_unwind_info: bool,
    pub max_runtime_functions: u32,
    pub max_scope_entries: u32,
    pub max_chain_depth: u32,
}

impl Default for ExceptionLoadOptions {
    fn default() -> Self {
        ExceptionLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            load_unwind_info: true,
            max_runtime_functions: 0x10_0000,
            max_scope_entries: 0x1000,
            max_chain_depth: 32,
        }
    }
}

/// One entry of a `C_SCOPE_TABLE`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Pread, Pwrite, SizeWith)]
pub struct ScopeTableEntry {
    /// Start RVA of the protected region.
    pub begin: u32,
    /// End RVA (exclusive) of the protected region.
    pub end: u32,
    /// Filter or handler RVA.
    pub handler: u32,
    /// Continuation target RVA.
    pub target: u32,
}

/// Language-specific handler data trailing the unwind codes.
#[derive(Debug, Clone, Default)]
pub struct ExceptionHandlerInfo {
    pub handler_rva: PackedStruct<u32>,
    pub scope_entries: Vec<ScopeTableEntry>,
}

/// A decoded `UNWIND_INFO` record.
#[derive(Debug, Clone, Default)]
pub struct UnwindInfo {
    pub version: u8,
    pub flags: u8,
    pub size_of_prolog: u8,
    pub count_of_codes: u8,
    pub frame_register: Register,
    /// Scaled offset of the established frame pointer from RSP.
    pub frame_register_offset: u32,
    pub unwind_codes: Vec<UnwindCode>,
    pub handler: Option<ExceptionHandlerInfo>,
    pub chained: Option<Box<RuntimeFunctionEntry>>,
    pub errors: ErrorList<ExceptionError>,
}

/// One runtime function plus its decoded unwind info.
#[derive(Debug, Clone, Default)]
pub struct RuntimeFunctionEntry {
    pub descriptor: PackedStruct<RuntimeFunction>,
    pub unwind_info: Option<UnwindInfo>,
    pub errors: ErrorList<ExceptionError>,
}

/// The decoded x64 exception directory.
#[derive(Debug, Clone, Default)]
pub struct ExceptionDirectoryDetails {
    pub runtime_functions: Vec<RuntimeFunctionEntry>,
    pub errors: ErrorList<ExceptionError>,
}

fn read_slot(slots: &[u8], index: usize) -> Option<u16> {
    slots
        .get(index * UNWIND_CODE_SIZE..index * UNWIND_CODE_SIZE + 2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}

fn decode_unwind_codes(info: &mut UnwindInfo, slots: &[u8]) {
    let count = usize::from(info.count_of_codes);
    let mut index = 0usize;
    let mut seen_push_nonvol = false;
    let mut seen_set_fpreg = false;
    let mut seen_set_fpreg_large = false;

    while index < count {
        let Some(slot) = read_slot(slots, index) else {
            info.errors.add_error(ExceptionError::TruncatedUnwindCodes);
            return;
        };
        let code_offset = slot as u8;
        let op = ((slot >> 8) & 0xF) as u8;
        let op_info = (slot >> 12) as u8;
        index += 1;

        let mut consume = |needed: usize, info: &mut UnwindInfo| -> Option<Vec<u16>> {
            let mut extra = Vec::with_capacity(needed);
            for _ in 0..needed {
                let Some(slot) = read_slot(slots, index) else {
                    info.errors.add_error(ExceptionError::TruncatedUnwindCodes);
                    return None;
                };
                extra.push(slot);
                index += 1;
            }
            Some(extra)
        };

        let operation = match op {
            UWOP_PUSH_NONVOL => {
                seen_push_nonvol = true;
                UnwindOperation::PushNonVolatile(Register(op_info))
            }
            UWOP_ALLOC_LARGE => match op_info {
                0 => {
                    let Some(extra) = consume(1, info) else { return };
                    UnwindOperation::Alloc(u32::from(extra[0]) * 8)
                }
                1 => {
                    let Some(extra) = consume(2, info) else { return };
                    UnwindOperation::Alloc(
                        u32::from(extra[0]) | (u32::from(extra[1]) << 16),
                    )
                }
                _ => {
                    info.errors.add_error(ExceptionError::UnknownUnwindCode);
                    return;
                }
            },
            UWOP_ALLOC_SMALL => UnwindOperation::Alloc(u32::from(op_info) * 8 + 8),
            UWOP_SET_FPREG => {
                seen_set_fpreg = true;
                UnwindOperation::SetFPRegister
            }
            UWOP_SET_FPREG_LARGE => {
                if info.version < 2 {
                    info.errors
                        .add_error(ExceptionError::VersionGatedUnwindCode);
                }
                seen_set_fpreg_large = true;
                let Some(extra) = consume(2, info) else { return };
                UnwindOperation::SetFPRegisterLarge(
                    (u32::from(extra[0]) | (u32::from(extra[1]) << 16)) * 16,
                )
            }
            UWOP_SAVE_NONVOL => {
                let Some(extra) = consume(1, info) else { return };
                UnwindOperation::SaveNonVolatile(
                    Register(op_info),
                    StackFrameOffset::with_frame(u32::from(extra[0]) * 8, info.frame_register),
                )
            }
            UWOP_SAVE_NONVOL_FAR => {
                let Some(extra) = consume(2, info) else { return };
                UnwindOperation::SaveNonVolatile(
                    Register(op_info),
                    StackFrameOffset::with_frame(
                        u32::from(extra[0]) | (u32::from(extra[1]) << 16),
                        info.frame_register,
                    ),
                )
            }
            UWOP_EPILOG => {
                if info.version < 2 {
                    info.errors
                        .add_error(ExceptionError::VersionGatedUnwindCode);
                }
                UnwindOperation::Epilog {
                    offset_low_or_size: code_offset,
                    offset_high_or_flags: op_info,
                }
            }
            UWOP_SPARE_CODE => {
                if info.version < 2 {
                    info.errors
                        .add_error(ExceptionError::VersionGatedUnwindCode);
                }
                let Some(_) = consume(1, info) else { return };
                UnwindOperation::SpareCode
            }
            UWOP_SAVE_XMM128 => {
                let Some(extra) = consume(1, info) else { return };
                UnwindOperation::SaveXMM128(
                    Register::xmm(op_info),
                    StackFrameOffset::with_frame(u32::from(extra[0]) * 16, info.frame_register),
                )
            }
            UWOP_SAVE_XMM128_FAR => {
                let Some(extra) = consume(2, info) else { return };
                UnwindOperation::SaveXMM128(
                    Register::xmm(op_info),
                    StackFrameOffset::with_frame(
                        u32::from(extra[0]) | (u32::from(extra[1]) << 16),
                        info.frame_register,
                    ),
                )
            }
            UWOP_PUSH_MACHFRAME => UnwindOperation::PushMachineFrame(op_info != 0),
            _ => {
                info.errors.add_error(ExceptionError::UnknownUnwindCode);
                return;
            }
        };

        // Prolog pushes of nonvolatile registers happen before everything
        // else, so in the (reversed) code array nothing but further pushes
        // or a machine frame may follow the first one.
        if seen_push_nonvol
            && !matches!(
                operation,
                UnwindOperation::PushNonVolatile(_) | UnwindOperation::PushMachineFrame(_)
            )
            && !info.errors.has_error(ExceptionError::PushNonvolOutOfOrder)
        {
            info.errors.add_error(ExceptionError::PushNonvolOutOfOrder);
        }

        info.unwind_codes.push(UnwindCode {
            code_offset,
            operation,
        });
    }

    if seen_set_fpreg && seen_set_fpreg_large {
        info.errors.add_error(ExceptionError::MultipleSetFpreg);
    }
}

fn parse_unwind_info(
    image: &Image,
    rva: u32,
    options: &ExceptionLoadOptions,
    depth: u32,
) -> Option<UnwindInfo> {
    let header = byte_vector_from_rva(
        image,
        rva,
        4,
        options.include_headers,
        options.allow_virtual_data,
    )
    .ok()?;
    let header = header.as_slice();
    if header.len() < 4 {
        return None;
    }

    let mut info = UnwindInfo {
        version: header[0] & 0x7,
        flags: header[0] >> 3,
        size_of_prolog: header[1],
        count_of_codes: header[2],
        frame_register: Register(header[3] & 0xF),
        frame_register_offset: u32::from(header[3] >> 4) * 16,
        ..UnwindInfo::default()
    };
    if !matches!(info.version, 1 | 2) {
        info.errors
            .add_error(ExceptionError::UnsupportedUnwindVersion);
        return Some(info);
    }

    let slots_rva = rva.wrapping_add(4);
    let slots = byte_vector_from_rva(
        image,
        slots_rva,
        usize::from(info.count_of_codes) * UNWIND_CODE_SIZE,
        options.include_headers,
        options.allow_virtual_data,
    );
    match slots {
        Ok(slots) => decode_unwind_codes(&mut info, slots.as_slice()),
        Err(_) => {
            info.errors.add_error(ExceptionError::TruncatedUnwindCodes);
            return Some(info);
        }
    }

    // The trailing region starts after an even number of slots.
    let trailer_rva = slots_rva.wrapping_add(
        ((u32::from(info.count_of_codes) + 1) & !1) * UNWIND_CODE_SIZE as u32,
    );

    let has_handler = info.flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0;
    let is_chained = info.flags & UNW_FLAG_CHAININFO != 0;
    if has_handler && is_chained {
        info.errors.add_error(ExceptionError::HandlerAndChainFlags);
    }

    if is_chained {
        if depth >= options.max_chain_depth {
            info.errors.add_error(ExceptionError::ChainDepthExceeded);
        } else {
            match struct_from_rva::<RuntimeFunction>(
                image,
                trailer_rva,
                options.include_headers,
                options.allow_virtual_data,
            ) {
                Ok(descriptor) => {
                    let mut chained = RuntimeFunctionEntry {
                        descriptor,
                        ..RuntimeFunctionEntry::default()
                    };
                    chained.unwind_info = parse_unwind_info(
                        image,
                        chained.descriptor.unwind_info_address,
                        options,
                        depth + 1,
                    );
                    info.chained = Some(Box::new(chained));
                }
                Err(_) => info.errors.add_error(ExceptionError::InvalidUnwindInfo),
            }
        }
    } else if has_handler {
        match struct_from_rva::<u32>(
            image,
            trailer_rva,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(handler_rva) => {
                let mut handler = ExceptionHandlerInfo {
                    handler_rva,
                    scope_entries: Vec::new(),
                };
                // A C scope table follows for the common `__C_specific_handler`
                // shape; tolerate its absence.
                if let Ok(count) = struct_from_rva::<u32>(
                    image,
                    trailer_rva.wrapping_add(4),
                    options.include_headers,
                    options.allow_virtual_data,
                ) {
                    let mut count = *count;
                    if count > options.max_scope_entries {
                        info.errors.add_error(ExceptionError::TooManyScopeEntries);
                        count = options.max_scope_entries;
                    }
                    let entry_size = packed_size_of::<ScopeTableEntry>() as u32;
                    for i in 0..count {
                        match struct_from_rva::<ScopeTableEntry>(
                            image,
                            trailer_rva.wrapping_add(8 + i * entry_size),
                            options.include_headers,
                            options.allow_virtual_data,
                        ) {
                            Ok(entry) => handler.scope_entries.push(*entry),
                            Err(_) => {
                                info.errors.add_error(ExceptionError::InvalidScopeTable);
                                break;
                            }
                        }
                    }
                }
                info.handler = Some(handler);
            }
            Err(_) => info.errors.add_error(ExceptionError::InvalidHandlerRva),
        }
    }

    Some(info)
}

/// Loads the x64 exception directory, or `None` when the image has none or
/// targets another architecture.
pub fn load(
    image: &Image,
    options: &ExceptionLoadOptions,
) -> Result<Option<ExceptionDirectoryDetails>> {
    if image.machine() != MACHINE_AMD64 {
        return Ok(None);
    }
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::Exception)
        .filter(|d| d.virtual_address != 0 && d.size != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let mut details = ExceptionDirectoryDetails::default();
    if dir.size as usize % RUNTIME_FUNCTION_SIZE != 0 {
        details
            .errors
            .add_error(ExceptionError::UnmatchedDirectorySize);
    }
    let mut count = dir.size / RUNTIME_FUNCTION_SIZE as u32;
    if count > options.max_runtime_functions {
        details
            .errors
            .add_error(ExceptionError::TooManyRuntimeFunctions);
        count = options.max_runtime_functions;
    }
    debug!("exception directory: {} runtime functions", count);

    for i in 0..count {
        let descriptor = match struct_from_rva::<RuntimeFunction>(
            image,
            dir.virtual_address + i * RUNTIME_FUNCTION_SIZE as u32,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                details
                    .errors
                    .add_error(ExceptionError::InvalidRuntimeFunction);
                break;
            }
        };
        let mut entry = RuntimeFunctionEntry {
            descriptor,
            ..RuntimeFunctionEntry::default()
        };
        if options.load_unwind_info && entry.descriptor.unwind_info_address != 0 {
            entry.unwind_info =
                parse_unwind_info(image, entry.descriptor.unwind_info_address, options, 0);
            if entry.unwind_info.is_none() {
                entry.errors.add_error(ExceptionError::InvalidUnwindInfo);
            }
        }
        details.runtime_functions.push(entry);
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

    const PDATA_RVA: u32 = 0x2000;
    const XDATA_RVA: u32 = 0x3000;

    struct UnwindSpec {
        version: u8,
        flags: u8,
        codes: Vec<u16>,
        trailer: Vec<u8>,
    }

    fn build_image(functions: &[(u32, u32)], unwind: UnwindSpec) -> Image {
        let mut pdata = vec![0u8; functions.len() * RUNTIME_FUNCTION_SIZE];
        for (i, (begin, end)) in functions.iter().enumerate() {
            pdata
                .pwrite_with(
                    RuntimeFunction {
                        begin_address: *begin,
                        end_address: *end,
                        unwind_info_address: XDATA_RVA,
                    },
                    i * RUNTIME_FUNCTION_SIZE,
                    scroll::LE,
                )
                .unwrap();
        }

        let mut xdata = vec![0u8; 0x200];
        xdata[0] = (unwind.flags << 3) | unwind.version;
        xdata[1] = 0x10; // prolog size
        xdata[2] = unwind.codes.len() as u8;
        xdata[3] = 0; // no frame register
        let mut offset = 4;
        for slot in &unwind.codes {
            xdata.pwrite_with(*slot, offset, scroll::LE).unwrap();
            offset += 2;
        }
        let trailer_offset = 4 + (unwind.codes.len() + 1) / 2 * 2 * 2;
        xdata[trailer_offset..trailer_offset + unwind.trailer.len()]
            .copy_from_slice(&unwind.trailer);

        let bytes = synthetic_image_bytes(
            true,
            &[
                SectionSpec::new(".pdata", PDATA_RVA, 0x200, pdata),
                SectionSpec::new(".xdata", XDATA_RVA, 0x200, xdata),
            ],
            &[(
                DirectoryType::Exception as usize,
                DataDirectory {
                    virtual_address: PDATA_RVA,
                    size: (functions.len() * RUNTIME_FUNCTION_SIZE) as u32,
                },
            )],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    fn slot(code_offset: u8, op: u8, op_info: u8) -> u16 {
        u16::from(code_offset) | (u16::from(op) << 8) | (u16::from(op_info) << 12)
    }

    #[test]
    fn decodes_a_well_formed_prolog() {
        // Reversed prolog order: alloc, save, then the pushes.
        let codes = vec![
            slot(0x10, UWOP_ALLOC_SMALL, 3),
            slot(0x0C, UWOP_SAVE_NONVOL, 3),
            0x0028, // SAVE_NONVOL offset slot
            slot(0x04, UWOP_PUSH_NONVOL, 15),
            slot(0x02, UWOP_PUSH_NONVOL, 5),
        ];
        let image = build_image(
            &[(0x1000, 0x1080)],
            UnwindSpec {
                version: 1,
                flags: 0,
                codes,
                trailer: Vec::new(),
            },
        );
        let exceptions = load(&image, &ExceptionLoadOptions::default()).unwrap().unwrap();
        assert_eq!(exceptions.runtime_functions.len(), 1);
        let info = exceptions.runtime_functions[0].unwind_info.as_ref().unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.unwind_codes.len(), 4);
        assert_eq!(
            info.unwind_codes[0].operation,
            UnwindOperation::Alloc(3 * 8 + 8)
        );
        assert_eq!(
            info.unwind_codes[1].operation,
            UnwindOperation::SaveNonVolatile(Register(3), StackFrameOffset::RSP(0x28 * 8))
        );
        assert_eq!(
            info.unwind_codes[3].operation,
            UnwindOperation::PushNonVolatile(Register(5))
        );
        assert!(!info.errors.has_errors());
    }

    #[test]
    fn push_nonvol_after_other_codes_is_diagnosed() {
        // A push appearing before an alloc in array order means the prolog
        // pushed after allocating.
        let codes = vec![
            slot(0x02, UWOP_PUSH_NONVOL, 5),
            slot(0x10, UWOP_ALLOC_SMALL, 3),
        ];
        let image = build_image(
            &[(0x1000, 0x1080)],
            UnwindSpec {
                version: 1,
                flags: 0,
                codes,
                trailer: Vec::new(),
            },
        );
        let exceptions = load(&image, &ExceptionLoadOptions::default()).unwrap().unwrap();
        let info = exceptions.runtime_functions[0].unwind_info.as_ref().unwrap();
        assert!(info.errors.has_error(ExceptionError::PushNonvolOutOfOrder));
    }

    #[test]
    fn handler_with_scope_table() {
        let mut trailer = Vec::new();
        trailer.extend_from_slice(&0x1234u32.to_le_bytes()); // handler rva
        trailer.extend_from_slice(&1u32.to_le_bytes()); // scope count
        trailer.extend_from_slice(&0x1000u32.to_le_bytes());
        trailer.extend_from_slice(&0x1010u32.to_le_bytes());
        trailer.extend_from_slice(&0x1u32.to_le_bytes());
        trailer.extend_from_slice(&0x1020u32.to_le_bytes());
        let image = build_image(
            &[(0x1000, 0x1080)],
            UnwindSpec {
                version: 1,
                flags: UNW_FLAG_EHANDLER,
                codes: vec![slot(0x02, UWOP_PUSH_NONVOL, 5)],
                trailer,
            },
        );
        let exceptions = load(&image, &ExceptionLoadOptions::default()).unwrap().unwrap();
        let info = exceptions.runtime_functions[0].unwind_info.as_ref().unwrap();
        let handler = info.handler.as_ref().unwrap();
        assert_eq!(*handler.handler_rva, 0x1234);
        assert_eq!(handler.scope_entries.len(), 1);
        assert_eq!(handler.scope_entries[0].target, 0x1020);
        assert!(info.chained.is_none());
    }

    #[test]
    fn chained_info_nests() {
        let mut trailer = Vec::new();
        // The chained RUNTIME_FUNCTION points at a second, plain record.
        trailer.extend_from_slice(&0x1000u32.to_le_bytes());
        trailer.extend_from_slice(&0x1040u32.to_le_bytes());
        trailer.extend_from_slice(&(XDATA_RVA + 0x100).to_le_bytes());
        let image = build_image(
            &[(0x1040, 0x1080)],
            UnwindSpec {
                version: 1,
                flags: UNW_FLAG_CHAININFO,
                codes: Vec::new(),
                trailer,
            },
        );
        // A minimal parent record at XDATA_RVA + 0x100 (all zeros decodes as
        // version 0), so just confirm the nesting happened.
        let exceptions = load(&image, &ExceptionLoadOptions::default()).unwrap().unwrap();
        let info = exceptions.runtime_functions[0].unwind_info.as_ref().unwrap();
        let chained = info.chained.as_ref().unwrap();
        assert_eq!(chained.descriptor.begin_address, 0x1000);
        assert!(
            chained
                .unwind_info
                .as_ref()
                .unwrap()
                .errors
                .has_error(ExceptionError::UnsupportedUnwindVersion)
        );
    }

    #[test]
    fn version_gated_codes_are_diagnosed() {
        let codes = vec![slot(0, UWOP_EPILOG, 1)];
        let image = build_image(
            &[(0x1000, 0x1080)],
            UnwindSpec {
                version: 1,
                flags: 0,
                codes,
                trailer: Vec::new(),
            },
        );
        let exceptions = load(&image, &ExceptionLoadOptions::default()).unwrap().unwrap();
        let info = exceptions.runtime_functions[0].unwind_info.as_ref().unwrap();
        assert!(info.errors.has_error(ExceptionError::VersionGatedUnwindCode));
    }

    #[test]
    fn leftover_directory_bytes_are_diagnosed() {
        let image = build_image(
            &[(0x1000, 0x1080)],
            UnwindSpec {
                version: 1,
                flags: 0,
                codes: Vec::new(),
                trailer: Vec::new(),
            },
        );
        // Rebuild with a directory size that is not a descriptor multiple.
        let mut image = image;
        image
            .data_directories
            .get_directory_mut(DirectoryType::Exception)
            .unwrap()
            .size = RUNTIME_FUNCTION_SIZE as u32 + 5;
        let exceptions = load(&image, &ExceptionLoadOptions::default()).unwrap().unwrap();
        assert!(
            exceptions
                .errors
                .has_error(ExceptionError::UnmatchedDirectorySize)
        );
    }
}
