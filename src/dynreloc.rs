//! The dynamic value relocation table (DVRT).
//!
//! Retpoline, ARM64X, and hot-patch metadata live here, hanging off the load
//! configuration directory. The table is versioned (1 or 2); each entry is
//! keyed by a *symbol* that selects how its base-relocation-shaped fixup
//! blocks are interpreted. Function-override entries (symbol 7) nest one
//! level deeper, carrying per-function relocation runs and a BDD node
//! region.

use core::fmt;

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::byte_vector_from_rva;
use crate::packed::{PackedByteVector, packed_size_of};
use crate::relocation::ImageBaseRelocation;

/// Return Flow prologue guard relocations.
pub const IMAGE_DYNAMIC_RELOCATION_GUARD_RF_PROLOGUE: u64 = 0x0000_0001;
/// Return Flow epilogue guard relocations.
pub const IMAGE_DYNAMIC_RELOCATION_GUARD_RF_EPILOGUE: u64 = 0x0000_0002;
/// Import control transfer guard relocations.
pub const IMAGE_DYNAMIC_RELOCATION_GUARD_IMPORT_CONTROL_TRANSFER: u64 = 0x0000_0003;
/// Indirect control transfer guard relocations.
pub const IMAGE_DYNAMIC_RELOCATION_GUARD_INDIR_CONTROL_TRANSFER: u64 = 0x0000_0004;
/// Switch table branch guard relocations.
pub const IMAGE_DYNAMIC_RELOCATION_GUARD_SWITCHTABLE_BRANCH: u64 = 0x0000_0005;
/// ARM64X architecture fixups.
pub const IMAGE_DYNAMIC_RELOCATION_ARM64X: u64 = 0x0000_0006;
/// Function override (hot patching) relocations.
pub const IMAGE_DYNAMIC_RELOCATION_FUNCTION_OVERRIDE: u64 = 0x0000_0007;
/// ARM64 kernel import call transfer relocations.
pub const IMAGE_DYNAMIC_RELOCATION_ARM64_KERNEL_IMPORT_CALL_TRANSFER: u64 = 0x0000_0008;

error_codes! {
    /// DVRT diagnostics.
    pub enum DynRelocError("dynamic_relocation") {
        UnsupportedVersion => "Unsupported dynamic value relocation table version",
        InvalidTable => "Dynamic value relocation table cannot be read",
        InvalidEntry => "Dynamic relocation entry cannot be read",
        InvalidBlockSize => "Dynamic relocation block size is invalid",
        InvalidFixup => "Dynamic relocation fixup is truncated",
        InvalidFunctionOverride => "Function override relocation cannot be read",
        InvalidBddInfo => "Function override BDD region cannot be read",
        UnmatchedSize => "Declared size does not match the entries it holds",
    }
}

/// `IMAGE_DYNAMIC_RELOCATION_TABLE` header.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_DYNAMIC_RELOCATION_TABLE"))]
pub struct ImageDynamicRelocationTable {
    /// 1 or 2.
    pub version: u32,
    /// Bytes of entries following this header.
    pub size: u32,
}

/// `IMAGE_DYNAMIC_RELOCATION_V2` fixed prefix (symbol width varies).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DynRelocV2Header {
    pub header_size: u32,
    pub fixup_info_size: u32,
    pub symbol: u64,
    pub symbol_group: u32,
    pub flags: u32,
}

/// An import control transfer fixup (`IMAGE_IMPORT_CONTROL_TRANSFER_DYNAMIC_RELOCATION`).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ImportControlTransferDynReloc(pub u32);

impl fmt::Debug for ImportControlTransferDynReloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportControlTransferDynReloc")
            .field("page_relative_offset", &self.page_relative_offset())
            .field("indirect_call", &self.indirect_call())
            .field("iat_index", &self.iat_index())
            .finish()
    }
}

impl ImportControlTransferDynReloc {
    /// Bits 0-11.
    pub fn page_relative_offset(&self) -> u16 {
        (self.0 & 0xFFF) as u16
    }

    /// Bit 12.
    pub fn indirect_call(&self) -> bool {
        (self.0 >> 12) & 1 != 0
    }

    /// Bits 13-31.
    pub fn iat_index(&self) -> u32 {
        (self.0 >> 13) & 0x7FFFF
    }
}

/// An indirect control transfer fixup (`IMAGE_INDIR_CONTROL_TRANSFER_DYNAMIC_RELOCATION`).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct IndirControlTransferDynReloc(pub u16);

impl fmt::Debug for IndirControlTransferDynReloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndirControlTransferDynReloc")
            .field("page_relative_offset", &self.page_relative_offset())
            .field("indirect_call", &self.indirect_call())
            .field("rex_w_prefix", &self.rex_w_prefix())
            .field("cfg_check", &self.cfg_check())
            .finish()
    }
}

impl IndirControlTransferDynReloc {
    /// Bits 0-11.
    pub fn page_relative_offset(&self) -> u16 {
        self.0 & 0xFFF
    }

    /// Bit 12.
    pub fn indirect_call(&self) -> bool {
        (self.0 >> 12) & 1 != 0
    }

    /// Bit 13.
    pub fn rex_w_prefix(&self) -> bool {
        (self.0 >> 13) & 1 != 0
    }

    /// Bit 14.
    pub fn cfg_check(&self) -> bool {
        (self.0 >> 14) & 1 != 0
    }
}

/// A switch table branch fixup (`IMAGE_SWITCHTABLE_BRANCH_DYNAMIC_RELOCATION`).
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct SwitchtableBranchDynReloc(pub u16);

impl fmt::Debug for SwitchtableBranchDynReloc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwitchtableBranchDynReloc")
            .field("page_relative_offset", &self.page_relative_offset())
            .field("register_number", &self.register_number())
            .finish()
    }
}

impl SwitchtableBranchDynReloc {
    /// Bits 0-11.
    pub fn page_relative_offset(&self) -> u16 {
        self.0 & 0xFFF
    }

    /// Bits 12-15.
    pub fn register_number(&self) -> u8 {
        (self.0 >> 12) as u8
    }
}

/// One decoded ARM64X fixup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arm64xFixup {
    /// Write `size` zero bytes at the page offset.
    ZeroFill { offset: u16, size: u32 },
    /// Copy literal bytes at the page offset.
    CopyData { offset: u16, data: Vec<u8> },
    /// Add a scaled, signed delta to the value at the page offset.
    AddDelta { offset: u16, delta: i64 },
}

/// One decoded fixup from a dynamic relocation block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynRelocFixup {
    ImportControlTransfer(ImportControlTransferDynReloc),
    IndirControlTransfer(IndirControlTransferDynReloc),
    SwitchtableBranch(SwitchtableBranchDynReloc),
    Arm64x(Arm64xFixup),
    /// Symbols without a dedicated shape: the raw 16-bit word.
    Generic(u16),
}

/// One base-relocation-shaped block of fixups.
#[derive(Debug, Clone, Default)]
pub struct DynRelocBlock {
    pub descriptor: ImageBaseRelocation,
    pub fixups: Vec<DynRelocFixup>,
    pub errors: ErrorList<DynRelocError>,
}

/// One function-override run.
#[derive(Debug, Clone, Default)]
pub struct FunctionOverrideReloc {
    pub original_rva: u32,
    pub bdd_offset: u32,
    /// Override target RVAs.
    pub rvas: Vec<u32>,
    pub blocks: Vec<DynRelocBlock>,
    pub errors: ErrorList<DynRelocError>,
}

/// A BDD decision node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BddNode {
    pub left: u16,
    pub right: u16,
    pub value: u32,
}

/// The BDD region of a function-override entry.
#[derive(Debug, Clone, Default)]
pub struct BddInfo {
    pub version: u32,
    pub nodes: Vec<BddNode>,
    pub errors: ErrorList<DynRelocError>,
}

/// Function-override payload (symbol 7).
#[derive(Debug, Clone, Default)]
pub struct FunctionOverrideData {
    pub functions: Vec<FunctionOverrideReloc>,
    pub bdd_info: Option<BddInfo>,
    pub errors: ErrorList<DynRelocError>,
}

/// What a dynamic relocation entry carries, selected by its symbol.
#[derive(Debug, Clone)]
pub enum DynRelocPayload {
    /// Fixup blocks (symbols 3-6, 8, and unknown symbols).
    Blocks(Vec<DynRelocBlock>),
    /// Function override data (symbol 7).
    FunctionOverride(FunctionOverrideData),
    /// RF prologue/epilogue payloads, kept raw (symbols 1-2).
    Raw(PackedByteVector),
}

/// One v1 dynamic relocation entry.
#[derive(Debug, Clone)]
pub struct DynamicRelocation {
    pub symbol: u64,
    pub payload: DynRelocPayload,
    pub errors: ErrorList<DynRelocError>,
}

/// One v2 dynamic relocation entry.
#[derive(Debug, Clone)]
pub struct DynamicRelocationV2 {
    pub header: DynRelocV2Header,
    /// Header bytes past the fixed prefix.
    pub extra_header: Vec<u8>,
    pub payload: DynRelocPayload,
    pub errors: ErrorList<DynRelocError>,
}

/// The decoded DVRT.
#[derive(Debug, Clone, Default)]
pub struct DynamicRelocationTable {
    pub version: u32,
    pub relocations: Vec<DynamicRelocation>,
    pub relocations_v2: Vec<DynamicRelocationV2>,
    pub errors: ErrorList<DynRelocError>,
}

/// Options for [`parse`].
#[derive(Debug, Copy, Clone)]
pub struct DynRelocLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
}

impl Default for DynRelocLoadOptions {
    fn default() -> Self {
        DynRelocLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
        }
    }
}

fn parse_arm64x_fixup(
    bytes: &[u8],
    offset: &mut usize,
    meta: u16,
    block: &mut DynRelocBlock,
) -> Option<Arm64xFixup> {
    let page_offset = meta & 0xFFF;
    let fixup_type = (meta >> 12) & 0x3;
    let scale = (meta >> 14) & 0x3;
    match fixup_type {
        0 => Some(Arm64xFixup::ZeroFill {
            offset: page_offset,
            size: 1u32 << scale,
        }),
        1 => {
            let size = 1usize << scale;
            let Some(data) = bytes.get(*offset..*offset + size) else {
                block.errors.add_error(DynRelocError::InvalidFixup);
                return None;
            };
            *offset += size;
            Some(Arm64xFixup::CopyData {
                offset: page_offset,
                data: data.to_vec(),
            })
        }
        2 => {
            let Ok(raw) = bytes.gread_with::<u16>(offset, scroll::LE) else {
                block.errors.add_error(DynRelocError::InvalidFixup);
                return None;
            };
            let multiplier = if scale & 1 != 0 { 8i64 } else { 4i64 };
            let sign = if scale & 2 != 0 { -1i64 } else { 1i64 };
            Some(Arm64xFixup::AddDelta {
                offset: page_offset,
                delta: i64::from(raw) * multiplier * sign,
            })
        }
        _ => {
            block.errors.add_error(DynRelocError::InvalidFixup);
            None
        }
    }
}

/// Walks `size` bytes of base-relocation-shaped blocks, decoding each word
/// per `symbol`.
fn parse_blocks(bytes: &[u8], symbol: u64, errors: &mut ErrorList<DynRelocError>) -> Vec<DynRelocBlock> {
    let header_size = packed_size_of::<ImageBaseRelocation>();
    let mut blocks = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < header_size {
            errors.add_error(DynRelocError::UnmatchedSize);
            break;
        }
        let Ok(descriptor) = bytes.pread_with::<ImageBaseRelocation>(offset, scroll::LE) else {
            errors.add_error(DynRelocError::InvalidEntry);
            break;
        };
        let block_size = descriptor.size_of_block as usize;
        if block_size < header_size || offset + block_size > bytes.len() {
            errors.add_error(DynRelocError::InvalidBlockSize);
            break;
        }
        let mut block = DynRelocBlock {
            descriptor,
            ..DynRelocBlock::default()
        };
        let block_bytes = &bytes[offset + header_size..offset + block_size];
        let mut pos = 0usize;
        while pos < block_bytes.len() {
            match symbol {
                IMAGE_DYNAMIC_RELOCATION_GUARD_IMPORT_CONTROL_TRANSFER => {
                    let Ok(raw) = block_bytes.gread_with::<u32>(&mut pos, scroll::LE) else {
                        block.errors.add_error(DynRelocError::InvalidFixup);
                        break;
                    };
                    if raw == 0 {
                        continue;
                    }
                    block
                        .fixups
                        .push(DynRelocFixup::ImportControlTransfer(
                            ImportControlTransferDynReloc(raw),
                        ));
                }
                IMAGE_DYNAMIC_RELOCATION_GUARD_INDIR_CONTROL_TRANSFER => {
                    let Ok(raw) = block_bytes.gread_with::<u16>(&mut pos, scroll::LE) else {
                        block.errors.add_error(DynRelocError::InvalidFixup);
                        break;
                    };
                    if raw == 0 {
                        continue;
                    }
                    block
                        .fixups
                        .push(DynRelocFixup::IndirControlTransfer(
                            IndirControlTransferDynReloc(raw),
                        ));
                }
                IMAGE_DYNAMIC_RELOCATION_GUARD_SWITCHTABLE_BRANCH => {
                    let Ok(raw) = block_bytes.gread_with::<u16>(&mut pos, scroll::LE) else {
                        block.errors.add_error(DynRelocError::InvalidFixup);
                        break;
                    };
                    if raw == 0 {
                        continue;
                    }
                    block
                        .fixups
                        .push(DynRelocFixup::SwitchtableBranch(SwitchtableBranchDynReloc(
                            raw,
                        )));
                }
                IMAGE_DYNAMIC_RELOCATION_ARM64X => {
                    let Ok(meta) = block_bytes.gread_with::<u16>(&mut pos, scroll::LE) else {
                        block.errors.add_error(DynRelocError::InvalidFixup);
                        break;
                    };
                    if meta == 0 {
                        continue;
                    }
                    match parse_arm64x_fixup(block_bytes, &mut pos, meta, &mut block) {
                        Some(fixup) => block.fixups.push(DynRelocFixup::Arm64x(fixup)),
                        None => break,
                    }
                }
                _ => {
                    let Ok(raw) = block_bytes.gread_with::<u16>(&mut pos, scroll::LE) else {
                        block.errors.add_error(DynRelocError::InvalidFixup);
                        break;
                    };
                    if raw == 0 {
                        continue;
                    }
                    block.fixups.push(DynRelocFixup::Generic(raw));
                }
            }
        }
        blocks.push(block);
        offset += block_size;
    }
    blocks
}

fn parse_function_override(bytes: &[u8]) -> FunctionOverrideData {
    let mut data = FunctionOverrideData::default();
    let mut offset = 0usize;
    let Ok(func_override_size) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
        data.errors.add_error(DynRelocError::InvalidFunctionOverride);
        return data;
    };
    let funcs_end = offset + func_override_size as usize;
    if funcs_end > bytes.len() {
        data.errors.add_error(DynRelocError::InvalidFunctionOverride);
        return data;
    }

    while offset < funcs_end {
        let mut func = FunctionOverrideReloc::default();
        let header: Option<(u32, u32, u32, u32)> = (|| {
            let original_rva = bytes.gread_with::<u32>(&mut offset, scroll::LE).ok()?;
            let bdd_offset = bytes.gread_with::<u32>(&mut offset, scroll::LE).ok()?;
            let rva_size = bytes.gread_with::<u32>(&mut offset, scroll::LE).ok()?;
            let base_reloc_size = bytes.gread_with::<u32>(&mut offset, scroll::LE).ok()?;
            Some((original_rva, bdd_offset, rva_size, base_reloc_size))
        })();
        let Some((original_rva, bdd_offset, rva_size, base_reloc_size)) = header else {
            data.errors.add_error(DynRelocError::InvalidFunctionOverride);
            break;
        };
        func.original_rva = original_rva;
        func.bdd_offset = bdd_offset;

        for _ in 0..rva_size / 4 {
            match bytes.gread_with::<u32>(&mut offset, scroll::LE) {
                Ok(rva) => func.rvas.push(rva),
                Err(_) => {
                    func.errors.add_error(DynRelocError::InvalidFunctionOverride);
                    data.functions.push(func);
                    return data;
                }
            }
        }
        let reloc_end = offset + base_reloc_size as usize;
        if reloc_end > funcs_end {
            func.errors.add_error(DynRelocError::InvalidFunctionOverride);
            data.functions.push(func);
            break;
        }
        func.blocks = parse_blocks(&bytes[offset..reloc_end], 0, &mut func.errors);
        offset = reloc_end;
        data.functions.push(func);
    }

    // The BDD region follows the function override area.
    let mut bdd_offset = funcs_end;
    if bdd_offset + 8 <= bytes.len() {
        let mut bdd = BddInfo::default();
        let version = bytes.gread_with::<u32>(&mut bdd_offset, scroll::LE).unwrap_or(0);
        let bdd_size = bytes
            .gread_with::<u32>(&mut bdd_offset, scroll::LE)
            .unwrap_or(0) as usize;
        bdd.version = version;
        if bdd_offset + bdd_size > bytes.len() || bdd_size % 8 != 0 {
            bdd.errors.add_error(DynRelocError::InvalidBddInfo);
        } else {
            for _ in 0..bdd_size / 8 {
                let left = bytes.gread_with::<u16>(&mut bdd_offset, scroll::LE).unwrap_or(0);
                let right = bytes.gread_with::<u16>(&mut bdd_offset, scroll::LE).unwrap_or(0);
                let value = bytes.gread_with::<u32>(&mut bdd_offset, scroll::LE).unwrap_or(0);
                bdd.nodes.push(BddNode { left, right, value });
            }
        }
        data.bdd_info = Some(bdd);
    }
    data
}

fn payload_for_symbol(bytes: &[u8], symbol: u64, errors: &mut ErrorList<DynRelocError>) -> DynRelocPayload {
    match symbol {
        IMAGE_DYNAMIC_RELOCATION_GUARD_RF_PROLOGUE
        | IMAGE_DYNAMIC_RELOCATION_GUARD_RF_EPILOGUE => {
            DynRelocPayload::Raw(PackedByteVector::new(bytes.to_vec()))
        }
        IMAGE_DYNAMIC_RELOCATION_FUNCTION_OVERRIDE => {
            DynRelocPayload::FunctionOverride(parse_function_override(bytes))
        }
        _ => DynRelocPayload::Blocks(parse_blocks(bytes, symbol, errors)),
    }
}

/// Parses the DVRT at `rva` (already resolved from the load configuration).
pub fn parse(
    image: &Image,
    rva: u32,
    options: &DynRelocLoadOptions,
) -> Result<DynamicRelocationTable> {
    let header = crate::image::accessor::struct_from_rva::<ImageDynamicRelocationTable>(
        image,
        rva,
        options.include_headers,
        options.allow_virtual_data,
    )?;
    let mut table = DynamicRelocationTable {
        version: header.version,
        ..DynamicRelocationTable::default()
    };
    debug!("dvrt: version {}, {:#x} bytes", header.version, header.size);
    if !matches!(header.version, 1 | 2) {
        table.errors.add_error(DynRelocError::UnsupportedVersion);
        return Ok(table);
    }

    let body = byte_vector_from_rva(
        image,
        rva.wrapping_add(header.packed_size() as u32),
        header.size as usize,
        options.include_headers,
        options.allow_virtual_data,
    )?;
    let bytes = body.as_slice();
    let is_64 = image.is_64bit();
    let symbol_size = if is_64 { 8 } else { 4 };
    let mut offset = 0usize;

    while offset < bytes.len() {
        if header.version == 1 {
            let symbol = if is_64 {
                bytes.gread_with::<u64>(&mut offset, scroll::LE)
            } else {
                bytes.gread_with::<u32>(&mut offset, scroll::LE).map(u64::from)
            };
            let Ok(symbol) = symbol else {
                table.errors.add_error(DynRelocError::InvalidEntry);
                break;
            };
            let Ok(base_reloc_size) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
                table.errors.add_error(DynRelocError::InvalidEntry);
                break;
            };
            let end = offset + base_reloc_size as usize;
            if end > bytes.len() {
                table.errors.add_error(DynRelocError::UnmatchedSize);
                break;
            }
            let mut entry = DynamicRelocation {
                symbol,
                payload: DynRelocPayload::Blocks(Vec::new()),
                errors: ErrorList::new(),
            };
            entry.payload = payload_for_symbol(&bytes[offset..end], symbol, &mut entry.errors);
            table.relocations.push(entry);
            offset = end;
        } else {
            let entry_start = offset;
            let Ok(header_size) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
                table.errors.add_error(DynRelocError::InvalidEntry);
                break;
            };
            let Ok(fixup_info_size) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
                table.errors.add_error(DynRelocError::InvalidEntry);
                break;
            };
            let symbol = if is_64 {
                bytes.gread_with::<u64>(&mut offset, scroll::LE)
            } else {
                bytes.gread_with::<u32>(&mut offset, scroll::LE).map(u64::from)
            };
            let Ok(symbol) = symbol else {
                table.errors.add_error(DynRelocError::InvalidEntry);
                break;
            };
            let Ok(symbol_group) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
                table.errors.add_error(DynRelocError::InvalidEntry);
                break;
            };
            let Ok(flags) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
                table.errors.add_error(DynRelocError::InvalidEntry);
                break;
            };
            let fixed_prefix = 16 + symbol_size;
            if (header_size as usize) < fixed_prefix
                || entry_start + header_size as usize > bytes.len()
            {
                table.errors.add_error(DynRelocError::InvalidEntry);
                break;
            }
            let extra_header =
                bytes[entry_start + fixed_prefix..entry_start + header_size as usize].to_vec();
            let fixups_start = entry_start + header_size as usize;
            let fixups_end = fixups_start + fixup_info_size as usize;
            if fixups_end > bytes.len() {
                table.errors.add_error(DynRelocError::UnmatchedSize);
                break;
            }
            let mut entry = DynamicRelocationV2 {
                header: DynRelocV2Header {
                    header_size,
                    fixup_info_size,
                    symbol,
                    symbol_group,
                    flags,
                },
                extra_header,
                payload: DynRelocPayload::Blocks(Vec::new()),
                errors: ErrorList::new(),
            };
            entry.payload =
                payload_for_symbol(&bytes[fixups_start..fixups_end], symbol, &mut entry.errors);
            table.relocations_v2.push(entry);
            offset = fixups_end;
        }
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::image::{Image, ImageLoadOptions};
    use crate::test_fixtures::{SectionSpec, synthetic_image_bytes};
    use scroll::Pwrite;

    const DVRT_RVA: u32 = 0x2000;

    fn image_with_table(table_bytes: &[u8]) -> Image {
        let mut data = vec![0u8; 0x400];
        data[..table_bytes.len()].copy_from_slice(table_bytes);
        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".rdata", DVRT_RVA, 0x400, data)],
            &[],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    fn block(page_rva: u32, words: &[u16]) -> Vec<u8> {
        let mut out = vec![0u8; 8];
        out.pwrite_with(
            ImageBaseRelocation {
                virtual_address: page_rva,
                size_of_block: (8 + words.len() * 2) as u32,
            },
            0,
            scroll::LE,
        )
        .unwrap();
        let mut raw = vec![0u8; words.len() * 2];
        for (i, w) in words.iter().enumerate() {
            raw.pwrite_with(*w, i * 2, scroll::LE).unwrap();
        }
        out.extend_from_slice(&raw);
        out
    }

    fn v1_table(symbol: u64, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&symbol.to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(payload);
        let mut table = Vec::new();
        table.extend_from_slice(&1u32.to_le_bytes());
        table.extend_from_slice(&(body.len() as u32).to_le_bytes());
        table.extend_from_slice(&body);
        table
    }

    #[test]
    fn parses_v1_switchtable_branch_entries() {
        // Two fixups: offsets 0x10 (reg 3) and 0x20 (reg 5), plus padding.
        let words = [(3u16 << 12) | 0x10, (5u16 << 12) | 0x20, 0];
        let table_bytes = v1_table(
            IMAGE_DYNAMIC_RELOCATION_GUARD_SWITCHTABLE_BRANCH,
            &block(0x1000, &words),
        );
        let image = image_with_table(&table_bytes);
        let table = parse(&image, DVRT_RVA, &DynRelocLoadOptions::default()).unwrap();
        assert_eq!(table.version, 1);
        assert_eq!(table.relocations.len(), 1);
        let entry = &table.relocations[0];
        assert_eq!(entry.symbol, IMAGE_DYNAMIC_RELOCATION_GUARD_SWITCHTABLE_BRANCH);
        let DynRelocPayload::Blocks(blocks) = &entry.payload else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].descriptor.virtual_address, 0x1000);
        assert_eq!(blocks[0].fixups.len(), 2);
        match &blocks[0].fixups[1] {
            DynRelocFixup::SwitchtableBranch(fixup) => {
                assert_eq!(fixup.page_relative_offset(), 0x20);
                assert_eq!(fixup.register_number(), 5);
            }
            other => panic!("unexpected fixup {other:?}"),
        }
    }

    #[test]
    fn parses_arm64x_fixup_kinds() {
        // zero-fill (4 bytes), copy 2 bytes, add delta +8*value.
        let mut payload = Vec::new();
        payload.extend_from_slice(&((0u16 << 12) | (2 << 14) | 0x10).to_le_bytes());
        payload.extend_from_slice(&((1u16 << 12) | (1 << 14) | 0x20).to_le_bytes());
        payload.extend_from_slice(&[0xAB, 0xCD]);
        payload.extend_from_slice(&((2u16 << 12) | (1 << 14) | 0x30).to_le_bytes());
        payload.extend_from_slice(&3u16.to_le_bytes());
        let mut words_block = vec![0u8; 8];
        words_block
            .pwrite_with(
                ImageBaseRelocation {
                    virtual_address: 0x3000,
                    size_of_block: (8 + payload.len()) as u32,
                },
                0,
                scroll::LE,
            )
            .unwrap();
        words_block.extend_from_slice(&payload);

        let table_bytes = v1_table(IMAGE_DYNAMIC_RELOCATION_ARM64X, &words_block);
        let image = image_with_table(&table_bytes);
        let table = parse(&image, DVRT_RVA, &DynRelocLoadOptions::default()).unwrap();
        let DynRelocPayload::Blocks(blocks) = &table.relocations[0].payload else {
            panic!("expected blocks");
        };
        assert_eq!(
            blocks[0].fixups[0],
            DynRelocFixup::Arm64x(Arm64xFixup::ZeroFill { offset: 0x10, size: 4 })
        );
        assert_eq!(
            blocks[0].fixups[1],
            DynRelocFixup::Arm64x(Arm64xFixup::CopyData {
                offset: 0x20,
                data: vec![0xAB, 0xCD],
            })
        );
        assert_eq!(
            blocks[0].fixups[2],
            DynRelocFixup::Arm64x(Arm64xFixup::AddDelta { offset: 0x30, delta: 24 })
        );
    }

    #[test]
    fn parses_v2_import_control_transfer() {
        let fixup: u32 = 0x123 | (1 << 12) | (7 << 13);
        let mut payload = Vec::new();
        payload.extend_from_slice(&fixup.to_le_bytes());
        let mut blocks_bytes = vec![0u8; 8];
        blocks_bytes
            .pwrite_with(
                ImageBaseRelocation {
                    virtual_address: 0x5000,
                    size_of_block: (8 + payload.len()) as u32,
                },
                0,
                scroll::LE,
            )
            .unwrap();
        blocks_bytes.extend_from_slice(&payload);

        let mut body = Vec::new();
        body.extend_from_slice(&24u32.to_le_bytes()); // header_size (16 + 8)
        body.extend_from_slice(&(blocks_bytes.len() as u32).to_le_bytes());
        body.extend_from_slice(
            &IMAGE_DYNAMIC_RELOCATION_GUARD_IMPORT_CONTROL_TRANSFER.to_le_bytes(),
        );
        body.extend_from_slice(&0u32.to_le_bytes()); // symbol_group
        body.extend_from_slice(&0u32.to_le_bytes()); // flags
        body.extend_from_slice(&blocks_bytes);

        let mut table_bytes = Vec::new();
        table_bytes.extend_from_slice(&2u32.to_le_bytes());
        table_bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
        table_bytes.extend_from_slice(&body);

        let image = image_with_table(&table_bytes);
        let table = parse(&image, DVRT_RVA, &DynRelocLoadOptions::default()).unwrap();
        assert_eq!(table.version, 2);
        assert_eq!(table.relocations_v2.len(), 1);
        let entry = &table.relocations_v2[0];
        assert_eq!(
            entry.header.symbol,
            IMAGE_DYNAMIC_RELOCATION_GUARD_IMPORT_CONTROL_TRANSFER
        );
        let DynRelocPayload::Blocks(blocks) = &entry.payload else {
            panic!("expected blocks");
        };
        match &blocks[0].fixups[0] {
            DynRelocFixup::ImportControlTransfer(fixup) => {
                assert_eq!(fixup.page_relative_offset(), 0x123);
                assert!(fixup.indirect_call());
                assert_eq!(fixup.iat_index(), 7);
            }
            other => panic!("unexpected fixup {other:?}"),
        }
    }

    #[test]
    fn parses_function_override_with_bdd() {
        let inner_block = block(0x7000, &[(3u16 << 12) | 0x44, 0]);
        let mut fo = Vec::new();
        // func_override_size covers one function record.
        let func_size = 16 + 4 + inner_block.len();
        fo.extend_from_slice(&(func_size as u32).to_le_bytes());
        fo.extend_from_slice(&0x1234u32.to_le_bytes()); // original_rva
        fo.extend_from_slice(&0u32.to_le_bytes()); // bdd_offset
        fo.extend_from_slice(&4u32.to_le_bytes()); // rva_size
        fo.extend_from_slice(&(inner_block.len() as u32).to_le_bytes());
        fo.extend_from_slice(&0x5678u32.to_le_bytes()); // one override rva
        fo.extend_from_slice(&inner_block);
        // BDD region: version 1, one node.
        fo.extend_from_slice(&1u32.to_le_bytes());
        fo.extend_from_slice(&8u32.to_le_bytes());
        fo.extend_from_slice(&1u16.to_le_bytes());
        fo.extend_from_slice(&2u16.to_le_bytes());
        fo.extend_from_slice(&0xAAAAu32.to_le_bytes());

        let table_bytes = v1_table(IMAGE_DYNAMIC_RELOCATION_FUNCTION_OVERRIDE, &fo);
        let image = image_with_table(&table_bytes);
        let table = parse(&image, DVRT_RVA, &DynRelocLoadOptions::default()).unwrap();
        let DynRelocPayload::FunctionOverride(data) = &table.relocations[0].payload else {
            panic!("expected function override payload");
        };
        assert_eq!(data.functions.len(), 1);
        assert_eq!(data.functions[0].original_rva, 0x1234);
        assert_eq!(data.functions[0].rvas, vec![0x5678]);
        assert_eq!(data.functions[0].blocks.len(), 1);
        let bdd = data.bdd_info.as_ref().unwrap();
        assert_eq!(bdd.version, 1);
        assert_eq!(bdd.nodes.len(), 1);
        assert_eq!(bdd.nodes[0].left, 1);
        assert!(!data.errors.has_errors());
    }

    #[test]
    fn unknown_version_is_diagnosed() {
        let mut table_bytes = Vec::new();
        table_bytes.extend_from_slice(&9u32.to_le_bytes());
        table_bytes.extend_from_slice(&0u32.to_le_bytes());
        let image = image_with_table(&table_bytes);
        let table = parse(&image, DVRT_RVA, &DynRelocLoadOptions::default()).unwrap();
        assert!(table.errors.has_error(DynRelocError::UnsupportedVersion));
    }
}
