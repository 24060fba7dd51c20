//! Base relocations and image rebasing.
//!
//! The directory is a run of blocks: an 8-byte `(page_rva, block_size)`
//! header followed by 16-bit entries packing a 4-bit type and a 12-bit page
//! offset. `HIGHADJ` entries consume the following word as a parameter.
//! Architecture-specific types are recognized structurally, but only the
//! generic ones can be applied to bytes.
//!
//! Rebasing runs in two passes: the first proves every entry is applicable
//! (failing fast on exotic types), the second reads each affected value,
//! applies the delta, and writes it back, honoring the virtual-tail policy.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::{struct_from_rva, struct_to_rva};
use crate::packed::{PackedStruct, packed_size_of};

/// `IMAGE_BASE_RELOCATION`: one block header.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_BASE_RELOCATION"))]
pub struct ImageBaseRelocation {
    /// Page this block fixes up.
    pub virtual_address: u32,
    /// Whole block size, header included.
    pub size_of_block: u32,
}

/// `IMAGE_REL_BASED_ABSOLUTE`: alignment filler, touches nothing.
pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
/// `IMAGE_REL_BASED_HIGH`: high word of a 32-bit address.
pub const IMAGE_REL_BASED_HIGH: u16 = 1;
/// `IMAGE_REL_BASED_LOW`: low word of a 32-bit address.
pub const IMAGE_REL_BASED_LOW: u16 = 2;
/// `IMAGE_REL_BASED_HIGHLOW`: full 32-bit address.
pub const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
/// `IMAGE_REL_BASED_HIGHADJ`: high word with rounding parameter.
pub const IMAGE_REL_BASED_HIGHADJ: u16 = 4;
/// `IMAGE_REL_BASED_MIPS_JMPADDR` / `IMAGE_REL_BASED_ARM_MOV32`.
pub const IMAGE_REL_BASED_MIPS_JMPADDR: u16 = 5;
/// `IMAGE_REL_BASED_THUMB_MOV32`.
pub const IMAGE_REL_BASED_THUMB_MOV32: u16 = 7;
/// `IMAGE_REL_BASED_RISCV_LOW12S`.
pub const IMAGE_REL_BASED_RISCV_LOW12S: u16 = 8;
/// `IMAGE_REL_BASED_MIPS_JMPADDR16`.
pub const IMAGE_REL_BASED_MIPS_JMPADDR16: u16 = 9;
/// `IMAGE_REL_BASED_DIR64`: full 64-bit address.
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

error_codes! {
    /// Relocation directory diagnostics.
    pub enum RelocationError("relocation_loader") {
        InvalidBlockSize => "Base relocation block size is invalid",
        UnmatchedDirectorySize => "Directory size does not match the relocation blocks it holds",
        InvalidRelocationEntry => "Relocation entry cannot be read",
        RelocationParamIsAbsent => "Relocation parameter is required for this type of relocation, but absent",
        UnsupportedRelocationType => "Unsupported relocation type",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct RelocationLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
}

impl Default for RelocationLoadOptions {
    fn default() -> Self {
        RelocationLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
        }
    }
}

/// One 16-bit relocation entry, plus the `HIGHADJ` parameter when present.
#[derive(Debug, Clone, Default)]
pub struct RelocationEntry {
    pub descriptor: PackedStruct<u16>,
    pub param: Option<PackedStruct<u16>>,
    pub errors: ErrorList<RelocationError>,
}

impl RelocationEntry {
    /// The 4-bit type from the high nibble.
    pub fn entry_type(&self) -> u16 {
        (*self.descriptor & 0xF000) >> 12
    }

    pub fn set_entry_type(&mut self, entry_type: u16) {
        *self.descriptor.value_mut() = (*self.descriptor & 0x0FFF) | ((entry_type & 0xF) << 12);
    }

    /// The 12-bit offset within the block's page.
    pub fn address(&self) -> u16 {
        *self.descriptor & 0x0FFF
    }

    pub fn set_address(&mut self, address: u16) {
        *self.descriptor.value_mut() = (*self.descriptor & 0xF000) | (address & 0x0FFF);
    }

    /// Whether the type is one of the generic, applicable ones.
    ///
    /// Architecture-specific types are still decoded structurally; they just
    /// cannot be applied to bytes.
    pub fn is_type_supported(&self) -> bool {
        matches!(
            self.entry_type(),
            IMAGE_REL_BASED_ABSOLUTE
                | IMAGE_REL_BASED_HIGH
                | IMAGE_REL_BASED_LOW
                | IMAGE_REL_BASED_HIGHADJ
                | IMAGE_REL_BASED_HIGHLOW
                | IMAGE_REL_BASED_DIR64
        )
    }

    /// Bytes the entry rewrites when applied.
    pub fn affected_size_in_bytes(&self) -> Result<usize> {
        match self.entry_type() {
            IMAGE_REL_BASED_ABSOLUTE => Ok(0),
            IMAGE_REL_BASED_HIGH | IMAGE_REL_BASED_LOW | IMAGE_REL_BASED_HIGHADJ => Ok(2),
            IMAGE_REL_BASED_HIGHLOW => Ok(4),
            IMAGE_REL_BASED_DIR64 => Ok(8),
            other => Err(Error::Malformed(format!(
                "unsupported relocation type {other}"
            ))),
        }
    }

    /// Computes the fixed-up value for a base delta.
    ///
    /// `HIGH` follows the published PE semantics (the stored word is the high
    /// word of a 32-bit address), not the original implementation's
    /// double-shift.
    pub fn apply_to(&self, value: u64, delta: u64) -> Result<u64> {
        match self.entry_type() {
            IMAGE_REL_BASED_ABSOLUTE => Ok(value),
            IMAGE_REL_BASED_HIGHLOW => Ok(u64::from((value as u32).wrapping_add(delta as u32))),
            IMAGE_REL_BASED_DIR64 => Ok(value.wrapping_add(delta)),
            IMAGE_REL_BASED_HIGH => {
                Ok(u64::from((value as u16).wrapping_add((delta >> 16) as u16)))
            }
            IMAGE_REL_BASED_LOW => Ok(u64::from((value as u16).wrapping_add(delta as u16))),
            IMAGE_REL_BASED_HIGHADJ => {
                let param = self.param.as_ref().ok_or_else(|| {
                    Error::Malformed(
                        "relocation parameter is required for HIGHADJ, but absent".into(),
                    )
                })?;
                let adjusted = ((value as u32) << 16)
                    .wrapping_add(u32::from(**param))
                    .wrapping_add(delta as u32)
                    .wrapping_add(0x8000);
                Ok(u64::from((adjusted >> 16) as u16))
            }
            other => Err(Error::Malformed(format!(
                "unsupported relocation type {other}"
            ))),
        }
    }
}

/// One block: header plus decoded entries.
#[derive(Debug, Clone, Default)]
pub struct BaseRelocationBlock {
    pub descriptor: PackedStruct<ImageBaseRelocation>,
    pub entries: Vec<RelocationEntry>,
    pub errors: ErrorList<RelocationError>,
}

/// The decoded base relocation directory.
#[derive(Debug, Clone, Default)]
pub struct RelocationDirectoryDetails {
    pub blocks: Vec<BaseRelocationBlock>,
    pub errors: ErrorList<RelocationError>,
}

/// Loads the base relocation directory, or `None` when the image has none.
pub fn load(
    image: &Image,
    options: &RelocationLoadOptions,
) -> Result<Option<RelocationDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::BaseReloc)
        .filter(|d| d.virtual_address != 0 && d.size != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let header_size = packed_size_of::<ImageBaseRelocation>() as u32;
    let mut details = RelocationDirectoryDetails::default();
    let mut pos = dir.virtual_address;
    let end = dir.virtual_address.saturating_add(dir.size);

    while pos < end {
        if end - pos < header_size {
            details
                .errors
                .add_error(RelocationError::UnmatchedDirectorySize);
            break;
        }
        let descriptor = match struct_from_rva::<ImageBaseRelocation>(
            image,
            pos,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                details
                    .errors
                    .add_error(RelocationError::InvalidRelocationEntry);
                break;
            }
        };
        let mut block = BaseRelocationBlock {
            descriptor,
            ..BaseRelocationBlock::default()
        };
        debug!(
            "relocation block: page {:#x}, {} bytes",
            block.descriptor.virtual_address, block.descriptor.size_of_block
        );

        let block_size = block.descriptor.size_of_block;
        if block_size < header_size || block_size % 2 != 0 || block_size > end - pos {
            block.errors.add_error(RelocationError::InvalidBlockSize);
            details.blocks.push(block);
            break;
        }

        let word_count = (block_size - header_size) / 2;
        let mut word_index = 0u32;
        while word_index < word_count {
            let entry_rva = pos + header_size + word_index * 2;
            let descriptor = match struct_from_rva::<u16>(
                image,
                entry_rva,
                options.include_headers,
                options.allow_virtual_data,
            ) {
                Ok(descriptor) => descriptor,
                Err(_) => {
                    block
                        .errors
                        .add_error(RelocationError::InvalidRelocationEntry);
                    word_index = word_count;
                    continue;
                }
            };
            word_index += 1;
            let mut entry = RelocationEntry {
                descriptor,
                ..RelocationEntry::default()
            };
            if !entry.is_type_supported() {
                entry
                    .errors
                    .add_error(RelocationError::UnsupportedRelocationType);
            }
            if entry.entry_type() == IMAGE_REL_BASED_HIGHADJ {
                if word_index < word_count {
                    match struct_from_rva::<u16>(
                        image,
                        pos + header_size + word_index * 2,
                        options.include_headers,
                        options.allow_virtual_data,
                    ) {
                        Ok(param) => {
                            entry.param = Some(param);
                            word_index += 1;
                        }
                        Err(_) => entry
                            .errors
                            .add_error(RelocationError::RelocationParamIsAbsent),
                    }
                } else {
                    entry
                        .errors
                        .add_error(RelocationError::RelocationParamIsAbsent);
                }
            }
            block.entries.push(entry);
        }

        pos += block_size;
        details.blocks.push(block);
    }

    Ok(Some(details))
}

/// Options for [`rebase`].
#[derive(Debug, Copy, Clone)]
pub struct RebaseOptions {
    /// The image base to relocate to.
    pub new_base: u64,
    /// Skip bytes past the physical end of a section instead of failing:
    /// the physically present prefix of an affected value is still updated.
    pub ignore_virtual_data: bool,
}

fn process_relocation<T>(
    image: &mut Image,
    rva: u32,
    delta: u64,
    entry: &RelocationEntry,
    ignore_virtual_data: bool,
) -> Result<()>
where
    T: crate::packed::PackedRecord + Into<u64> + TryFrom<u64>,
{
    let value = struct_from_rva::<T>(image, rva, true, ignore_virtual_data).map_err(|_| {
        Error::Malformed(format!("unable to rebase inexistent data at rva {rva:#x}"))
    })?;
    let applied = entry.apply_to((*value).into(), delta)?;
    let Ok(narrowed) = T::try_from(applied & (u64::MAX >> (64 - 8 * packed_size_of::<T>()))) else {
        return Err(Error::Malformed("rebased value does not fit".into()));
    };
    let mut replacement = PackedStruct::new(narrowed);
    replacement.copy_metadata_from(value.state());
    struct_to_rva(image, rva, &replacement, true, !ignore_virtual_data)?;
    Ok(())
}

/// Applies `relocs` for a move of the image base to `options.new_base` and
/// updates the optional header.
///
/// A zero delta touches no bytes. Every entry is validated before the first
/// byte changes, so an unsupported type leaves the image untouched.
pub fn rebase(
    image: &mut Image,
    relocs: &RelocationDirectoryDetails,
    options: &RebaseOptions,
) -> Result<()> {
    let delta = options.new_base.wrapping_sub(image.image_base());
    if delta == 0 {
        return Ok(());
    }

    for block in &relocs.blocks {
        for entry in &block.entries {
            entry.affected_size_in_bytes()?;
        }
    }

    for block in &relocs.blocks {
        let page = block.descriptor.virtual_address;
        for entry in &block.entries {
            let rva = page
                .checked_add(u32::from(entry.address()))
                .ok_or_else(|| Error::Malformed("invalid relocation virtual address".into()))?;
            match entry.affected_size_in_bytes()? {
                0 => {}
                2 => process_relocation::<u16>(image, rva, delta, entry, options.ignore_virtual_data)?,
                4 => process_relocation::<u32>(image, rva, delta, entry, options.ignore_virtual_data)?,
                8 => process_relocation::<u64>(image, rva, delta, entry, options.ignore_virtual_data)?,
                _ => unreachable!("affected sizes are 0, 2, 4, or 8"),
            }
        }
    }

    image.optional_header.set_image_base(options.new_base);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::data_directories::{DataDirectory, DirectoryType};
    use crate::image::{Image, ImageLoadOptions};
    use crate::test_fixtures::{SectionSpec, TEST_IMAGE_BASE_64, synthetic_image_bytes};
    use scroll::Pwrite;

    fn entry(entry_type: u16, address: u16, param: Option<u16>) -> RelocationEntry {
        RelocationEntry {
            descriptor: PackedStruct::new((entry_type << 12) | (address & 0xFFF)),
            param: param.map(PackedStruct::new),
            errors: ErrorList::new(),
        }
    }

    // Scenario literals: old base 0xAABBCCDD22334455, new 0x0123456789012345.
    const OLD_BASE: u64 = 0xAABB_CCDD_2233_4455;
    const NEW_BASE: u64 = 0x0123_4567_8901_2345;

    #[test]
    fn apply_algebra_matches_the_published_semantics() {
        let delta = NEW_BASE.wrapping_sub(OLD_BASE);

        let highlow = entry(IMAGE_REL_BASED_HIGHLOW, 0, None);
        assert_eq!(
            highlow.apply_to(0xBCDE_F012, delta).unwrap(),
            u64::from(0xBCDE_F012u32.wrapping_add(delta as u32))
        );

        let dir64 = entry(IMAGE_REL_BASED_DIR64, 0, None);
        assert_eq!(
            dir64.apply_to(0x1234_5678_90AB_CDEF, delta).unwrap(),
            0x1234_5678_90AB_CDEFu64.wrapping_add(delta)
        );

        let highadj = entry(IMAGE_REL_BASED_HIGHADJ, 0, Some(0x9ABC));
        let expected = u64::from(
            ((0x9ABCu32 << 16)
                .wrapping_add(0x9ABC)
                .wrapping_add(delta as u32)
                .wrapping_add(0x8000)
                >> 16) as u16,
        );
        assert_eq!(highadj.apply_to(0x9ABC, delta).unwrap(), expected);

        let high = entry(IMAGE_REL_BASED_HIGH, 0, None);
        assert_eq!(
            high.apply_to(0x1111, delta).unwrap(),
            u64::from(0x1111u16.wrapping_add((delta >> 16) as u16))
        );

        let low = entry(IMAGE_REL_BASED_LOW, 0, None);
        assert_eq!(
            low.apply_to(0x2222, delta).unwrap(),
            u64::from(0x2222u16.wrapping_add(delta as u16))
        );

        let absolute = entry(IMAGE_REL_BASED_ABSOLUTE, 0, None);
        assert_eq!(absolute.apply_to(0x77, delta).unwrap(), 0x77);

        let exotic = entry(IMAGE_REL_BASED_MIPS_JMPADDR, 0, None);
        assert!(exotic.apply_to(0, delta).is_err());
        assert!(exotic.affected_size_in_bytes().is_err());
    }

    #[test]
    fn highadj_without_param_fails() {
        let broken = entry(IMAGE_REL_BASED_HIGHADJ, 0, None);
        assert!(broken.apply_to(0x9ABC, 1).is_err());
    }

    /// `.data` with fixed-up values, `.reloc` with one block.
    fn reloc_image(data_raw_size: u32) -> (Image, RelocationDirectoryDetails) {
        // Always lay out the full page; the raw size decides how much of it
        // physically lands in the file.
        let mut data = vec![0u8; 0x200];
        data.pwrite_with(TEST_IMAGE_BASE_64 + 0x1234, 0x10, scroll::LE)
            .unwrap();
        data.pwrite_with(0x4000_1234u32, 0x20, scroll::LE).unwrap();

        let mut reloc = vec![0u8; 8];
        reloc
            .pwrite_with(
                ImageBaseRelocation {
                    virtual_address: 0x2000,
                    size_of_block: 8 + 3 * 2,
                },
                0,
                scroll::LE,
            )
            .unwrap();
        reloc.extend_from_slice(&((IMAGE_REL_BASED_DIR64 << 12) | 0x010u16).to_le_bytes());
        reloc.extend_from_slice(&((IMAGE_REL_BASED_HIGHLOW << 12) | 0x020u16).to_le_bytes());
        reloc.extend_from_slice(&((IMAGE_REL_BASED_ABSOLUTE << 12) | 0u16).to_le_bytes());
        let reloc_size = reloc.len() as u32;

        let bytes = synthetic_image_bytes(
            true,
            &[
                SectionSpec::new(".data", 0x2000, data_raw_size, data).virtual_size(0x200),
                SectionSpec::new(".reloc", 0x3000, 0x200, reloc),
            ],
            &[(
                DirectoryType::BaseReloc as usize,
                DataDirectory {
                    virtual_address: 0x3000,
                    size: reloc_size,
                },
            )],
        );
        let image = Image::load(
            &InputMemoryBuffer::from_vec(bytes),
            &ImageLoadOptions::default(),
        )
        .unwrap();
        let relocs = load(&image, &RelocationLoadOptions::default())
            .unwrap()
            .unwrap();
        (image, relocs)
    }

    #[test]
    fn loads_blocks_and_entries() {
        let (_, relocs) = reloc_image(0x200);
        assert_eq!(relocs.blocks.len(), 1);
        let block = &relocs.blocks[0];
        assert_eq!(block.descriptor.virtual_address, 0x2000);
        assert_eq!(block.entries.len(), 3);
        assert_eq!(block.entries[0].entry_type(), IMAGE_REL_BASED_DIR64);
        assert_eq!(block.entries[0].address(), 0x10);
        assert_eq!(block.entries[1].entry_type(), IMAGE_REL_BASED_HIGHLOW);
        assert!(!relocs.errors.has_errors());
    }

    #[test]
    fn exotic_entry_types_load_with_a_diagnostic() {
        let mut reloc = vec![0u8; 8];
        reloc
            .pwrite_with(
                ImageBaseRelocation {
                    virtual_address: 0x2000,
                    size_of_block: 8 + 2 * 2,
                },
                0,
                scroll::LE,
            )
            .unwrap();
        reloc.extend_from_slice(&((IMAGE_REL_BASED_MIPS_JMPADDR << 12) | 0x10u16).to_le_bytes());
        reloc.extend_from_slice(&((IMAGE_REL_BASED_HIGHLOW << 12) | 0x20u16).to_le_bytes());
        let reloc_size = reloc.len() as u32;

        let bytes = synthetic_image_bytes(
            true,
            &[
                SectionSpec::new(".data", 0x2000, 0x200, vec![0x11; 0x200]),
                SectionSpec::new(".reloc", 0x3000, 0x200, reloc),
            ],
            &[(
                DirectoryType::BaseReloc as usize,
                DataDirectory {
                    virtual_address: 0x3000,
                    size: reloc_size,
                },
            )],
        );
        let mut image = Image::load(
            &InputMemoryBuffer::from_vec(bytes),
            &ImageLoadOptions::default(),
        )
        .unwrap();
        let relocs = load(&image, &RelocationLoadOptions::default())
            .unwrap()
            .unwrap();

        // The entity stays in place, valid with its error recorded.
        let block = &relocs.blocks[0];
        assert_eq!(block.entries.len(), 2);
        assert!(
            block.entries[0]
                .errors
                .has_error(RelocationError::UnsupportedRelocationType)
        );
        assert!(!block.entries[1].errors.has_errors());

        // Applying it is still refused, before any byte changes.
        let original = image.section_data[0].as_slice().to_vec();
        assert!(
            rebase(
                &mut image,
                &relocs,
                &RebaseOptions {
                    new_base: TEST_IMAGE_BASE_64 + 0x1000,
                    ignore_virtual_data: true,
                },
            )
            .is_err()
        );
        assert_eq!(image.section_data[0].as_slice(), &original[..]);
    }

    #[test]
    fn rebase_applies_and_inverts() {
        let (mut image, relocs) = reloc_image(0x200);
        let new_base = TEST_IMAGE_BASE_64 + 0x1000_0000;
        let original = image.section_data[0].as_slice().to_vec();

        rebase(
            &mut image,
            &relocs,
            &RebaseOptions { new_base, ignore_virtual_data: true },
        )
        .unwrap();
        assert_eq!(image.image_base(), new_base);
        let dir64 =
            crate::image::accessor::struct_from_rva::<u64>(&image, 0x2010, true, false).unwrap();
        assert_eq!(*dir64, new_base + 0x1234);
        let highlow =
            crate::image::accessor::struct_from_rva::<u32>(&image, 0x2020, true, false).unwrap();
        assert_eq!(*highlow, 0x4000_1234u32.wrapping_add(0x1000_0000));

        rebase(
            &mut image,
            &relocs,
            &RebaseOptions {
                new_base: TEST_IMAGE_BASE_64,
                ignore_virtual_data: true,
            },
        )
        .unwrap();
        assert_eq!(image.section_data[0].as_slice(), &original[..]);
    }

    #[test]
    fn zero_delta_changes_nothing() {
        let (mut image, relocs) = reloc_image(0x200);
        let original = image.section_data[0].as_slice().to_vec();
        rebase(
            &mut image,
            &relocs,
            &RebaseOptions {
                new_base: TEST_IMAGE_BASE_64,
                ignore_virtual_data: false,
            },
        )
        .unwrap();
        assert_eq!(image.section_data[0].as_slice(), &original[..]);
    }

    #[test]
    fn virtual_tail_relocation_honors_the_policy() {
        // Raw data ends at 0x2014; the DIR64 at 0x2010 keeps only 4 physical
        // bytes, the rest is virtual.
        let (mut image, relocs) = reloc_image(0x14);
        assert!(
            rebase(
                &mut image,
                &relocs,
                &RebaseOptions {
                    new_base: TEST_IMAGE_BASE_64 + 0x1000_0000,
                    ignore_virtual_data: false,
                },
            )
            .is_err()
        );

        let (mut image, relocs) = reloc_image(0x14);
        rebase(
            &mut image,
            &relocs,
            &RebaseOptions {
                new_base: TEST_IMAGE_BASE_64 + 0x1000_0000,
                ignore_virtual_data: true,
            },
        )
        .unwrap();
        let patched =
            crate::image::accessor::struct_from_rva::<u32>(&image, 0x2010, true, false).unwrap();
        let expected = ((TEST_IMAGE_BASE_64 + 0x1234 + 0x1000_0000) & 0xFFFF_FFFF) as u32;
        assert_eq!(*patched, expected);
    }
}
