//! The Rich header.
//!
//! An undocumented, checksum-XORed record the Microsoft linker hides between
//! the DOS stub and the PE signature. It is found by scanning backwards for
//! the literal `Rich` tag; the checksum dword follows the tag, and the
//! COMPID region extends backwards to the `DanS` sentinel (stored XORed with
//! the checksum, like everything else in the record).

use log::debug;

use crate::error::{Error, Result};
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::utils::{align_up, is_aligned};

/// The trailing tag, as bytes (`Rich`).
pub const RICH_SIGNATURE: [u8; 4] = *b"Rich";
/// The leading sentinel (`DanS`), stored XORed with the checksum.
pub const DANS_SIGNATURE: u32 = 0x536E_6144;
/// `DanS` and the COMPID region start on this alignment.
pub const DANS_ALIGNMENT: usize = 16;
/// Size of one COMPID record.
pub const COMPID_SIZE: usize = 8;

error_codes! {
    /// Rich header diagnostics.
    pub enum RichError("rich_header_loader") {
        UnalignedRichHeaderOffset => "DanS sentinel is not aligned to a 16-byte boundary",
        InvalidChecksum => "Stored Rich checksum does not match the recomputed one",
    }
}

/// One compiler-identification record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RichCompid {
    /// Product build number.
    pub build_number: u16,
    /// Product id (`prodid`).
    pub prod_id: u16,
    /// How many objects this tool contributed.
    pub use_count: u32,
}

/// The decoded Rich header.
#[derive(Debug, Clone, Default)]
pub struct RichHeaderDetails {
    /// The stored checksum (also the XOR key).
    pub checksum: u32,
    pub compids: Vec<RichCompid>,
    /// Stub-relative offset of the `DanS` sentinel.
    pub dans_offset: usize,
    /// Stub-relative offset of the checksum dword following `Rich`.
    pub checksum_offset: usize,
    /// Checksum recomputed from the image, when requested.
    pub computed_checksum: Option<u32>,
    pub errors: ErrorList<RichError>,
}

impl RichHeaderDetails {
    /// File offset of the `DanS` sentinel (the stub starts right after the
    /// DOS header).
    pub fn dans_file_offset(&self) -> usize {
        crate::header::SIZEOF_DOS_HEADER + self.dans_offset
    }

    /// Re-encodes the header, `DanS` through the checksum dword.
    ///
    /// Padding words between `DanS` and the first COMPID encode as bare
    /// checksum values (zeros XORed with the key), which is what the linker
    /// emits.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(DANS_SIGNATURE ^ self.checksum).to_le_bytes());
        let compid_start = align_up(self.dans_offset + 4, DANS_ALIGNMENT) - self.dans_offset;
        while out.len() < compid_start {
            out.extend_from_slice(&self.checksum.to_le_bytes());
        }
        for compid in &self.compids {
            out.extend_from_slice(&(compid.build_number ^ self.checksum as u16).to_le_bytes());
            out.extend_from_slice(&(compid.prod_id ^ (self.checksum >> 16) as u16).to_le_bytes());
            out.extend_from_slice(&(compid.use_count ^ self.checksum).to_le_bytes());
        }
        out.extend_from_slice(&RICH_SIGNATURE);
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct RichLoadOptions {
    /// Recompute the checksum and diagnose a mismatch.
    pub verify_checksum: bool,
}

impl Default for RichLoadOptions {
    fn default() -> Self {
        RichLoadOptions {
            verify_checksum: true,
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Finds the `Rich` tag scanning backwards; returns the checksum offset.
fn find_checksum_offset(stub: &[u8]) -> Option<usize> {
    let mut matched = 0;
    let mut pos = stub.len();
    while pos > 0 && matched < RICH_SIGNATURE.len() {
        pos -= 1;
        if stub[pos] == RICH_SIGNATURE[RICH_SIGNATURE.len() - 1 - matched] {
            matched += 1;
        } else {
            matched = 0;
        }
    }
    if matched < RICH_SIGNATURE.len() {
        return None;
    }
    let offset = pos + RICH_SIGNATURE.len();
    if stub.len() - offset < 4 || offset % 4 != 0 {
        return None;
    }
    Some(offset)
}

/// Rotate-left-based checksum over the header bytes and COMPID records.
fn compute_checksum(image: &Image, dans_file_offset: usize, compids: &[RichCompid]) -> Result<u32> {
    let dos_bytes = image.dos_header.to_bytes()?;
    let stub = image.dos_stub.as_slice();
    let mut checksum = dans_file_offset as u32;
    for i in 0..dans_file_offset {
        // The e_lfanew slot counts as zero.
        if (0x3C..0x40).contains(&i) {
            continue;
        }
        let byte = if i < dos_bytes.len() {
            dos_bytes[i]
        } else {
            *stub.get(i - dos_bytes.len()).ok_or_else(|| {
                Error::Malformed("Rich header extends past the DOS stub".into())
            })?
        };
        checksum = checksum.wrapping_add(u32::from(byte).rotate_left(i as u32 & 31));
    }
    for compid in compids {
        let value = u32::from(compid.build_number) | (u32::from(compid.prod_id) << 16);
        checksum = checksum.wrapping_add(value.rotate_left(compid.use_count & 31));
    }
    Ok(checksum)
}

/// Loads the Rich header from the DOS stub, or `None` when no `Rich` tag
/// exists.
pub fn load(image: &Image, options: &RichLoadOptions) -> Result<Option<RichHeaderDetails>> {
    let stub = image.dos_stub.as_slice();
    let Some(checksum_offset) = find_checksum_offset(stub) else {
        return Ok(None);
    };
    let checksum = read_u32(stub, checksum_offset)
        .ok_or_else(|| Error::Malformed("Rich checksum is out of bounds".into()))?;
    let rich_offset = checksum_offset - RICH_SIGNATURE.len();

    // Scan backwards in dword steps for the XORed sentinel.
    let mut dans_offset = None;
    let mut pos = rich_offset;
    while pos >= 4 {
        pos -= 4;
        if read_u32(stub, pos).map(|v| v ^ checksum) == Some(DANS_SIGNATURE) {
            dans_offset = Some(pos);
            break;
        }
    }
    let Some(dans_offset) = dans_offset else {
        return Err(Error::Malformed("Rich header has no DanS sentinel".into()));
    };

    let mut details = RichHeaderDetails {
        checksum,
        dans_offset,
        checksum_offset,
        ..RichHeaderDetails::default()
    };
    let dans_file_offset = crate::header::SIZEOF_DOS_HEADER + dans_offset;
    if !is_aligned(dans_file_offset, DANS_ALIGNMENT) {
        details
            .errors
            .add_error(RichError::UnalignedRichHeaderOffset);
    }

    let compid_start = align_up(dans_offset + 4, DANS_ALIGNMENT);
    if (rich_offset.saturating_sub(compid_start)) % COMPID_SIZE != 0 {
        return Err(Error::Malformed(
            "Rich COMPID region size is not a record multiple".into(),
        ));
    }
    let mut pos = compid_start;
    while pos + COMPID_SIZE <= rich_offset {
        let low = read_u32(stub, pos)
            .ok_or_else(|| Error::Malformed("Rich COMPID is out of bounds".into()))?;
        let use_count = read_u32(stub, pos + 4)
            .ok_or_else(|| Error::Malformed("Rich COMPID is out of bounds".into()))?;
        details.compids.push(RichCompid {
            build_number: (low as u16) ^ (checksum as u16),
            prod_id: ((low >> 16) as u16) ^ ((checksum >> 16) as u16),
            use_count: use_count ^ checksum,
        });
        pos += COMPID_SIZE;
    }
    debug!(
        "rich header: checksum {:#x}, {} compids",
        details.checksum,
        details.compids.len()
    );

    if options.verify_checksum {
        let computed = compute_checksum(image, dans_file_offset, &details.compids)?;
        details.computed_checksum = Some(computed);
        if computed != checksum {
            details.errors.add_error(RichError::InvalidChecksum);
        }
    }

    Ok(Some(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::image::{Image, ImageLoadOptions};
    use crate::test_fixtures::{SectionSpec, synthetic_image_bytes};

    const CHECKSUM: u32 = 0x1234_5678;

    fn compids() -> Vec<RichCompid> {
        vec![
            RichCompid {
                build_number: 0x11,
                prod_id: 0xEF,
                use_count: 0x15,
            },
            RichCompid {
                build_number: 0xDE6A,
                prod_id: 0xAB03,
                use_count: 0x57FF,
            },
        ]
    }

    /// Splices an encoded Rich header into the stub region of a synthetic
    /// image. `DanS` lands at stub offset 16 (file offset 0x50).
    fn rich_image(checksum: u32) -> Image {
        let details = RichHeaderDetails {
            checksum,
            compids: compids(),
            dans_offset: 16,
            checksum_offset: 0,
            ..RichHeaderDetails::default()
        };
        let encoded = details.encode();
        let mut bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".text", 0x1000, 0x200, vec![0; 0x200])],
            &[],
        );
        let stub_start = crate::header::SIZEOF_DOS_HEADER;
        // Clear the stub, then splice the record at stub offset 16.
        for b in &mut bytes[stub_start..0x80] {
            *b = 0;
        }
        bytes[stub_start + 16..stub_start + 16 + encoded.len()].copy_from_slice(&encoded);
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    #[test]
    fn decodes_xored_compids() {
        let image = rich_image(CHECKSUM);
        let options = RichLoadOptions {
            verify_checksum: false,
        };
        let rich = load(&image, &options).unwrap().unwrap();
        assert_eq!(rich.checksum, CHECKSUM);
        assert_eq!(rich.dans_offset, 16);
        assert_eq!(rich.compids, compids());
        assert!(!rich.errors.has_error(RichError::UnalignedRichHeaderOffset));
    }

    #[test]
    fn reencoding_is_byte_identical() {
        let image = rich_image(CHECKSUM);
        let options = RichLoadOptions {
            verify_checksum: false,
        };
        let rich = load(&image, &options).unwrap().unwrap();
        let encoded = rich.encode();
        let stub = image.dos_stub.as_slice();
        assert_eq!(
            &stub[rich.dans_offset..rich.checksum_offset + 4],
            &encoded[..]
        );
    }

    #[test]
    fn checksum_verification_recomputes_and_compares() {
        let image = rich_image(CHECKSUM);
        let rich = load(&image, &RichLoadOptions::default()).unwrap().unwrap();
        let computed = rich.computed_checksum.unwrap();
        assert!(rich.errors.has_error(RichError::InvalidChecksum) == (computed != CHECKSUM));

        // Re-encode with the correct checksum and reload: it must verify.
        let fixed = rich_image(computed);
        let reloaded = load(&fixed, &RichLoadOptions::default()).unwrap().unwrap();
        // The checksum participates in its own XOR stream but not the summed
        // region, so recomputation is stable.
        assert_eq!(reloaded.computed_checksum, Some(computed));
        assert!(!reloaded.errors.has_error(RichError::InvalidChecksum));
    }

    #[test]
    fn absent_tag_is_none() {
        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".text", 0x1000, 0x200, vec![0; 0x200])],
            &[],
        );
        let image =
            Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap();
        assert!(load(&image, &RichLoadOptions::default()).unwrap().is_none());
    }
}
