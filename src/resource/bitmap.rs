//! Bitmap resources (`RT_BITMAP`).
//!
//! A bitmap stored as a resource drops its `BITMAPFILEHEADER`; the reader
//! synthesizes one so the result is a loadable `.bmp`, computing `bfOffBits`
//! from the info header's size and color-table population.

use scroll::{Pread, Pwrite, SizeWith};

use crate::error_list::{ErrorList, error_codes};
use crate::packed::{PackedByteVector, packed_size_of};

/// `BM`, little endian.
pub const BITMAP_FILE_SIGNATURE: u16 = 0x4D42;
/// Size of the synthesized `BITMAPFILEHEADER`.
pub const SIZEOF_BITMAP_FILE_HEADER: usize = 14;
/// `BITMAPCOREHEADER` size stamp.
pub const SIZEOF_BITMAP_CORE_HEADER: u32 = 12;

/// `BITMAPFILEHEADER`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("BITMAPFILEHEADER"))]
pub struct BitmapFileHeader {
    pub signature: u16,
    pub file_size: u32,
    pub reserved1: u16,
    pub reserved2: u16,
    /// File offset of the pixel bits.
    pub off_bits: u32,
}

/// The `BITMAPINFOHEADER` prefix the reader needs.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("BITMAPINFOHEADER"))]
pub struct BitmapInfoHeaderPrefix {
    pub size: u32,
    pub width: i32,
    pub height: i32,
    pub planes: u16,
    pub bit_count: u16,
    pub compression: u32,
    pub size_image: u32,
    pub x_pels_per_meter: i32,
    pub y_pels_per_meter: i32,
    pub clr_used: u32,
    pub clr_important: u32,
}

error_codes! {
    /// Bitmap resource diagnostics.
    pub enum BitmapError("bitmap_reader") {
        InvalidBitmapHeader => "Bitmap info header is truncated or malformed",
    }
}

/// A resource bitmap reassembled into a standalone `.bmp`.
#[derive(Debug, Clone, Default)]
pub struct BitmapDetails {
    /// The synthesized file header.
    pub file_header: BitmapFileHeader,
    /// File header plus the resource bytes: a loadable `.bmp` image.
    pub bitmap: Vec<u8>,
    pub errors: ErrorList<BitmapError>,
}

impl BitmapDetails {
    /// Reassembles a leaf's bytes into a `.bmp`.
    pub fn parse(data: &PackedByteVector) -> Self {
        let bytes = data.as_slice();
        let mut details = BitmapDetails::default();

        let Ok(info_size) = bytes.pread_with::<u32>(0, scroll::LE) else {
            details.errors.add_error(BitmapError::InvalidBitmapHeader);
            return details;
        };

        let (bit_count, clr_used, color_entry_size) = if info_size == SIZEOF_BITMAP_CORE_HEADER {
            // BITMAPCOREHEADER: u16 width/height/planes/bit_count, RGB triples.
            match bytes.pread_with::<u16>(10, scroll::LE) {
                Ok(bit_count) => (bit_count, 0u32, 3u32),
                Err(_) => {
                    details.errors.add_error(BitmapError::InvalidBitmapHeader);
                    return details;
                }
            }
        } else {
            match bytes.pread_with::<BitmapInfoHeaderPrefix>(0, scroll::LE) {
                Ok(info) => (info.bit_count, info.clr_used, 4u32),
                Err(_) => {
                    details.errors.add_error(BitmapError::InvalidBitmapHeader);
                    return details;
                }
            }
        };
        if info_size as usize > bytes.len() {
            details.errors.add_error(BitmapError::InvalidBitmapHeader);
            return details;
        }

        let color_count = if clr_used != 0 {
            clr_used
        } else if bit_count != 0 && bit_count <= 8 {
            1u32 << bit_count
        } else {
            0
        };
        let off_bits =
            SIZEOF_BITMAP_FILE_HEADER as u32 + info_size + color_count * color_entry_size;

        details.file_header = BitmapFileHeader {
            signature: BITMAP_FILE_SIGNATURE,
            file_size: (SIZEOF_BITMAP_FILE_HEADER + bytes.len()) as u32,
            reserved1: 0,
            reserved2: 0,
            off_bits,
        };
        let mut bitmap = Vec::with_capacity(SIZEOF_BITMAP_FILE_HEADER + bytes.len());
        bitmap.extend_from_slice(&details.file_header.signature.to_le_bytes());
        bitmap.extend_from_slice(&details.file_header.file_size.to_le_bytes());
        bitmap.extend_from_slice(&details.file_header.reserved1.to_le_bytes());
        bitmap.extend_from_slice(&details.file_header.reserved2.to_le_bytes());
        bitmap.extend_from_slice(&details.file_header.off_bits.to_le_bytes());
        bitmap.extend_from_slice(bytes);
        details.bitmap = bitmap;
        details
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::Pwrite;

    fn resource_bitmap(bit_count: u16, clr_used: u32) -> PackedByteVector {
        let info = BitmapInfoHeaderPrefix {
            size: 40,
            width: 2,
            height: 2,
            planes: 1,
            bit_count,
            clr_used,
            ..BitmapInfoHeaderPrefix::default()
        };
        let mut raw = vec![0u8; 40 + 16];
        raw.pwrite_with(info, 0, scroll::LE).unwrap();
        for (i, b) in raw[40..].iter_mut().enumerate() {
            *b = i as u8;
        }
        PackedByteVector::new(raw)
    }

    #[test]
    fn file_header_size() {
        assert_eq!(packed_size_of::<BitmapFileHeader>(), SIZEOF_BITMAP_FILE_HEADER);
    }

    #[test]
    fn synthesizes_a_file_header_for_truecolor() {
        let bitmap = BitmapDetails::parse(&resource_bitmap(24, 0));
        assert_eq!(bitmap.file_header.signature, BITMAP_FILE_SIGNATURE);
        assert_eq!(bitmap.file_header.off_bits, 14 + 40);
        assert_eq!(bitmap.bitmap.len(), 14 + 56);
        assert_eq!(&bitmap.bitmap[..2], b"BM");
        assert!(!bitmap.errors.has_errors());
    }

    #[test]
    fn palette_sizes_feed_off_bits() {
        // 8 bpp with no explicit count: a full 256-entry table.
        let bitmap = BitmapDetails::parse(&resource_bitmap(8, 0));
        assert_eq!(bitmap.file_header.off_bits, 14 + 40 + 256 * 4);
        // An explicit count wins.
        let bitmap = BitmapDetails::parse(&resource_bitmap(8, 16));
        assert_eq!(bitmap.file_header.off_bits, 14 + 40 + 16 * 4);
    }

    #[test]
    fn truncated_header_is_diagnosed() {
        let bitmap = BitmapDetails::parse(&PackedByteVector::new(vec![1, 2]));
        assert!(bitmap.errors.has_error(BitmapError::InvalidBitmapHeader));
        assert!(bitmap.bitmap.is_empty());
    }
}
