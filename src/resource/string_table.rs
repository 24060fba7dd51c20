//! String-table resources (`RT_STRING`).
//!
//! Each string-table block holds exactly sixteen length-prefixed UTF-16
//! strings, absent ones encoded with length zero. String ids map to blocks
//! as `id / 16 + 1` (the leaf's name id) and `id % 16` (the slot).

use scroll::Pread;

use crate::error_list::{ErrorList, error_codes};
use crate::packed::PackedByteVector;

/// Strings per block, always.
pub const STRINGS_PER_BLOCK: usize = 16;

error_codes! {
    /// String table diagnostics.
    pub enum StringTableError("string_table_reader") {
        InvalidStringTable => "String table block is truncated",
    }
}

/// One decoded string-table block.
#[derive(Debug, Clone, Default)]
pub struct StringTableDetails {
    /// Exactly sixteen slots; empty slots hold `None`.
    pub strings: Vec<Option<String>>,
    pub errors: ErrorList<StringTableError>,
}

impl StringTableDetails {
    /// Decodes a leaf's bytes into the sixteen slots.
    pub fn parse(data: &PackedByteVector) -> Self {
        let bytes = data.as_slice();
        let mut details = StringTableDetails {
            strings: vec![None; STRINGS_PER_BLOCK],
            ..StringTableDetails::default()
        };
        let mut offset = 0usize;
        for slot in 0..STRINGS_PER_BLOCK {
            let Ok(length) = bytes.gread_with::<u16>(&mut offset, scroll::LE) else {
                details.errors.add_error(StringTableError::InvalidStringTable);
                return details;
            };
            if length == 0 {
                continue;
            }
            let mut units = Vec::with_capacity(usize::from(length));
            for _ in 0..length {
                let Ok(unit) = bytes.gread_with::<u16>(&mut offset, scroll::LE) else {
                    details.errors.add_error(StringTableError::InvalidStringTable);
                    return details;
                };
                units.push(unit);
            }
            details.strings[slot] = Some(String::from_utf16_lossy(&units));
        }
        details
    }

    /// The string with resource id `string_id`, given the leaf's block id.
    pub fn string_by_id(&self, block_id: u32, string_id: u32) -> Option<&str> {
        if string_id / STRINGS_PER_BLOCK as u32 + 1 != block_id {
            return None;
        }
        self.strings
            .get((string_id % STRINGS_PER_BLOCK as u32) as usize)?
            .as_deref()
    }
}
