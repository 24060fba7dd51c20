//! The data-directory array.
//!
//! Sixteen `(virtual_address, size)` slots at most, with ordinal meaning by
//! index. Images may declare fewer than the standard maximum, and the last
//! physically present entry may be cut short; the missing tail is virtual
//! and round-trips as such.

use scroll::{Pread, Pwrite, SizeWith};

use crate::buffer::{InputCursor, OutputBuffer};
use crate::error::{Error, Result};
use crate::packed::PackedStruct;

/// One `IMAGE_DATA_DIRECTORY` slot.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_DATA_DIRECTORY"))]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

pub const SIZEOF_DATA_DIRECTORY: usize = 8;
/// The PE-standard maximum number of directory slots.
pub const NUM_DATA_DIRECTORIES: usize = 16;

/// Well-known directory indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum DirectoryType {
    Exports = 0,
    Imports = 1,
    Resource = 2,
    Exception = 3,
    Security = 4,
    BaseReloc = 5,
    Debug = 6,
    Architecture = 7,
    GlobalPtr = 8,
    Tls = 9,
    LoadConfig = 10,
    BoundImport = 11,
    Iat = 12,
    DelayImport = 13,
    ComDescriptor = 14,
}

impl TryFrom<usize> for DirectoryType {
    type Error = Error;

    fn try_from(index: usize) -> Result<Self> {
        use DirectoryType::*;
        Ok(match index {
            0 => Exports,
            1 => Imports,
            2 => Resource,
            3 => Exception,
            4 => Security,
            5 => BaseReloc,
            6 => Debug,
            7 => Architecture,
            8 => GlobalPtr,
            9 => Tls,
            10 => LoadConfig,
            11 => BoundImport,
            12 => Iat,
            13 => DelayImport,
            14 => ComDescriptor,
            _ => {
                return Err(Error::Malformed(format!(
                    "data directory index {index} is out of range"
                )));
            }
        })
    }
}

/// The directory array as physically declared by the optional header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataDirectories {
    entries: Vec<PackedStruct<DataDirectory>>,
}

impl DataDirectories {
    /// Reads `count` slots at the cursor. `count` is clamped to the standard
    /// maximum; the final slot may be physically truncated when
    /// `allow_virtual_data`.
    pub fn parse(
        cursor: &mut InputCursor,
        count: usize,
        allow_virtual_data: bool,
    ) -> Result<Self> {
        let count = count.min(NUM_DATA_DIRECTORIES);
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(PackedStruct::read_from(cursor, allow_virtual_data)?);
        }
        Ok(DataDirectories { entries })
    }

    /// Number of declared slots.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[PackedStruct<DataDirectory>] {
        &self.entries
    }

    /// The slot for `dir`, if declared.
    pub fn get_directory(&self, dir: DirectoryType) -> Option<&PackedStruct<DataDirectory>> {
        self.entries.get(dir as usize)
    }

    pub fn get_directory_mut(
        &mut self,
        dir: DirectoryType,
    ) -> Option<&mut PackedStruct<DataDirectory>> {
        self.entries.get_mut(dir as usize)
    }

    /// Whether the slot for `dir` is declared at all.
    pub fn has_directory(&self, dir: DirectoryType) -> bool {
        (dir as usize) < self.entries.len()
    }

    /// Whether the slot is declared with both a nonzero address and size.
    pub fn has_nonempty_directory(&self, dir: DirectoryType) -> bool {
        self.get_directory(dir)
            .is_some_and(|d| d.virtual_address != 0 && d.size != 0)
    }

    /// Serializes all slots in order.
    pub fn write_to(&self, out: &mut dyn OutputBuffer, write_virtual_part: bool) -> Result<usize> {
        let mut written = 0;
        for entry in &self.entries {
            written += entry.write_to(out, write_virtual_part)?;
        }
        Ok(written)
    }
}
