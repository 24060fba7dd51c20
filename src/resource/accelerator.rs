//! Accelerator-table resources (`RT_ACCELERATOR`).

use scroll::{Pread, Pwrite, SizeWith};

use crate::error_list::{ErrorList, error_codes};
use crate::packed::{PackedByteVector, packed_size_of};

/// `fVirt`: the key is a virtual-key code.
pub const FVIRTKEY: u16 = 0x01;
/// `fNoInvert`
pub const FNOINVERT: u16 = 0x02;
/// `fShift`
pub const FSHIFT: u16 = 0x04;
/// `fControl`
pub const FCONTROL: u16 = 0x08;
/// `fAlt`
pub const FALT: u16 = 0x10;
/// Set on the final record of the table.
pub const END: u16 = 0x80;

/// One 8-byte `ACCELTABLEENTRY`.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct AccelTableEntry {
    /// Modifier flags; the high bit of the low byte ends the table.
    pub modifier: u16,
    /// ANSI character or virtual-key code, per [`FVIRTKEY`].
    pub key_code: u16,
    /// Command id delivered in `WM_COMMAND`.
    pub message: u16,
    pub padding: u16,
}

impl AccelTableEntry {
    pub fn is_last(&self) -> bool {
        self.modifier & END != 0
    }

    pub fn is_virtual_key(&self) -> bool {
        self.modifier & FVIRTKEY != 0
    }
}

error_codes! {
    /// Accelerator table diagnostics.
    pub enum AcceleratorError("accelerator_table_reader") {
        InvalidAccelerator => "Accelerator entry cannot be read",
        UnterminatedTable => "Accelerator table has no terminal entry",
        TooManyAccelerators => "Number of accelerators exceeds the configured limit",
    }
}

/// Options for [`AcceleratorTableDetails::parse`].
#[derive(Debug, Copy, Clone)]
pub struct AcceleratorLoadOptions {
    pub max_accelerator_count: u32,
}

impl Default for AcceleratorLoadOptions {
    fn default() -> Self {
        AcceleratorLoadOptions {
            max_accelerator_count: 0x1_0000,
        }
    }
}

/// A decoded accelerator table.
#[derive(Debug, Clone, Default)]
pub struct AcceleratorTableDetails {
    pub accelerators: Vec<AccelTableEntry>,
    pub errors: ErrorList<AcceleratorError>,
}

impl AcceleratorTableDetails {
    /// Decodes a leaf's bytes; the record with the high modifier bit set is
    /// the last one.
    pub fn parse(data: &PackedByteVector, options: &AcceleratorLoadOptions) -> Self {
        let bytes = data.as_slice();
        let entry_size = packed_size_of::<AccelTableEntry>();
        let mut details = AcceleratorTableDetails::default();
        let mut offset = 0usize;
        let mut terminated = false;

        while offset + entry_size <= bytes.len() {
            if details.accelerators.len() as u32 >= options.max_accelerator_count {
                details
                    .errors
                    .add_error(AcceleratorError::TooManyAccelerators);
                return details;
            }
            let entry = match bytes.pread_with::<AccelTableEntry>(offset, scroll::LE) {
                Ok(entry) => entry,
                Err(_) => {
                    details.errors.add_error(AcceleratorError::InvalidAccelerator);
                    return details;
                }
            };
            offset += entry_size;
            let last = entry.is_last();
            details.accelerators.push(entry);
            if last {
                terminated = true;
                break;
            }
        }
        if !terminated && !details.errors.has_errors() {
            details.errors.add_error(AcceleratorError::UnterminatedTable);
        }
        details
    }
}
