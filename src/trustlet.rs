//! Trustlet (IUM) policy metadata.
//!
//! A trustlet advertises its policy by exporting a well-known symbol that
//! points into a `.tPolicy` section. The metadata block is a small header
//! followed by `(type, policy_id, value)` records terminated by an all-zero
//! record; `value` is interpreted per the record's type, including VAs of
//! ANSI and UTF-16 strings.

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::export::ExportDirectoryDetails;
use crate::image::Image;
use crate::image::accessor::{cstring_from_va, struct_from_rva, utf16_from_rva};
use crate::image::address::{section_index_from_rva, va_to_rva};
use crate::packed::{PackedCString, PackedStruct, PackedUtf16CString, packed_size_of};
use crate::section_table::{IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_READ};

/// The section that holds trustlet policy metadata.
pub const IMAGE_POLICY_SECTION_NAME: &str = ".tPolicy";
/// The policy export since Windows 10 16215.
pub const IMAGE_POLICY_METADATA_NAME: &str = "s_IumPolicyMetadata";
/// The policy export of earlier builds.
pub const IMAGE_POLICY_METADATA_NAME_LEGACY: &str = "__ImagePolicyMetadata";
/// The only metadata version this format has ever had.
pub const IMAGE_POLICY_METADATA_VERSION: u8 = 1;

/// Policy entry types.
pub const IMAGE_POLICY_ENTRY_TYPE_NONE: u32 = 0;
pub const IMAGE_POLICY_ENTRY_TYPE_BOOL: u32 = 1;
pub const IMAGE_POLICY_ENTRY_TYPE_INT8: u32 = 2;
pub const IMAGE_POLICY_ENTRY_TYPE_UINT8: u32 = 3;
pub const IMAGE_POLICY_ENTRY_TYPE_INT16: u32 = 4;
pub const IMAGE_POLICY_ENTRY_TYPE_UINT16: u32 = 5;
pub const IMAGE_POLICY_ENTRY_TYPE_INT32: u32 = 6;
pub const IMAGE_POLICY_ENTRY_TYPE_UINT32: u32 = 7;
pub const IMAGE_POLICY_ENTRY_TYPE_INT64: u32 = 8;
pub const IMAGE_POLICY_ENTRY_TYPE_UINT64: u32 = 9;
pub const IMAGE_POLICY_ENTRY_TYPE_ANSI_STRING: u32 = 10;
pub const IMAGE_POLICY_ENTRY_TYPE_UNICODE_STRING: u32 = 11;
pub const IMAGE_POLICY_ENTRY_TYPE_OVERRIDEN: u32 = 12;

/// Well-known policy ids.
pub const IMAGE_POLICY_ID_ETW: u32 = 1;
pub const IMAGE_POLICY_ID_DEBUG: u32 = 2;
pub const IMAGE_POLICY_ID_CRASH_DUMP: u32 = 3;
pub const IMAGE_POLICY_ID_CRASH_DUMP_KEY: u32 = 4;
pub const IMAGE_POLICY_ID_CRASH_DUMP_KEY_GUID: u32 = 5;
pub const IMAGE_POLICY_ID_PARENT_SD: u32 = 6;
pub const IMAGE_POLICY_ID_PARENT_SD_REV: u32 = 7;
pub const IMAGE_POLICY_ID_SVN: u32 = 8;
pub const IMAGE_POLICY_ID_DEVICE_ID: u32 = 9;
pub const IMAGE_POLICY_ID_CAPABILITY: u32 = 10;
pub const IMAGE_POLICY_ID_SCENARIO_ID: u32 = 11;

/// The metadata block header.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct ImagePolicyMetadata {
    /// Must be [`IMAGE_POLICY_METADATA_VERSION`].
    pub version: u8,
    pub reserved0: [u8; 7],
    pub application_id: u64,
}

/// One raw policy record.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct ImagePolicyEntry {
    pub entry_type: u32,
    pub policy_id: u32,
    pub value: u64,
}

impl ImagePolicyEntry {
    pub fn is_terminator(&self) -> bool {
        self.entry_type == 0 && self.policy_id == 0 && self.value == 0
    }
}

error_codes! {
    /// Trustlet policy diagnostics.
    pub enum TrustletError("trustlet_policy") {
        InvalidPolicySection => "Policy metadata does not point into a .tPolicy section",
        InvalidSectionCharacteristics => "The .tPolicy section characteristics are not exactly MEM_READ | CNT_INITIALIZED_DATA",
        InvalidMetadataVersion => "Unsupported policy metadata version",
        UnsupportedPolicyType => "Policy entry type is unknown",
        InvalidStringVa => "Policy string VA does not map into the image",
        TooManyEntries => "Number of policy entries exceeds the configured limit",
        InvalidEntry => "Policy entry cannot be read",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct TrustletLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    pub max_policy_entries: u32,
}

impl Default for TrustletLoadOptions {
    fn default() -> Self {
        TrustletLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            max_policy_entries: 0x1000,
        }
    }
}

/// A policy record's value, interpreted per its type.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PolicyValue {
    #[default]
    None,
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    AnsiString(PackedCString),
    UnicodeString(PackedUtf16CString),
    Overriden,
    /// Unknown type; the raw value is in the descriptor.
    Unknown,
}

/// One decoded policy entry.
#[derive(Debug, Clone, Default)]
pub struct TrustletPolicyEntry {
    pub descriptor: PackedStruct<ImagePolicyEntry>,
    pub value: PolicyValue,
    pub errors: ErrorList<TrustletError>,
}

/// The decoded trustlet policy.
#[derive(Debug, Clone, Default)]
pub struct TrustletPolicyDetails {
    pub descriptor: PackedStruct<ImagePolicyMetadata>,
    pub entries: Vec<TrustletPolicyEntry>,
    pub errors: ErrorList<TrustletError>,
}

fn decode_value(
    image: &Image,
    options: &TrustletLoadOptions,
    entry: &mut TrustletPolicyEntry,
    index: usize,
) {
    let value = entry.descriptor.value;
    entry.value = match entry.descriptor.entry_type {
        IMAGE_POLICY_ENTRY_TYPE_NONE => PolicyValue::None,
        IMAGE_POLICY_ENTRY_TYPE_BOOL => PolicyValue::Bool(value != 0),
        IMAGE_POLICY_ENTRY_TYPE_INT8 => PolicyValue::Int8(value as i8),
        IMAGE_POLICY_ENTRY_TYPE_UINT8 => PolicyValue::UInt8(value as u8),
        IMAGE_POLICY_ENTRY_TYPE_INT16 => PolicyValue::Int16(value as i16),
        IMAGE_POLICY_ENTRY_TYPE_UINT16 => PolicyValue::UInt16(value as u16),
        IMAGE_POLICY_ENTRY_TYPE_INT32 => PolicyValue::Int32(value as i32),
        IMAGE_POLICY_ENTRY_TYPE_UINT32 => PolicyValue::UInt32(value as u32),
        IMAGE_POLICY_ENTRY_TYPE_INT64 => PolicyValue::Int64(value as i64),
        IMAGE_POLICY_ENTRY_TYPE_UINT64 => PolicyValue::UInt64(value),
        IMAGE_POLICY_ENTRY_TYPE_ANSI_STRING => {
            match cstring_from_va(image, value, options.include_headers, options.allow_virtual_data)
            {
                Ok(s) => PolicyValue::AnsiString(s),
                Err(_) => {
                    entry
                        .errors
                        .add_error_with_index(TrustletError::InvalidStringVa, index);
                    PolicyValue::None
                }
            }
        }
        IMAGE_POLICY_ENTRY_TYPE_UNICODE_STRING => {
            match va_to_rva(image, value).and_then(|rva| {
                utf16_from_rva(image, rva, options.include_headers, options.allow_virtual_data)
            }) {
                Ok(s) => PolicyValue::UnicodeString(s),
                Err(_) => {
                    entry
                        .errors
                        .add_error_with_index(TrustletError::InvalidStringVa, index);
                    PolicyValue::None
                }
            }
        }
        IMAGE_POLICY_ENTRY_TYPE_OVERRIDEN => PolicyValue::Overriden,
        _ => {
            entry
                .errors
                .add_error_with_index(TrustletError::UnsupportedPolicyType, index);
            PolicyValue::Unknown
        }
    };
}

/// Loads trustlet policy metadata via the well-known export, or `None` when
/// the image exports no policy symbol.
pub fn load(
    image: &Image,
    exports: &ExportDirectoryDetails,
    options: &TrustletLoadOptions,
) -> Result<Option<TrustletPolicyDetails>> {
    let symbol = exports
        .symbol_by_name(IMAGE_POLICY_METADATA_NAME)
        .or_else(|| exports.symbol_by_name(IMAGE_POLICY_METADATA_NAME_LEGACY));
    let Some(symbol) = symbol else {
        return Ok(None);
    };
    let metadata_rva = *symbol.rva;

    let mut details = TrustletPolicyDetails::default();
    match section_index_from_rva(image, metadata_rva, 1) {
        Some(index) => {
            let header = &image.section_table[index];
            if header.name() != Some(IMAGE_POLICY_SECTION_NAME) {
                details.errors.add_error(TrustletError::InvalidPolicySection);
            } else if header.characteristics
                != IMAGE_SCN_MEM_READ | IMAGE_SCN_CNT_INITIALIZED_DATA
            {
                details
                    .errors
                    .add_error(TrustletError::InvalidSectionCharacteristics);
            }
        }
        None => details.errors.add_error(TrustletError::InvalidPolicySection),
    }

    details.descriptor = struct_from_rva(
        image,
        metadata_rva,
        options.include_headers,
        options.allow_virtual_data,
    )?;
    if details.descriptor.version != IMAGE_POLICY_METADATA_VERSION {
        details
            .errors
            .add_error(TrustletError::InvalidMetadataVersion);
    }

    let entry_size = packed_size_of::<ImagePolicyEntry>() as u32;
    let entries_rva = metadata_rva.wrapping_add(packed_size_of::<ImagePolicyMetadata>() as u32);
    for index in 0..options.max_policy_entries {
        let descriptor = match struct_from_rva::<ImagePolicyEntry>(
            image,
            entries_rva.wrapping_add(index * entry_size),
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                details.errors.add_error(TrustletError::InvalidEntry);
                return Ok(Some(details));
            }
        };
        if descriptor.is_terminator() {
            return Ok(Some(details));
        }
        let mut entry = TrustletPolicyEntry {
            descriptor,
            ..TrustletPolicyEntry::default()
        };
        decode_value(image, options, &mut entry, index as usize);
        details.entries.push(entry);
    }
    details.errors.add_error(TrustletError::TooManyEntries);
    Ok(Some(details))
}
