//! The load configuration directory.
//!
//! This structure has grown a tail of new fields with nearly every Windows
//! release; the leading `size` field says how much of it a given image
//! carries. The loader prefix-reads up to the newest layout it knows,
//! derives a version tier from the size, and only then walks the sub-tables
//! that tier can legally declare: SafeSEH handlers, the CF-guard family,
//! CHPE metadata, the dynamic value relocation table, enclave configuration,
//! volatile metadata, and EH continuation targets.

use core::mem::offset_of;

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::dynreloc::{self, DynRelocLoadOptions, DynamicRelocationTable};
use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::{
    byte_vector_from_rva, bytes_from_rva, cstring_from_rva, rva_is_resolvable, struct_from_rva,
};
use crate::image::address::va_to_rva;
use crate::packed::{PackedCString, PackedStruct, packed_size_of};

// GuardFlags: bitflags for the guard_flags field.

/// The module performs control flow integrity checks.
pub const IMAGE_GUARD_CF_INSTRUMENTED: u32 = 0x0000_0100;
/// The module performs control flow and write integrity checks.
pub const IMAGE_GUARD_CFW_INSTRUMENTED: u32 = 0x0000_0200;
/// The module contains valid control flow target metadata.
pub const IMAGE_GUARD_CF_FUNCTION_TABLE_PRESENT: u32 = 0x0000_0400;
/// The module does not use the /GS security cookie.
pub const IMAGE_GUARD_SECURITY_COOKIE_UNUSED: u32 = 0x0000_0800;
/// The module supports read-only delay load IAT.
pub const IMAGE_GUARD_PROTECT_DELAYLOAD_IAT: u32 = 0x0000_1000;
/// The delay-load IAT is in its own freely reprotectable section.
pub const IMAGE_GUARD_DELAYLOAD_IAT_IN_ITS_OWN_SECTION: u32 = 0x0000_2000;
/// The module carries suppressed-export information.
pub const IMAGE_GUARD_CF_EXPORT_SUPPRESSION_INFO_PRESENT: u32 = 0x0000_4000;
/// The module enables suppression of exports.
pub const IMAGE_GUARD_CF_ENABLE_EXPORT_SUPPRESSION: u32 = 0x0000_8000;
/// The module contains longjmp target information.
pub const IMAGE_GUARD_CF_LONGJUMP_TABLE_PRESENT: u32 = 0x0001_0000;
/// The module contains return flow instrumentation.
pub const IMAGE_GUARD_RF_INSTRUMENTED: u32 = 0x0002_0000;
/// The module requests return flow protection.
pub const IMAGE_GUARD_RF_ENABLE: u32 = 0x0004_0000;
/// The module requests strict return flow protection.
pub const IMAGE_GUARD_RF_STRICT: u32 = 0x0008_0000;
/// The module was built with retpoline support.
pub const IMAGE_GUARD_RETPOLINE_PRESENT: u32 = 0x0010_0000;
/// The module contains EH continuation target information.
pub const IMAGE_GUARD_EH_CONTINUATION_TABLE_PRESENT: u32 = 0x0040_0000;
/// The module was built with XFG.
pub const IMAGE_GUARD_XFG_ENABLED: u32 = 0x0080_0000;
/// The module has CastGuard instrumentation.
pub const IMAGE_GUARD_CASTGUARD_PRESENT: u32 = 0x0100_0000;
/// The module has guarded-memcpy instrumentation.
pub const IMAGE_GUARD_MEMCPY_PRESENT: u32 = 0x0200_0000;

/// Mask of the per-entry extra byte count in guard tables.
pub const IMAGE_GUARD_CF_FUNCTION_TABLE_SIZE_MASK: u32 = 0xF000_0000;
/// Shift of [`IMAGE_GUARD_CF_FUNCTION_TABLE_SIZE_MASK`].
pub const IMAGE_GUARD_CF_FUNCTION_TABLE_SIZE_SHIFT: u32 = 28;

/// Code-integrity configuration carried inside the directory.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct LoadConfigCodeIntegrity {
    pub flags: u16,
    pub catalog: u16,
    pub catalog_offset: u32,
    pub reserved: u32,
}

/// `IMAGE_LOAD_CONFIG_DIRECTORY64`
#[repr(C)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith, PartialEq)]
#[doc(alias("IMAGE_LOAD_CONFIG_DIRECTORY64"))]
pub struct LoadConfigDirectory64 {
    pub size: u32,
    pub time_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub global_flags_clear: u32,
    pub global_flags_set: u32,
    pub critical_section_default_timeout: u32,
    pub de_commit_free_block_threshold: u64,
    pub de_commit_total_free_threshold: u64,
    pub lock_prefix_table: u64,
    pub maximum_allocation_size: u64,
    pub virtual_memory_threshold: u64,
    pub process_affinity_mask: u64,
    pub process_heap_flags: u32,
    pub csd_version: u16,
    pub dependent_load_flags: u16,
    pub edit_list: u64,
    pub security_cookie: u64,
    pub se_handler_table: u64,
    pub se_handler_count: u64,
    pub guard_cf_check_function_pointer: u64,
    pub guard_cf_dispatch_function_pointer: u64,
    pub guard_cf_function_table: u64,
    pub guard_cf_function_count: u64,
    pub guard_flags: u32,
    pub code_integrity: LoadConfigCodeIntegrity,
    pub guard_address_taken_iat_entry_table: u64,
    pub guard_address_taken_iat_entry_count: u64,
    pub guard_long_jump_target_table: u64,
    pub guard_long_jump_target_count: u64,
    pub dynamic_value_reloc_table: u64,
    pub chpe_metadata_pointer: u64,
    pub guard_rf_failure_routine: u64,
    pub guard_rf_failure_routine_function_pointer: u64,
    pub dynamic_value_reloc_table_offset: u32,
    pub dynamic_value_reloc_table_section: u16,
    pub reserved2: u16,
    pub guard_rf_verify_stack_pointer_function_pointer: u64,
    pub hot_patch_table_offset: u32,
    pub reserved3: u32,
    pub enclave_configuration_pointer: u64,
    pub volatile_metadata_pointer: u64,
    pub guard_eh_continuation_table: u64,
    pub guard_eh_continuation_count: u64,
    pub guard_xfg_check_function_pointer: u64,
    pub guard_xfg_dispatch_function_pointer: u64,
    pub guard_xfg_table_dispatch_function_pointer: u64,
    pub cast_guard_os_determined_failure_mode: u64,
    pub guard_memcpy_function_pointer: u64,
}

/// `IMAGE_LOAD_CONFIG_DIRECTORY32`
#[repr(C)]
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith, PartialEq)]
#[doc(alias("IMAGE_LOAD_CONFIG_DIRECTORY32"))]
pub struct LoadConfigDirectory32 {
    pub size: u32,
    pub time_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub global_flags_clear: u32,
    pub global_flags_set: u32,
    pub critical_section_default_timeout: u32,
    pub de_commit_free_block_threshold: u32,
    pub de_commit_total_free_threshold: u32,
    pub lock_prefix_table: u32,
    pub maximum_allocation_size: u32,
    pub virtual_memory_threshold: u32,
    pub process_heap_flags: u32,
    pub process_affinity_mask: u32,
    pub csd_version: u16,
    pub dependent_load_flags: u16,
    pub edit_list: u32,
    pub security_cookie: u32,
    pub se_handler_table: u32,
    pub se_handler_count: u32,
    pub guard_cf_check_function_pointer: u32,
    pub guard_cf_dispatch_function_pointer: u32,
    pub guard_cf_function_table: u32,
    pub guard_cf_function_count: u32,
    pub guard_flags: u32,
    pub code_integrity: LoadConfigCodeIntegrity,
    pub guard_address_taken_iat_entry_table: u32,
    pub guard_address_taken_iat_entry_count: u32,
    pub guard_long_jump_target_table: u32,
    pub guard_long_jump_target_count: u32,
    pub dynamic_value_reloc_table: u32,
    pub chpe_metadata_pointer: u32,
    pub guard_rf_failure_routine: u32,
    pub guard_rf_failure_routine_function_pointer: u32,
    pub dynamic_value_reloc_table_offset: u32,
    pub dynamic_value_reloc_table_section: u16,
    pub reserved2: u16,
    pub guard_rf_verify_stack_pointer_function_pointer: u32,
    pub hot_patch_table_offset: u32,
    pub reserved3: u32,
    pub enclave_configuration_pointer: u32,
    pub volatile_metadata_pointer: u32,
    pub guard_eh_continuation_table: u32,
    pub guard_eh_continuation_count: u32,
    pub guard_xfg_check_function_pointer: u32,
    pub guard_xfg_dispatch_function_pointer: u32,
    pub guard_xfg_table_dispatch_function_pointer: u32,
    pub cast_guard_os_determined_failure_mode: u32,
    pub guard_memcpy_function_pointer: u32,
}

/// The historical layout tiers, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadConfigVersion {
    Base,
    Seh,
    CfGuard,
    CodeIntegrity,
    CfGuardEx,
    HybridPe,
    RfGuard,
    RfGuardEx,
    Enclave,
    VolatileMetadata,
    EhGuard,
    XfGuard,
    CastGuard,
    MemcpyGuard,
}

macro_rules! version_ladder {
    ($ty:ty) => {
        [
            (offset_of!($ty, se_handler_table), LoadConfigVersion::Base),
            (
                offset_of!($ty, guard_cf_check_function_pointer),
                LoadConfigVersion::Seh,
            ),
            (offset_of!($ty, code_integrity), LoadConfigVersion::CfGuard),
            (
                offset_of!($ty, guard_address_taken_iat_entry_table),
                LoadConfigVersion::CodeIntegrity,
            ),
            (
                offset_of!($ty, dynamic_value_reloc_table),
                LoadConfigVersion::CfGuardEx,
            ),
            (
                offset_of!($ty, guard_rf_failure_routine),
                LoadConfigVersion::HybridPe,
            ),
            (
                offset_of!($ty, guard_rf_verify_stack_pointer_function_pointer),
                LoadConfigVersion::RfGuard,
            ),
            (
                offset_of!($ty, enclave_configuration_pointer),
                LoadConfigVersion::RfGuardEx,
            ),
            (
                offset_of!($ty, volatile_metadata_pointer),
                LoadConfigVersion::Enclave,
            ),
            (
                offset_of!($ty, guard_eh_continuation_table),
                LoadConfigVersion::VolatileMetadata,
            ),
            (
                offset_of!($ty, guard_xfg_check_function_pointer),
                LoadConfigVersion::EhGuard,
            ),
            (
                offset_of!($ty, cast_guard_os_determined_failure_mode),
                LoadConfigVersion::XfGuard,
            ),
            (
                offset_of!($ty, guard_memcpy_function_pointer),
                LoadConfigVersion::CastGuard,
            ),
            (packed_size_of::<$ty>(), LoadConfigVersion::MemcpyGuard),
        ]
    };
}

/// The highest tier whose size stamp fits `size`, plus whether `size` hits a
/// stamp exactly.
pub fn version_from_size(size: usize, is_64: bool) -> (LoadConfigVersion, bool) {
    let ladder = if is_64 {
        version_ladder!(LoadConfigDirectory64).to_vec()
    } else {
        version_ladder!(LoadConfigDirectory32).to_vec()
    };
    let mut version = LoadConfigVersion::Base;
    let mut exact = false;
    for (stamp, tier) in ladder {
        if size >= stamp {
            version = tier;
        }
        if size == stamp {
            exact = true;
        }
    }
    (version, exact)
}

error_codes! {
    /// Load configuration diagnostics.
    pub enum LoadConfigError("load_config_loader") {
        UnknownVersion => "Directory size is smaller than any known layout",
        SizeDoesNotMatchVersion => "Directory size is not an exact known layout size",
        InvalidLockPrefixTable => "Lock prefix table cannot be read",
        TooManyLockPrefixes => "Number of lock prefix entries exceeds the configured limit",
        InvalidSecurityCookieVa => "Security cookie VA does not map into the image",
        InvalidSafeSehHandlerTable => "SafeSEH handler table cannot be read",
        TooManySafeSehHandlers => "Number of SafeSEH handlers exceeds the configured limit",
        SafeSehOn64Bit => "SafeSEH handler table is only meaningful for PE32 images",
        InvalidGuardCfCheckFunctionVa => "CF guard check function VA does not map into the image",
        InvalidGuardCfDispatchFunctionVa => "CF guard dispatch function VA does not map into the image",
        InvalidGuardCfFunctionTable => "CF guard function table cannot be read",
        UnsortedGuardCfFunctionTable => "CF guard function table is not sorted by RVA",
        TooManyGuardCfFunctions => "Number of CF guard functions exceeds the configured limit",
        InvalidGuardAddressTakenIatTable => "CF guard address-taken IAT table cannot be read",
        UnsortedGuardAddressTakenIatTable => "CF guard address-taken IAT table is not sorted by RVA",
        InvalidGuardLongJumpTable => "CF guard long jump table cannot be read",
        UnsortedGuardLongJumpTable => "CF guard long jump table is not sorted by RVA",
        InvalidChpeMetadata => "CHPE metadata cannot be read",
        TooManyChpeRanges => "Number of CHPE code ranges exceeds the configured limit",
        InvalidDynamicRelocTable => "Dynamic value relocation table location is invalid",
        InvalidRfFailureRoutineVa => "RF guard failure routine VA does not map into the image",
        InvalidRfFailureRoutineFunctionVa => "RF guard failure routine function pointer VA does not map into the image",
        InvalidRfVerifyStackPointerFunctionVa => "RF guard verify-stack-pointer VA does not map into the image",
        InvalidEnclaveConfig => "Enclave configuration cannot be read",
        TooManyEnclaveImports => "Number of enclave imports exceeds the configured limit",
        InvalidEnclaveImportName => "Enclave import name cannot be read",
        InvalidVolatileMetadata => "Volatile metadata cannot be read",
        InvalidEhContinuationTable => "EH continuation target table cannot be read",
        UnsortedEhContinuationTargets => "EH continuation targets are not sorted by RVA",
        TooManyEhContTargets => "Number of EH continuation targets exceeds the configured limit",
        InvalidXfgCheckFunctionVa => "XFG check function VA does not map into the image",
        InvalidXfgDispatchFunctionVa => "XFG dispatch function VA does not map into the image",
        InvalidXfgTableDispatchFunctionVa => "XFG table dispatch function VA does not map into the image",
        InvalidCastGuardVa => "CastGuard failure mode VA does not map into the image",
        InvalidMemcpyFunctionVa => "Guarded memcpy function VA does not map into the image",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct LoadConfigLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    pub load_lock_prefix_table: bool,
    pub load_safeseh_handlers: bool,
    pub load_cf_guard_tables: bool,
    pub load_chpe_metadata: bool,
    pub load_dynamic_relocations: bool,
    pub load_enclave_config: bool,
    pub load_volatile_metadata: bool,
    pub load_ehcont_targets: bool,
    pub max_lock_prefix_entries: u32,
    pub max_safeseh_handler_count: u32,
    pub max_guard_function_count: u32,
    pub max_cphe_code_address_range_count: u32,
    pub max_enclave_number_of_imports: u32,
    pub max_volatile_entry_count: u32,
    pub max_ehcont_targets: u32,
}

impl Default for LoadConfigLoadOptions {
    fn default() -> Self {
        LoadConfigLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            load_lock_prefix_table: true,
            load_safeseh_handlers: true,
            load_cf_guard_tables: true,
            load_chpe_metadata: true,
            load_dynamic_relocations: true,
            load_enclave_config: true,
            load_volatile_metadata: true,
            load_ehcont_targets: true,
            max_lock_prefix_entries: 0x100,
            max_safeseh_handler_count: 0x1_0000,
            max_guard_function_count: 0x10_0000,
            max_cphe_code_address_range_count: 0x1000,
            max_enclave_number_of_imports: 0x100,
            max_volatile_entry_count: 0x1_0000,
            max_ehcont_targets: 0x10_0000,
        }
    }
}

/// The bitness-tagged directory record.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadConfigDescriptor {
    Config32(PackedStruct<LoadConfigDirectory32>),
    Config64(PackedStruct<LoadConfigDirectory64>),
}

macro_rules! cfg_field {
    ($(#[$meta:meta])* $name:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $name(&self) -> $ty {
            match self {
                LoadConfigDescriptor::Config32(d) => d.$name as $ty,
                LoadConfigDescriptor::Config64(d) => d.$name as $ty,
            }
        }
    };
}

impl LoadConfigDescriptor {
    cfg_field!(size, u32);
    cfg_field!(guard_flags, u32);
    cfg_field!(lock_prefix_table, u64);
    cfg_field!(security_cookie, u64);
    cfg_field!(se_handler_table, u64);
    cfg_field!(se_handler_count, u64);
    cfg_field!(guard_cf_check_function_pointer, u64);
    cfg_field!(guard_cf_dispatch_function_pointer, u64);
    cfg_field!(guard_cf_function_table, u64);
    cfg_field!(guard_cf_function_count, u64);
    cfg_field!(guard_address_taken_iat_entry_table, u64);
    cfg_field!(guard_address_taken_iat_entry_count, u64);
    cfg_field!(guard_long_jump_target_table, u64);
    cfg_field!(guard_long_jump_target_count, u64);
    cfg_field!(dynamic_value_reloc_table, u64);
    cfg_field!(dynamic_value_reloc_table_offset, u32);
    cfg_field!(dynamic_value_reloc_table_section, u16);
    cfg_field!(chpe_metadata_pointer, u64);
    cfg_field!(guard_rf_failure_routine, u64);
    cfg_field!(guard_rf_failure_routine_function_pointer, u64);
    cfg_field!(guard_rf_verify_stack_pointer_function_pointer, u64);
    cfg_field!(enclave_configuration_pointer, u64);
    cfg_field!(volatile_metadata_pointer, u64);
    cfg_field!(guard_eh_continuation_table, u64);
    cfg_field!(guard_eh_continuation_count, u64);
    cfg_field!(guard_xfg_check_function_pointer, u64);
    cfg_field!(guard_xfg_dispatch_function_pointer, u64);
    cfg_field!(guard_xfg_table_dispatch_function_pointer, u64);
    cfg_field!(cast_guard_os_determined_failure_mode, u64);
    cfg_field!(guard_memcpy_function_pointer, u64);

    pub fn is_64bit(&self) -> bool {
        matches!(self, LoadConfigDescriptor::Config64(_))
    }

    /// Extra bytes appended to each guard-table entry.
    pub fn guard_table_stride(&self) -> u32 {
        (self.guard_flags() & IMAGE_GUARD_CF_FUNCTION_TABLE_SIZE_MASK)
            >> IMAGE_GUARD_CF_FUNCTION_TABLE_SIZE_SHIFT
    }
}

/// One guard-table entry: an RVA plus stride-declared extra bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardFunctionEntry {
    pub rva: u32,
    /// The XFG hash or other stride bytes.
    pub extra: Vec<u8>,
}

/// Decoded CHPE metadata (x86 hybrid and ARM64EC share the prefix).
#[derive(Debug, Clone, Default)]
pub struct ChpeMetadata {
    pub version: u32,
    /// RVA of the code range array.
    pub range_table_rva: u32,
    pub ranges: Vec<ChpeRangeEntry>,
    pub errors: ErrorList<LoadConfigError>,
}

/// One CHPE code range.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct ChpeRangeEntry {
    /// Start RVA with the architecture in the low bit(s).
    pub start_offset: u32,
    pub length: u32,
}

/// `IMAGE_ENCLAVE_CONFIG` common fields (the enclave size width differs by
/// bitness and is widened here).
#[derive(Debug, Clone, Default)]
pub struct EnclaveConfig {
    pub size: u32,
    pub minimum_required_config_size: u32,
    pub policy_flags: u32,
    pub number_of_imports: u32,
    /// RVA of the import descriptor array.
    pub import_list: u32,
    pub import_entry_size: u32,
    pub family_id: [u8; 16],
    pub image_id: [u8; 16],
    pub image_version: u32,
    pub security_version: u32,
    pub enclave_size: u64,
    pub number_of_threads: u32,
    pub enclave_flags: u32,
    pub imports: Vec<EnclaveImport>,
    pub errors: ErrorList<LoadConfigError>,
}

/// `IMAGE_ENCLAVE_IMPORT`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_ENCLAVE_IMPORT"))]
pub struct ImageEnclaveImport {
    pub match_type: u32,
    pub minimum_security_version: u32,
    pub unique_or_author_id: [u8; 32],
    pub family_id: [u8; 16],
    pub image_id: [u8; 16],
    /// RVA of the import's name.
    pub import_name: u32,
    pub reserved: u32,
}

impl Default for ImageEnclaveImport {
    fn default() -> Self {
        ImageEnclaveImport {
            match_type: 0,
            minimum_security_version: 0,
            unique_or_author_id: [0; 32],
            family_id: [0; 16],
            image_id: [0; 16],
            import_name: 0,
            reserved: 0,
        }
    }
}

/// One enclave import plus its name and trailing opaque data.
#[derive(Debug, Clone, Default)]
pub struct EnclaveImport {
    pub descriptor: PackedStruct<ImageEnclaveImport>,
    pub name: Option<PackedCString>,
    /// Bytes past the known descriptor when `import_entry_size` is larger.
    pub extra_data: Vec<u8>,
    pub errors: ErrorList<LoadConfigError>,
}

/// `IMAGE_VOLATILE_METADATA`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_VOLATILE_METADATA"))]
pub struct ImageVolatileMetadata {
    pub size: u32,
    pub version: u32,
    /// RVA of the access table (4-byte RVA entries).
    pub volatile_access_table: u32,
    pub volatile_access_table_size: u32,
    /// RVA of the info range table.
    pub volatile_info_range_table: u32,
    pub volatile_info_range_table_size: u32,
}

/// One volatile info range.
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct VolatileInfoRange {
    pub rva: u32,
    pub size: u32,
}

/// Decoded volatile metadata.
#[derive(Debug, Clone, Default)]
pub struct VolatileMetadata {
    pub descriptor: PackedStruct<ImageVolatileMetadata>,
    pub access_rvas: Vec<u32>,
    pub info_ranges: Vec<VolatileInfoRange>,
    pub errors: ErrorList<LoadConfigError>,
}

/// The decoded load configuration directory.
#[derive(Debug, Clone)]
pub struct LoadConfigDirectoryDetails {
    pub descriptor: LoadConfigDescriptor,
    pub version: LoadConfigVersion,
    pub lock_prefixes: Vec<u64>,
    pub safeseh_handlers: Vec<u32>,
    pub guard_cf_functions: Vec<GuardFunctionEntry>,
    pub guard_address_taken_iat_entries: Vec<GuardFunctionEntry>,
    pub guard_long_jump_targets: Vec<GuardFunctionEntry>,
    pub chpe_metadata: Option<ChpeMetadata>,
    pub dynamic_relocations: Option<DynamicRelocationTable>,
    pub enclave_config: Option<EnclaveConfig>,
    pub volatile_metadata: Option<VolatileMetadata>,
    pub eh_continuation_targets: Vec<GuardFunctionEntry>,
    pub errors: ErrorList<LoadConfigError>,
}

fn probe_va(
    image: &Image,
    va: u64,
    include_headers: bool,
    code: LoadConfigError,
    errors: &mut ErrorList<LoadConfigError>,
) {
    if va != 0
        && !va_to_rva(image, va).is_ok_and(|rva| rva_is_resolvable(image, rva, include_headers))
    {
        errors.add_error(code);
    }
}

/// Reads a guard-style table: `count` entries of `4 + stride` bytes each.
fn read_guard_table(
    image: &Image,
    options: &LoadConfigLoadOptions,
    table_va: u64,
    count: u64,
    stride: u32,
    invalid: LoadConfigError,
    unsorted: LoadConfigError,
    too_many: LoadConfigError,
    errors: &mut ErrorList<LoadConfigError>,
) -> Vec<GuardFunctionEntry> {
    let mut entries = Vec::new();
    if table_va == 0 || count == 0 {
        return entries;
    }
    let Ok(table_rva) = va_to_rva(image, table_va) else {
        errors.add_error(invalid);
        return entries;
    };
    let mut count = count;
    if count > u64::from(options.max_guard_function_count) {
        errors.add_error(too_many);
        count = u64::from(options.max_guard_function_count);
    }
    let entry_size = 4 + stride;
    for i in 0..count {
        let entry_rva = table_rva.wrapping_add((i as u32).wrapping_mul(entry_size));
        let Ok(rva) = struct_from_rva::<u32>(
            image,
            entry_rva,
            options.include_headers,
            options.allow_virtual_data,
        ) else {
            errors.add_error(invalid);
            break;
        };
        let extra = if stride != 0 {
            match bytes_from_rva(
                image,
                entry_rva.wrapping_add(4),
                stride as usize,
                options.include_headers,
            ) {
                Ok(extra) => extra,
                Err(_) if options.allow_virtual_data => vec![0; stride as usize],
                Err(_) => {
                    errors.add_error(invalid);
                    break;
                }
            }
        } else {
            Vec::new()
        };
        entries.push(GuardFunctionEntry { rva: *rva, extra });
    }
    if crate::utils::first_unsorted_index(&entries, |e| u64::from(e.rva)).is_some() {
        errors.add_error(unsorted);
    }
    entries
}

fn read_chpe_metadata(
    image: &Image,
    options: &LoadConfigLoadOptions,
    va: u64,
) -> Option<ChpeMetadata> {
    let rva = va_to_rva(image, va).ok()?;
    let mut chpe = ChpeMetadata::default();
    let version = struct_from_rva::<u32>(
        image,
        rva,
        options.include_headers,
        options.allow_virtual_data,
    )
    .ok()?;
    let range_rva = struct_from_rva::<u32>(
        image,
        rva.wrapping_add(4),
        options.include_headers,
        options.allow_virtual_data,
    )
    .ok()?;
    let range_count = struct_from_rva::<u32>(
        image,
        rva.wrapping_add(8),
        options.include_headers,
        options.allow_virtual_data,
    )
    .ok()?;
    chpe.version = *version;
    chpe.range_table_rva = *range_rva;

    let mut count = *range_count;
    if count > options.max_cphe_code_address_range_count {
        chpe.errors.add_error(LoadConfigError::TooManyChpeRanges);
        count = options.max_cphe_code_address_range_count;
    }
    for i in 0..count {
        match struct_from_rva::<ChpeRangeEntry>(
            image,
            range_rva.wrapping_add(i * packed_size_of::<ChpeRangeEntry>() as u32),
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(entry) => chpe.ranges.push(*entry),
            Err(_) => {
                chpe.errors.add_error(LoadConfigError::InvalidChpeMetadata);
                break;
            }
        }
    }
    Some(chpe)
}

fn read_enclave_config(
    image: &Image,
    options: &LoadConfigLoadOptions,
    va: u64,
) -> Option<EnclaveConfig> {
    let rva = va_to_rva(image, va).ok()?;
    let mut config = EnclaveConfig::default();

    // The fixed prefix preceding the bitness-dependent enclave size.
    let mut pos = rva;
    let read_u32 = |pos: &mut u32| -> Option<u32> {
        let value = struct_from_rva::<u32>(
            image,
            *pos,
            options.include_headers,
            options.allow_virtual_data,
        )
        .ok()?;
        *pos = pos.wrapping_add(4);
        Some(*value)
    };
    config.size = read_u32(&mut pos)?;
    config.minimum_required_config_size = read_u32(&mut pos)?;
    config.policy_flags = read_u32(&mut pos)?;
    config.number_of_imports = read_u32(&mut pos)?;
    config.import_list = read_u32(&mut pos)?;
    config.import_entry_size = read_u32(&mut pos)?;
    let family = byte_vector_from_rva(image, pos, 16, options.include_headers, options.allow_virtual_data).ok()?;
    config.family_id.copy_from_slice(&{
        let mut id = family.as_slice().to_vec();
        id.resize(16, 0);
        id
    });
    pos = pos.wrapping_add(16);
    let img = byte_vector_from_rva(image, pos, 16, options.include_headers, options.allow_virtual_data).ok()?;
    config.image_id.copy_from_slice(&{
        let mut id = img.as_slice().to_vec();
        id.resize(16, 0);
        id
    });
    pos = pos.wrapping_add(16);
    config.image_version = read_u32(&mut pos)?;
    config.security_version = read_u32(&mut pos)?;
    if image.is_64bit() {
        let size = struct_from_rva::<u64>(
            image,
            pos,
            options.include_headers,
            options.allow_virtual_data,
        )
        .ok()?;
        config.enclave_size = *size;
        pos = pos.wrapping_add(8);
    } else {
        config.enclave_size = u64::from(read_u32(&mut pos)?);
    }
    config.number_of_threads = read_u32(&mut pos)?;
    config.enclave_flags = read_u32(&mut pos)?;

    let mut import_count = config.number_of_imports;
    if import_count > options.max_enclave_number_of_imports {
        config.errors.add_error(LoadConfigError::TooManyEnclaveImports);
        import_count = options.max_enclave_number_of_imports;
    }
    let entry_size = config.import_entry_size as usize;
    let known_size = packed_size_of::<ImageEnclaveImport>();
    for i in 0..import_count {
        let entry_rva = config
            .import_list
            .wrapping_add(i.wrapping_mul(config.import_entry_size));
        let mut import = EnclaveImport::default();
        match struct_from_rva::<ImageEnclaveImport>(
            image,
            entry_rva,
            options.include_headers,
            options.allow_virtual_data,
        ) {
            Ok(descriptor) => import.descriptor = descriptor,
            Err(_) => {
                config.errors.add_error(LoadConfigError::InvalidEnclaveConfig);
                break;
            }
        }
        if entry_size > known_size {
            if let Ok(extra) = bytes_from_rva(
                image,
                entry_rva.wrapping_add(known_size as u32),
                entry_size - known_size,
                options.include_headers,
            ) {
                import.extra_data = extra;
            }
        }
        if import.descriptor.import_name != 0 {
            match cstring_from_rva(
                image,
                import.descriptor.import_name,
                options.include_headers,
                options.allow_virtual_data,
            ) {
                Ok(name) => import.name = Some(name),
                Err(_) => {
                    import
                        .errors
                        .add_error(LoadConfigError::InvalidEnclaveImportName);
                }
            }
        }
        config.imports.push(import);
    }
    Some(config)
}

fn read_volatile_metadata(
    image: &Image,
    options: &LoadConfigLoadOptions,
    va: u64,
) -> Option<VolatileMetadata> {
    let rva = va_to_rva(image, va).ok()?;
    let descriptor = struct_from_rva::<ImageVolatileMetadata>(
        image,
        rva,
        options.include_headers,
        options.allow_virtual_data,
    )
    .ok()?;
    let mut metadata = VolatileMetadata {
        descriptor,
        ..VolatileMetadata::default()
    };

    let access_count = (metadata.descriptor.volatile_access_table_size / 4)
        .min(options.max_volatile_entry_count);
    if metadata.descriptor.volatile_access_table_size / 4 > options.max_volatile_entry_count {
        metadata
            .errors
            .add_error(LoadConfigError::InvalidVolatileMetadata);
    }
    if metadata.descriptor.volatile_access_table != 0 {
        for i in 0..access_count {
            match struct_from_rva::<u32>(
                image,
                metadata.descriptor.volatile_access_table.wrapping_add(i * 4),
                options.include_headers,
                options.allow_virtual_data,
            ) {
                Ok(rva) => metadata.access_rvas.push(*rva),
                Err(_) => {
                    metadata
                        .errors
                        .add_error(LoadConfigError::InvalidVolatileMetadata);
                    break;
                }
            }
        }
    }

    let range_size = packed_size_of::<VolatileInfoRange>() as u32;
    let range_count = (metadata.descriptor.volatile_info_range_table_size / range_size)
        .min(options.max_volatile_entry_count);
    if metadata.descriptor.volatile_info_range_table != 0 {
        for i in 0..range_count {
            match struct_from_rva::<VolatileInfoRange>(
                image,
                metadata
                    .descriptor
                    .volatile_info_range_table
                    .wrapping_add(i * range_size),
                options.include_headers,
                options.allow_virtual_data,
            ) {
                Ok(range) => metadata.info_ranges.push(*range),
                Err(_) => {
                    metadata
                        .errors
                        .add_error(LoadConfigError::InvalidVolatileMetadata);
                    break;
                }
            }
        }
    }
    Some(metadata)
}

/// Loads the load configuration directory, or `None` when the image has
/// none.
pub fn load(
    image: &Image,
    options: &LoadConfigLoadOptions,
) -> Result<Option<LoadConfigDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::LoadConfig)
        .filter(|d| d.virtual_address != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    // The structure's own size field governs how much physically exists.
    let declared_size = *struct_from_rva::<u32>(
        image,
        dir.virtual_address,
        options.include_headers,
        options.allow_virtual_data,
    )?;
    let is_64 = image.is_64bit();
    let (version, exact) = version_from_size(declared_size as usize, is_64);

    let mut errors = ErrorList::new();
    let base_stamp = if is_64 {
        offset_of!(LoadConfigDirectory64, se_handler_table)
    } else {
        offset_of!(LoadConfigDirectory32, se_handler_table)
    };
    if (declared_size as usize) < base_stamp {
        errors.add_error(LoadConfigError::UnknownVersion);
    } else if !exact {
        errors.add_error(LoadConfigError::SizeDoesNotMatchVersion);
    }

    let until = declared_size as usize;
    let descriptor = if is_64 {
        LoadConfigDescriptor::Config64(read_prefix::<LoadConfigDirectory64>(
            image,
            dir.virtual_address,
            until,
            options,
        )?)
    } else {
        LoadConfigDescriptor::Config32(read_prefix::<LoadConfigDirectory32>(
            image,
            dir.virtual_address,
            until,
            options,
        )?)
    };
    debug!(
        "load config: size {:#x}, version {:?}, guard flags {:#x}",
        declared_size,
        version,
        descriptor.guard_flags()
    );

    let mut details = LoadConfigDirectoryDetails {
        descriptor,
        version,
        lock_prefixes: Vec::new(),
        safeseh_handlers: Vec::new(),
        guard_cf_functions: Vec::new(),
        guard_address_taken_iat_entries: Vec::new(),
        guard_long_jump_targets: Vec::new(),
        chpe_metadata: None,
        dynamic_relocations: None,
        enclave_config: None,
        volatile_metadata: None,
        eh_continuation_targets: Vec::new(),
        errors,
    };
    let descriptor = details.descriptor.clone();

    if options.load_lock_prefix_table && descriptor.lock_prefix_table() != 0 {
        match va_to_rva(image, descriptor.lock_prefix_table()) {
            Ok(table_rva) => {
                let step = if is_64 { 8u32 } else { 4u32 };
                for i in 0..options.max_lock_prefix_entries {
                    let va = if is_64 {
                        struct_from_rva::<u64>(
                            image,
                            table_rva.wrapping_add(i * step),
                            options.include_headers,
                            options.allow_virtual_data,
                        )
                        .map(|v| *v)
                    } else {
                        struct_from_rva::<u32>(
                            image,
                            table_rva.wrapping_add(i * step),
                            options.include_headers,
                            options.allow_virtual_data,
                        )
                        .map(|v| u64::from(*v))
                    };
                    match va {
                        Ok(0) => break,
                        Ok(va) => details.lock_prefixes.push(va),
                        Err(_) => {
                            details
                                .errors
                                .add_error(LoadConfigError::InvalidLockPrefixTable);
                            break;
                        }
                    }
                    if i + 1 == options.max_lock_prefix_entries {
                        details.errors.add_error(LoadConfigError::TooManyLockPrefixes);
                    }
                }
            }
            Err(_) => details
                .errors
                .add_error(LoadConfigError::InvalidLockPrefixTable),
        }
    }

    probe_va(
        image,
        descriptor.security_cookie(),
        options.include_headers,
        LoadConfigError::InvalidSecurityCookieVa,
        &mut details.errors,
    );

    if version >= LoadConfigVersion::Seh
        && options.load_safeseh_handlers
        && descriptor.se_handler_table() != 0
    {
        if is_64 {
            details.errors.add_error(LoadConfigError::SafeSehOn64Bit);
        } else {
            match va_to_rva(image, descriptor.se_handler_table()) {
                Ok(table_rva) => {
                    let mut count = descriptor.se_handler_count();
                    if count > u64::from(options.max_safeseh_handler_count) {
                        details
                            .errors
                            .add_error(LoadConfigError::TooManySafeSehHandlers);
                        count = u64::from(options.max_safeseh_handler_count);
                    }
                    for i in 0..count as u32 {
                        match struct_from_rva::<u32>(
                            image,
                            table_rva.wrapping_add(i * 4),
                            options.include_headers,
                            options.allow_virtual_data,
                        ) {
                            Ok(rva) => details.safeseh_handlers.push(*rva),
                            Err(_) => {
                                details
                                    .errors
                                    .add_error(LoadConfigError::InvalidSafeSehHandlerTable);
                                break;
                            }
                        }
                    }
                }
                Err(_) => details
                    .errors
                    .add_error(LoadConfigError::InvalidSafeSehHandlerTable),
            }
        }
    }

    if version >= LoadConfigVersion::CfGuard && options.load_cf_guard_tables {
        probe_va(
            image,
            descriptor.guard_cf_check_function_pointer(),
            options.include_headers,
            LoadConfigError::InvalidGuardCfCheckFunctionVa,
            &mut details.errors,
        );
        probe_va(
            image,
            descriptor.guard_cf_dispatch_function_pointer(),
            options.include_headers,
            LoadConfigError::InvalidGuardCfDispatchFunctionVa,
            &mut details.errors,
        );
        let stride = descriptor.guard_table_stride();
        details.guard_cf_functions = read_guard_table(
            image,
            options,
            descriptor.guard_cf_function_table(),
            descriptor.guard_cf_function_count(),
            stride,
            LoadConfigError::InvalidGuardCfFunctionTable,
            LoadConfigError::UnsortedGuardCfFunctionTable,
            LoadConfigError::TooManyGuardCfFunctions,
            &mut details.errors,
        );
        if version >= LoadConfigVersion::CfGuardEx {
            details.guard_address_taken_iat_entries = read_guard_table(
                image,
                options,
                descriptor.guard_address_taken_iat_entry_table(),
                descriptor.guard_address_taken_iat_entry_count(),
                stride,
                LoadConfigError::InvalidGuardAddressTakenIatTable,
                LoadConfigError::UnsortedGuardAddressTakenIatTable,
                LoadConfigError::TooManyGuardCfFunctions,
                &mut details.errors,
            );
            details.guard_long_jump_targets = read_guard_table(
                image,
                options,
                descriptor.guard_long_jump_target_table(),
                descriptor.guard_long_jump_target_count(),
                stride,
                LoadConfigError::InvalidGuardLongJumpTable,
                LoadConfigError::UnsortedGuardLongJumpTable,
                LoadConfigError::TooManyGuardCfFunctions,
                &mut details.errors,
            );
        }
    }

    if version >= LoadConfigVersion::HybridPe {
        if options.load_chpe_metadata && descriptor.chpe_metadata_pointer() != 0 {
            details.chpe_metadata = read_chpe_metadata(image, options, descriptor.chpe_metadata_pointer());
            if details.chpe_metadata.is_none() {
                details.errors.add_error(LoadConfigError::InvalidChpeMetadata);
            }
        }
        if options.load_dynamic_relocations {
            let dvrt_rva = if descriptor.dynamic_value_reloc_table() != 0 {
                va_to_rva(image, descriptor.dynamic_value_reloc_table()).ok()
            } else if version >= LoadConfigVersion::RfGuard
                && descriptor.dynamic_value_reloc_table_offset() != 0
                && descriptor.dynamic_value_reloc_table_section() != 0
            {
                // The section field is a one-based ordinal.
                image
                    .section_table
                    .get(usize::from(descriptor.dynamic_value_reloc_table_section()) - 1)
                    .map(|s| {
                        s.virtual_address
                            .wrapping_add(descriptor.dynamic_value_reloc_table_offset())
                    })
            } else {
                None
            };
            let have_location = descriptor.dynamic_value_reloc_table() != 0
                || descriptor.dynamic_value_reloc_table_offset() != 0;
            match dvrt_rva {
                Some(rva) => {
                    let dvrt_options = DynRelocLoadOptions {
                        include_headers: options.include_headers,
                        allow_virtual_data: options.allow_virtual_data,
                    };
                    match dynreloc::parse(image, rva, &dvrt_options) {
                        Ok(table) => details.dynamic_relocations = Some(table),
                        Err(_) => details
                            .errors
                            .add_error(LoadConfigError::InvalidDynamicRelocTable),
                    }
                }
                None if have_location => details
                    .errors
                    .add_error(LoadConfigError::InvalidDynamicRelocTable),
                None => {}
            }
        }
    }

    if version >= LoadConfigVersion::RfGuard {
        probe_va(
            image,
            descriptor.guard_rf_failure_routine(),
            options.include_headers,
            LoadConfigError::InvalidRfFailureRoutineVa,
            &mut details.errors,
        );
        probe_va(
            image,
            descriptor.guard_rf_failure_routine_function_pointer(),
            options.include_headers,
            LoadConfigError::InvalidRfFailureRoutineFunctionVa,
            &mut details.errors,
        );
    }
    if version >= LoadConfigVersion::RfGuardEx {
        probe_va(
            image,
            descriptor.guard_rf_verify_stack_pointer_function_pointer(),
            options.include_headers,
            LoadConfigError::InvalidRfVerifyStackPointerFunctionVa,
            &mut details.errors,
        );
    }

    if version >= LoadConfigVersion::Enclave
        && options.load_enclave_config
        && descriptor.enclave_configuration_pointer() != 0
    {
        details.enclave_config =
            read_enclave_config(image, options, descriptor.enclave_configuration_pointer());
        if details.enclave_config.is_none() {
            details.errors.add_error(LoadConfigError::InvalidEnclaveConfig);
        }
    }

    if version >= LoadConfigVersion::VolatileMetadata
        && options.load_volatile_metadata
        && descriptor.volatile_metadata_pointer() != 0
    {
        details.volatile_metadata =
            read_volatile_metadata(image, options, descriptor.volatile_metadata_pointer());
        if details.volatile_metadata.is_none() {
            details
                .errors
                .add_error(LoadConfigError::InvalidVolatileMetadata);
        }
    }

    if version >= LoadConfigVersion::EhGuard && options.load_ehcont_targets {
        let mut count = descriptor.guard_eh_continuation_count();
        if count > u64::from(options.max_ehcont_targets) {
            details.errors.add_error(LoadConfigError::TooManyEhContTargets);
            count = u64::from(options.max_ehcont_targets);
        }
        details.eh_continuation_targets = read_guard_table(
            image,
            options,
            descriptor.guard_eh_continuation_table(),
            count,
            details.descriptor.guard_table_stride(),
            LoadConfigError::InvalidEhContinuationTable,
            LoadConfigError::UnsortedEhContinuationTargets,
            LoadConfigError::TooManyEhContTargets,
            &mut details.errors,
        );
    }

    if version >= LoadConfigVersion::XfGuard {
        probe_va(
            image,
            descriptor.guard_xfg_check_function_pointer(),
            options.include_headers,
            LoadConfigError::InvalidXfgCheckFunctionVa,
            &mut details.errors,
        );
        probe_va(
            image,
            descriptor.guard_xfg_dispatch_function_pointer(),
            options.include_headers,
            LoadConfigError::InvalidXfgDispatchFunctionVa,
            &mut details.errors,
        );
        probe_va(
            image,
            descriptor.guard_xfg_table_dispatch_function_pointer(),
            options.include_headers,
            LoadConfigError::InvalidXfgTableDispatchFunctionVa,
            &mut details.errors,
        );
    }
    if version >= LoadConfigVersion::CastGuard {
        probe_va(
            image,
            descriptor.cast_guard_os_determined_failure_mode(),
            options.include_headers,
            LoadConfigError::InvalidCastGuardVa,
            &mut details.errors,
        );
    }
    if version >= LoadConfigVersion::MemcpyGuard {
        probe_va(
            image,
            descriptor.guard_memcpy_function_pointer(),
            options.include_headers,
            LoadConfigError::InvalidMemcpyFunctionVa,
            &mut details.errors,
        );
    }

    Ok(Some(details))
}

fn read_prefix<T: crate::packed::PackedRecord>(
    image: &Image,
    rva: u32,
    until_size: usize,
    options: &LoadConfigLoadOptions,
) -> Result<PackedStruct<T>> {
    use crate::buffer::InputCursor;
    let raw = byte_vector_from_rva(
        image,
        rva,
        until_size.min(packed_size_of::<T>()),
        options.include_headers,
        options.allow_virtual_data,
    )?;
    let buffer = crate::buffer::RefBuffer::from_vec(
        raw.as_slice().to_vec(),
        raw.state().absolute_offset(),
        raw.state().relative_offset(),
    );
    let mut cursor = InputCursor::new(&buffer);
    PackedStruct::read_from_until(&mut cursor, until_size, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::data_directories::{DataDirectory, DirectoryType};
    use crate::image::{Image, ImageLoadOptions};
    use crate::test_fixtures::{SectionSpec, TEST_IMAGE_BASE_64, synthetic_image_bytes};
    use scroll::Pwrite;

    const CFG_RVA: u32 = 0x2000;

    #[test]
    fn version_ladder_is_monotonic() {
        let stamps = version_ladder!(LoadConfigDirectory64);
        for pair in stamps.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{:?} vs {:?}", pair[0], pair[1]);
        }
        assert_eq!(
            version_from_size(packed_size_of::<LoadConfigDirectory64>(), true),
            (LoadConfigVersion::MemcpyGuard, true)
        );
        let (base, exact) =
            version_from_size(offset_of!(LoadConfigDirectory64, se_handler_table), true);
        assert_eq!(base, LoadConfigVersion::Base);
        assert!(exact);
        let (seh, exact) = version_from_size(
            offset_of!(LoadConfigDirectory64, guard_cf_check_function_pointer) + 1,
            true,
        );
        assert_eq!(seh, LoadConfigVersion::Seh);
        assert!(!exact);
    }

    /// `.rdata` with a full-size 64-bit load config, a sorted (or not) CF
    /// guard table with a 1-byte stride, and EH continuation targets.
    fn cfg_image(sorted: bool) -> Image {
        let mut data = vec![0u8; 0x800];
        let guard_table_rva = CFG_RVA + 0x400;
        let ehcont_rva = CFG_RVA + 0x440;
        let cfg = LoadConfigDirectory64 {
            size: packed_size_of::<LoadConfigDirectory64>() as u32,
            security_cookie: TEST_IMAGE_BASE_64 + u64::from(CFG_RVA) + 0x700,
            guard_cf_function_table: TEST_IMAGE_BASE_64 + u64::from(guard_table_rva),
            guard_cf_function_count: 3,
            guard_flags: IMAGE_GUARD_CF_INSTRUMENTED
                | IMAGE_GUARD_CF_FUNCTION_TABLE_PRESENT
                | (1 << IMAGE_GUARD_CF_FUNCTION_TABLE_SIZE_SHIFT),
            guard_eh_continuation_table: TEST_IMAGE_BASE_64 + u64::from(ehcont_rva),
            guard_eh_continuation_count: 2,
            ..LoadConfigDirectory64::default()
        };
        data.pwrite_with(cfg, 0, scroll::LE).unwrap();

        // CF guard entries: rva u32 + 1 stride byte (XFG-less).
        let rvas: [u32; 3] = if sorted {
            [0x1000, 0x1100, 0x1200]
        } else {
            [0x1000, 0x1200, 0x1100]
        };
        let mut offset = 0x400usize;
        for (i, rva) in rvas.iter().enumerate() {
            data.pwrite_with(*rva, offset, scroll::LE).unwrap();
            data[offset + 4] = i as u8;
            offset += 5;
        }
        // Sorted EH continuation targets, same stride.
        let mut offset = 0x440usize;
        for rva in [0x1010u32, 0x1020] {
            data.pwrite_with(rva, offset, scroll::LE).unwrap();
            offset += 5;
        }

        let bytes = synthetic_image_bytes(
            true,
            &[
                SectionSpec::new(".text", 0x1000, 0x1000, vec![0x90; 0x1000]),
                SectionSpec::new(".rdata", CFG_RVA, 0x800, data),
            ],
            &[(
                DirectoryType::LoadConfig as usize,
                DataDirectory {
                    virtual_address: CFG_RVA,
                    size: 0x140,
                },
            )],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    #[test]
    fn loads_guard_tables_with_stride() {
        let image = cfg_image(true);
        let config = load(&image, &LoadConfigLoadOptions::default()).unwrap().unwrap();
        assert_eq!(config.version, LoadConfigVersion::MemcpyGuard);
        assert_eq!(config.descriptor.guard_table_stride(), 1);
        assert_eq!(config.guard_cf_functions.len(), 3);
        assert_eq!(config.guard_cf_functions[1].rva, 0x1100);
        assert_eq!(config.guard_cf_functions[1].extra, vec![1]);
        assert_eq!(config.eh_continuation_targets.len(), 2);
        assert!(!config.errors.has_error(LoadConfigError::UnsortedGuardCfFunctionTable));
        assert!(!config.errors.has_error(LoadConfigError::InvalidSecurityCookieVa));
        assert!(!config.errors.has_error(LoadConfigError::SizeDoesNotMatchVersion));
    }

    #[test]
    fn unsorted_guard_table_is_diagnosed() {
        let image = cfg_image(false);
        let config = load(&image, &LoadConfigLoadOptions::default()).unwrap().unwrap();
        assert!(config.errors.has_error(LoadConfigError::UnsortedGuardCfFunctionTable));
    }

    #[test]
    fn truncated_directory_gets_an_older_version() {
        let mut data = vec![0u8; 0x200];
        let seh_size = offset_of!(LoadConfigDirectory64, guard_cf_check_function_pointer);
        let cfg = LoadConfigDirectory64 {
            size: seh_size as u32,
            ..LoadConfigDirectory64::default()
        };
        data.pwrite_with(cfg, 0, scroll::LE).unwrap();
        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".rdata", CFG_RVA, 0x200, data)],
            &[(
                DirectoryType::LoadConfig as usize,
                DataDirectory {
                    virtual_address: CFG_RVA,
                    size: seh_size as u32,
                },
            )],
        );
        let image =
            Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap();
        let config = load(&image, &LoadConfigLoadOptions::default()).unwrap().unwrap();
        assert_eq!(config.version, LoadConfigVersion::Seh);
        assert!(!config.errors.has_error(LoadConfigError::SizeDoesNotMatchVersion));
        match &config.descriptor {
            LoadConfigDescriptor::Config64(d) => {
                assert!(d.is_virtual());
                assert_eq!(d.physical_size(), seh_size);
            }
            LoadConfigDescriptor::Config32(_) => panic!("expected the 64-bit variant"),
        }
    }

    #[test]
    fn enclave_and_volatile_metadata_roundtrip() {
        let mut data = vec![0u8; 0x800];
        let enclave_rva = CFG_RVA + 0x300;
        let volatile_rva = CFG_RVA + 0x500;
        let import_rva = CFG_RVA + 0x400;
        let cfg = LoadConfigDirectory64 {
            size: packed_size_of::<LoadConfigDirectory64>() as u32,
            enclave_configuration_pointer: TEST_IMAGE_BASE_64 + u64::from(enclave_rva),
            volatile_metadata_pointer: TEST_IMAGE_BASE_64 + u64::from(volatile_rva),
            ..LoadConfigDirectory64::default()
        };
        data.pwrite_with(cfg, 0, scroll::LE).unwrap();

        // Enclave config: one import.
        let mut pos = 0x300usize;
        for value in [0x50u32, 0x50, 0x1, 1, import_rva, 80] {
            data.pwrite_with(value, pos, scroll::LE).unwrap();
            pos += 4;
        }
        pos += 32; // family + image ids
        data.pwrite_with(2u32, pos, scroll::LE).unwrap(); // image_version
        data.pwrite_with(3u32, pos + 4, scroll::LE).unwrap(); // security_version
        data.pwrite_with(0x10_0000u64, pos + 8, scroll::LE).unwrap(); // enclave_size
        data.pwrite_with(4u32, pos + 16, scroll::LE).unwrap(); // threads
        data.pwrite_with(1u32, pos + 20, scroll::LE).unwrap(); // flags
        let import = ImageEnclaveImport {
            match_type: 1,
            import_name: CFG_RVA + 0x480,
            ..ImageEnclaveImport::default()
        };
        data.pwrite_with(import, 0x400, scroll::LE).unwrap();
        data[0x480..0x48C].copy_from_slice(b"enclave.dll\0");

        // Volatile metadata: two access RVAs, one range.
        let volatile = ImageVolatileMetadata {
            size: 24,
            version: 1,
            volatile_access_table: CFG_RVA + 0x540,
            volatile_access_table_size: 8,
            volatile_info_range_table: CFG_RVA + 0x560,
            volatile_info_range_table_size: 8,
        };
        data.pwrite_with(volatile, 0x500, scroll::LE).unwrap();
        data.pwrite_with(0x1111u32, 0x540, scroll::LE).unwrap();
        data.pwrite_with(0x2222u32, 0x544, scroll::LE).unwrap();
        data.pwrite_with(
            VolatileInfoRange { rva: 0x1000, size: 0x100 },
            0x560,
            scroll::LE,
        )
        .unwrap();

        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".rdata", CFG_RVA, 0x800, data)],
            &[(
                DirectoryType::LoadConfig as usize,
                DataDirectory {
                    virtual_address: CFG_RVA,
                    size: 0x140,
                },
            )],
        );
        let image =
            Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap();
        let config = load(&image, &LoadConfigLoadOptions::default()).unwrap().unwrap();

        let enclave = config.enclave_config.as_ref().unwrap();
        assert_eq!(enclave.number_of_imports, 1);
        assert_eq!(enclave.enclave_size, 0x10_0000);
        assert_eq!(enclave.imports.len(), 1);
        assert_eq!(
            enclave.imports[0].name.as_ref().unwrap().as_str(),
            "enclave.dll"
        );

        let volatile = config.volatile_metadata.as_ref().unwrap();
        assert_eq!(volatile.access_rvas, vec![0x1111, 0x2222]);
        assert_eq!(volatile.info_ranges.len(), 1);
        assert_eq!(volatile.info_ranges[0].size, 0x100);
    }
}
