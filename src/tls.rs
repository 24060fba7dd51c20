//! The Thread Local Storage directory.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::{byte_vector_from_rva, rva_is_resolvable, struct_from_rva};
use crate::image::address::va_to_rva;
use crate::packed::{PackedByteVector, PackedStruct};

/// Mask isolating the alignment request in [`TlsDescriptor::characteristics`].
pub const TLS_CHARACTERISTICS_ALIGN_MASK: u32 = 0x00F0_0000;
/// Shift of the alignment field within the characteristics word.
pub const TLS_CHARACTERISTICS_ALIGN_SHIFT: u32 = 20;

/// `IMAGE_TLS_DIRECTORY32`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_TLS_DIRECTORY32"))]
pub struct ImageTlsDirectory32 {
    pub start_address_of_raw_data: u32,
    pub end_address_of_raw_data: u32,
    pub address_of_index: u32,
    pub address_of_callbacks: u32,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

/// `IMAGE_TLS_DIRECTORY64`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_TLS_DIRECTORY64"))]
pub struct ImageTlsDirectory64 {
    /// VA of the start of the TLS template data.
    pub start_address_of_raw_data: u64,
    /// VA one past the end of the template data.
    pub end_address_of_raw_data: u64,
    /// VA of the slot receiving the TLS index.
    pub address_of_index: u64,
    /// VA of the zero-terminated callback pointer array.
    pub address_of_callbacks: u64,
    pub size_of_zero_fill: u32,
    pub characteristics: u32,
}

/// The bitness-tagged TLS descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum TlsDescriptor {
    Tls32(PackedStruct<ImageTlsDirectory32>),
    Tls64(PackedStruct<ImageTlsDirectory64>),
}

impl TlsDescriptor {
    pub fn start_address_of_raw_data(&self) -> u64 {
        match self {
            TlsDescriptor::Tls32(d) => u64::from(d.start_address_of_raw_data),
            TlsDescriptor::Tls64(d) => d.start_address_of_raw_data,
        }
    }

    pub fn end_address_of_raw_data(&self) -> u64 {
        match self {
            TlsDescriptor::Tls32(d) => u64::from(d.end_address_of_raw_data),
            TlsDescriptor::Tls64(d) => d.end_address_of_raw_data,
        }
    }

    pub fn address_of_index(&self) -> u64 {
        match self {
            TlsDescriptor::Tls32(d) => u64::from(d.address_of_index),
            TlsDescriptor::Tls64(d) => d.address_of_index,
        }
    }

    pub fn address_of_callbacks(&self) -> u64 {
        match self {
            TlsDescriptor::Tls32(d) => u64::from(d.address_of_callbacks),
            TlsDescriptor::Tls64(d) => d.address_of_callbacks,
        }
    }

    pub fn characteristics(&self) -> u32 {
        match self {
            TlsDescriptor::Tls32(d) => d.characteristics,
            TlsDescriptor::Tls64(d) => d.characteristics,
        }
    }

    /// The requested alignment in bytes, if the characteristics declare one.
    pub fn alignment(&self) -> Option<u32> {
        let field =
            (self.characteristics() & TLS_CHARACTERISTICS_ALIGN_MASK) >> TLS_CHARACTERISTICS_ALIGN_SHIFT;
        match field {
            0 => None,
            n => Some(1 << (n - 1)),
        }
    }
}

error_codes! {
    /// TLS directory diagnostics.
    pub enum TlsError("tls_loader") {
        InvalidRawData => "TLS raw data range is invalid",
        InvalidIndexVa => "TLS index VA does not map into the image",
        InvalidCallbackVa => "TLS callback VA does not map into the image",
        TooManyCallbacks => "Number of TLS callbacks exceeds the configured limit",
        InvalidCallbackList => "TLS callback array cannot be read",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct TlsLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    /// Capture the raw template data.
    pub load_raw_data: bool,
    pub max_number_of_callbacks: u32,
}

impl Default for TlsLoadOptions {
    fn default() -> Self {
        TlsLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            load_raw_data: true,
            max_number_of_callbacks: 0x1_0000,
        }
    }
}

/// One callback pointer from the zero-terminated array.
#[derive(Debug, Clone, Default)]
pub struct TlsCallback {
    /// The callback VA, widened to 64 bits.
    pub va: PackedStruct<u64>,
    pub errors: ErrorList<TlsError>,
}

/// The decoded TLS directory.
#[derive(Debug, Clone)]
pub struct TlsDirectoryDetails {
    pub descriptor: TlsDescriptor,
    /// The template data between the start and end raw-data VAs.
    pub raw_data: Option<PackedByteVector>,
    pub callbacks: Vec<TlsCallback>,
    pub errors: ErrorList<TlsError>,
}

/// Loads the TLS directory, or `None` when the image has none.
pub fn load(image: &Image, options: &TlsLoadOptions) -> Result<Option<TlsDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::Tls)
        .filter(|d| d.virtual_address != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let descriptor = if image.is_64bit() {
        TlsDescriptor::Tls64(struct_from_rva(
            image,
            dir.virtual_address,
            options.include_headers,
            options.allow_virtual_data,
        )?)
    } else {
        TlsDescriptor::Tls32(struct_from_rva(
            image,
            dir.virtual_address,
            options.include_headers,
            options.allow_virtual_data,
        )?)
    };
    let mut details = TlsDirectoryDetails {
        descriptor,
        raw_data: None,
        callbacks: Vec::new(),
        errors: ErrorList::new(),
    };
    debug!(
        "tls directory: raw data {:#x}..{:#x}, callbacks at {:#x}",
        details.descriptor.start_address_of_raw_data(),
        details.descriptor.end_address_of_raw_data(),
        details.descriptor.address_of_callbacks()
    );

    let start = details.descriptor.start_address_of_raw_data();
    let end = details.descriptor.end_address_of_raw_data();
    if options.load_raw_data && start != 0 && end != 0 {
        if start > end {
            details.errors.add_error(TlsError::InvalidRawData);
        } else {
            match va_to_rva(image, start).and_then(|rva| {
                byte_vector_from_rva(
                    image,
                    rva,
                    (end - start) as usize,
                    options.include_headers,
                    options.allow_virtual_data,
                )
            }) {
                Ok(raw) => details.raw_data = Some(raw),
                Err(_) => details.errors.add_error(TlsError::InvalidRawData),
            }
        }
    }

    let index_va = details.descriptor.address_of_index();
    if index_va != 0
        && !va_to_rva(image, index_va)
            .is_ok_and(|rva| rva_is_resolvable(image, rva, options.include_headers))
    {
        details.errors.add_error(TlsError::InvalidIndexVa);
    }

    let callbacks_va = details.descriptor.address_of_callbacks();
    if callbacks_va != 0 {
        match va_to_rva(image, callbacks_va) {
            Err(_) => details.errors.add_error(TlsError::InvalidCallbackList),
            Ok(array_rva) => {
                let step = if image.is_64bit() { 8u32 } else { 4u32 };
                let mut index = 0u32;
                loop {
                    if index >= options.max_number_of_callbacks {
                        details.errors.add_error(TlsError::TooManyCallbacks);
                        break;
                    }
                    let entry_rva = array_rva.wrapping_add(index * step);
                    let va = if image.is_64bit() {
                        struct_from_rva::<u64>(
                            image,
                            entry_rva,
                            options.include_headers,
                            options.allow_virtual_data,
                        )
                    } else {
                        struct_from_rva::<u32>(
                            image,
                            entry_rva,
                            options.include_headers,
                            options.allow_virtual_data,
                        )
                        .map(|narrow| {
                            let mut wide = PackedStruct::<u64>::new(u64::from(*narrow));
                            wide.copy_metadata_from(narrow.state());
                            wide
                        })
                    };
                    let va = match va {
                        Ok(va) => va,
                        Err(_) => {
                            details.errors.add_error(TlsError::InvalidCallbackList);
                            break;
                        }
                    };
                    if *va == 0 {
                        break;
                    }
                    let mut callback = TlsCallback {
                        va,
                        ..TlsCallback::default()
                    };
                    if !va_to_rva(image, *callback.va)
                        .is_ok_and(|rva| rva_is_resolvable(image, rva, options.include_headers))
                    {
                        callback.errors.add_error(TlsError::InvalidCallbackVa);
                    }
                    details.callbacks.push(callback);
                    index += 1;
                }
            }
        }
    }

    Ok(Some(details))
}
