//! The .NET (COM descriptor / COR20) directory.

use log::debug;

use scroll::{Pread, Pwrite, SizeWith};

use crate::data_directories::DataDirectory;
use crate::error::Result;
use crate::error_list::{ErrorList, error_codes};
use crate::image::Image;
use crate::image::accessor::{byte_vector_from_rva, struct_from_rva};
use crate::packed::{PackedStruct, packed_size_of};

/// Metadata root signature (`BSJB`).
pub const DOTNET_SIGNATURE: u32 = 0x424A_5342;

/// `COMIMAGE_FLAGS_ILONLY`
pub const COMIMAGE_FLAGS_ILONLY: u32 = 0x0000_0001;
/// `COMIMAGE_FLAGS_32BITREQUIRED`
pub const COMIMAGE_FLAGS_32BITREQUIRED: u32 = 0x0000_0002;
/// `COMIMAGE_FLAGS_IL_LIBRARY`
pub const COMIMAGE_FLAGS_IL_LIBRARY: u32 = 0x0000_0004;
/// `COMIMAGE_FLAGS_STRONGNAMESIGNED`
pub const COMIMAGE_FLAGS_STRONGNAMESIGNED: u32 = 0x0000_0008;
/// `COMIMAGE_FLAGS_NATIVE_ENTRYPOINT`
pub const COMIMAGE_FLAGS_NATIVE_ENTRYPOINT: u32 = 0x0000_0010;
/// `COMIMAGE_FLAGS_TRACKDEBUGDATA`
pub const COMIMAGE_FLAGS_TRACKDEBUGDATA: u32 = 0x0001_0000;
/// `COMIMAGE_FLAGS_32BITPREFERRED`
pub const COMIMAGE_FLAGS_32BITPREFERRED: u32 = 0x0002_0000;

/// `IMAGE_COR20_HEADER`
#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
#[doc(alias("IMAGE_COR20_HEADER"))]
pub struct ImageCor20Header {
    /// Size of this header.
    pub cb: u32,
    pub major_runtime_version: u16,
    pub minor_runtime_version: u16,
    /// The metadata root.
    pub metadata: DataDirectory,
    pub flags: u32,
    /// Managed entry-point token, or a native entry RVA when
    /// [`COMIMAGE_FLAGS_NATIVE_ENTRYPOINT`] is set.
    pub entry_point_token_or_rva: u32,
    pub resources: DataDirectory,
    pub strong_name_signature: DataDirectory,
    pub code_manager_table: DataDirectory,
    pub vtable_fixups: DataDirectory,
    pub export_address_table_jumps: DataDirectory,
    pub managed_native_header: DataDirectory,
}

error_codes! {
    /// .NET directory diagnostics.
    pub enum ClrError("dotnet_loader") {
        InvalidDescriptorSize => "COR20 header size field does not match the structure",
        InvalidMetadataSignature => "Metadata root signature is not BSJB",
        InvalidMetadataRoot => "Metadata root cannot be read",
        InvalidVersionLength => "Metadata version length is zero or not 4-byte aligned",
        InvalidStreamHeader => "Metadata stream header cannot be read",
        TooManyStreams => "Number of metadata streams exceeds the configured limit",
    }
}

/// Options for [`load`].
#[derive(Debug, Copy, Clone)]
pub struct ClrLoadOptions {
    pub include_headers: bool,
    pub allow_virtual_data: bool,
    /// Decode the metadata root behind [`ImageCor20Header::metadata`].
    pub parse_metadata: bool,
    pub max_number_of_streams: u16,
}

impl Default for ClrLoadOptions {
    fn default() -> Self {
        ClrLoadOptions {
            include_headers: true,
            allow_virtual_data: true,
            parse_metadata: true,
            max_number_of_streams: 0x100,
        }
    }
}

/// One stream header of the metadata root.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataStreamHeader {
    /// Offset relative to the metadata root.
    pub offset: u32,
    pub size: u32,
    /// Stream name (`#~`, `#Strings`, ...).
    pub name: String,
}

/// The decoded `BSJB` metadata root.
#[derive(Debug, Clone, Default)]
pub struct MetadataRoot {
    pub signature: u32,
    pub major_version: u16,
    pub minor_version: u16,
    /// The runtime version string (`v4.0.30319`, ...).
    pub version: String,
    pub flags: u16,
    pub streams: Vec<MetadataStreamHeader>,
}

/// The decoded .NET directory.
#[derive(Debug, Clone, Default)]
pub struct ClrDirectoryDetails {
    pub descriptor: PackedStruct<ImageCor20Header>,
    pub metadata_root: Option<MetadataRoot>,
    pub errors: ErrorList<ClrError>,
}

impl ClrDirectoryDetails {
    pub fn is_il_only(&self) -> bool {
        self.descriptor.flags & COMIMAGE_FLAGS_ILONLY != 0
    }
}

fn parse_metadata_root(
    image: &Image,
    metadata: DataDirectory,
    options: &ClrLoadOptions,
    errors: &mut ErrorList<ClrError>,
) -> Option<MetadataRoot> {
    let raw = byte_vector_from_rva(
        image,
        metadata.virtual_address,
        metadata.size as usize,
        options.include_headers,
        options.allow_virtual_data,
    )
    .ok()?;
    let bytes = raw.as_slice();

    let mut offset = 0usize;
    let signature = bytes.gread_with::<u32>(&mut offset, scroll::LE).ok()?;
    if signature != DOTNET_SIGNATURE {
        errors.add_error(ClrError::InvalidMetadataSignature);
        return None;
    }
    let major_version = bytes.gread_with::<u16>(&mut offset, scroll::LE).ok()?;
    let minor_version = bytes.gread_with::<u16>(&mut offset, scroll::LE).ok()?;
    let _reserved = bytes.gread_with::<u32>(&mut offset, scroll::LE).ok()?;
    let version_length = bytes.gread_with::<u32>(&mut offset, scroll::LE).ok()? as usize;
    if version_length == 0 || version_length % 4 != 0 {
        errors.add_error(ClrError::InvalidVersionLength);
        return None;
    }
    let version_bytes = bytes.get(offset..offset + version_length)?;
    let version_end = version_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(version_length);
    let version = String::from_utf8_lossy(&version_bytes[..version_end]).into_owned();
    offset += version_length;

    let flags = bytes.gread_with::<u16>(&mut offset, scroll::LE).ok()?;
    let mut stream_count = bytes.gread_with::<u16>(&mut offset, scroll::LE).ok()?;
    if stream_count > options.max_number_of_streams {
        errors.add_error(ClrError::TooManyStreams);
        stream_count = options.max_number_of_streams;
    }

    let mut root = MetadataRoot {
        signature,
        major_version,
        minor_version,
        version,
        flags,
        streams: Vec::with_capacity(usize::from(stream_count)),
    };
    for _ in 0..stream_count {
        let Ok(stream_offset) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
            errors.add_error(ClrError::InvalidStreamHeader);
            break;
        };
        let Ok(stream_size) = bytes.gread_with::<u32>(&mut offset, scroll::LE) else {
            errors.add_error(ClrError::InvalidStreamHeader);
            break;
        };
        // The name is NUL-terminated and padded to a 4-byte boundary.
        let name_start = offset;
        let mut name_end = offset;
        while name_end < bytes.len() && bytes[name_end] != 0 {
            name_end += 1;
        }
        if name_end >= bytes.len() {
            errors.add_error(ClrError::InvalidStreamHeader);
            break;
        }
        let name = String::from_utf8_lossy(&bytes[name_start..name_end]).into_owned();
        offset = name_start + crate::utils::align_up(name_end - name_start + 1, 4);
        root.streams.push(MetadataStreamHeader {
            offset: stream_offset,
            size: stream_size,
            name,
        });
    }
    Some(root)
}

/// Loads the .NET directory, or `None` when the image has none.
pub fn load(image: &Image, options: &ClrLoadOptions) -> Result<Option<ClrDirectoryDetails>> {
    let Some(dir) = image
        .data_directories
        .get_directory(crate::data_directories::DirectoryType::ComDescriptor)
        .filter(|d| d.virtual_address != 0)
        .map(|d| **d)
    else {
        return Ok(None);
    };

    let mut details = ClrDirectoryDetails {
        descriptor: struct_from_rva(
            image,
            dir.virtual_address,
            options.include_headers,
            options.allow_virtual_data,
        )?,
        ..ClrDirectoryDetails::default()
    };
    if (details.descriptor.cb as usize) < packed_size_of::<ImageCor20Header>() {
        details.errors.add_error(ClrError::InvalidDescriptorSize);
    }
    debug!(
        "cor20 header: runtime {}.{}, flags {:#x}",
        details.descriptor.major_runtime_version,
        details.descriptor.minor_runtime_version,
        details.descriptor.flags
    );

    let metadata = details.descriptor.metadata;
    if options.parse_metadata && metadata.virtual_address != 0 && metadata.size != 0 {
        details.metadata_root = parse_metadata_root(image, metadata, options, &mut details.errors);
        if details.metadata_root.is_none() && !details.errors.has_errors() {
            details.errors.add_error(ClrError::InvalidMetadataRoot);
        }
    }

    Ok(Some(details))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::InputMemoryBuffer;
    use crate::data_directories::DirectoryType;
    use crate::image::ImageLoadOptions;
    use crate::test_fixtures::{SectionSpec, synthetic_image_bytes};
    use scroll::Pwrite;

    const CLR_RVA: u32 = 0x2000;

    fn clr_image() -> Image {
        let mut data = vec![0u8; 0x400];
        let header = ImageCor20Header {
            cb: packed_size_of::<ImageCor20Header>() as u32,
            major_runtime_version: 2,
            minor_runtime_version: 5,
            metadata: DataDirectory {
                virtual_address: CLR_RVA + 0x100,
                size: 0x100,
            },
            flags: COMIMAGE_FLAGS_ILONLY,
            ..ImageCor20Header::default()
        };
        data.pwrite_with(header, 0, scroll::LE).unwrap();

        let mut offset = 0x100;
        data.pwrite_with(DOTNET_SIGNATURE, offset, scroll::LE).unwrap();
        offset += 4;
        data.pwrite_with(1u16, offset, scroll::LE).unwrap(); // major
        offset += 2;
        data.pwrite_with(1u16, offset, scroll::LE).unwrap(); // minor
        offset += 2;
        offset += 4; // reserved
        data.pwrite_with(12u32, offset, scroll::LE).unwrap(); // version length
        offset += 4;
        data[offset..offset + 11].copy_from_slice(b"v4.0.30319\0");
        offset += 12;
        data.pwrite_with(0u16, offset, scroll::LE).unwrap(); // flags
        offset += 2;
        data.pwrite_with(2u16, offset, scroll::LE).unwrap(); // streams
        offset += 2;
        // #~ stream
        data.pwrite_with(0x6Cu32, offset, scroll::LE).unwrap();
        data.pwrite_with(0x40u32, offset + 4, scroll::LE).unwrap();
        data[offset + 8..offset + 11].copy_from_slice(b"#~\0");
        offset += 8 + 4;
        // #Strings stream
        data.pwrite_with(0xACu32, offset, scroll::LE).unwrap();
        data.pwrite_with(0x20u32, offset + 4, scroll::LE).unwrap();
        data[offset + 8..offset + 17].copy_from_slice(b"#Strings\0");

        let bytes = synthetic_image_bytes(
            true,
            &[SectionSpec::new(".text", CLR_RVA, 0x400, data)],
            &[(
                DirectoryType::ComDescriptor as usize,
                crate::data_directories::DataDirectory {
                    virtual_address: CLR_RVA,
                    size: 0x48,
                },
            )],
        );
        Image::load(&InputMemoryBuffer::from_vec(bytes), &ImageLoadOptions::default()).unwrap()
    }

    #[test]
    fn decodes_cor20_and_metadata_root() {
        let image = clr_image();
        let clr = load(&image, &ClrLoadOptions::default()).unwrap().unwrap();
        assert!(clr.is_il_only());
        let root = clr.metadata_root.as_ref().unwrap();
        assert_eq!(root.version, "v4.0.30319");
        assert_eq!(root.streams.len(), 2);
        assert_eq!(root.streams[0].name, "#~");
        assert_eq!(root.streams[1].name, "#Strings");
        assert_eq!(root.streams[1].offset, 0xAC);
        assert!(!clr.errors.has_errors());
    }

    #[test]
    fn bad_signature_is_diagnosed() {
        let image = clr_image();
        // Corrupt the signature in a copied image.
        let mut image = image;
        let bad = PackedStruct::<u32>::new(0x1111_1111);
        crate::image::accessor::struct_to_rva(&mut image, CLR_RVA + 0x100, &bad, true, true)
            .unwrap();
        let clr = load(&image, &ClrLoadOptions::default()).unwrap().unwrap();
        assert!(clr.metadata_root.is_none());
        assert!(clr.errors.has_error(ClrError::InvalidMetadataSignature));
    }
}
