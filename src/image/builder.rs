//! Serializes an [`Image`] back to a byte sink at its original offsets.

use log::debug;

use crate::buffer::{InputBuffer, OutputBuffer};
use crate::error::{Error, Result};
use crate::header::{SIZEOF_COFF_HEADER, SIZEOF_IMAGE_SIGNATURE};
use crate::image::Image;

/// Options governing image serialization.
#[derive(Debug, Copy, Clone)]
pub struct ImageBuildOptions {
    /// Emit virtual (physically absent) tails of packed structures as zeros.
    pub write_virtual_part: bool,
    /// Copy bytes from the captured header region into the gaps between
    /// serialized structures instead of leaving them zero.
    pub fill_full_headers_data_gaps: bool,
    /// Append the overlay at its original offset.
    pub write_overlay: bool,
}

impl Default for ImageBuildOptions {
    fn default() -> Self {
        ImageBuildOptions {
            write_virtual_part: true,
            fill_full_headers_data_gaps: true,
            write_overlay: true,
        }
    }
}

fn seek_filling_gap(
    image: &Image,
    out: &mut dyn OutputBuffer,
    target: usize,
    fill: bool,
) -> Result<()> {
    let wpos = out.wpos();
    if fill && wpos < target {
        let headers = image.full_headers_buffer.as_slice();
        let end = target.min(headers.len());
        if wpos < end {
            out.write(&headers[wpos..end])?;
        }
    }
    out.set_wpos(target)
}

/// Writes the image to `out`, headers first, then each section's raw bytes
/// at its raw pointer, then the overlay.
pub fn build_image(image: &Image, out: &mut dyn OutputBuffer, options: &ImageBuildOptions) -> Result<()> {
    if image.section_table.len() != image.section_data.len() {
        return Err(Error::Malformed(
            "inconsistent section headers and data".into(),
        ));
    }

    out.set_wpos(0)?;
    image.dos_header.write_to(out, options.write_virtual_part)?;
    image.dos_stub.serialize(out)?;

    let e_lfanew = image.dos_header.pe_pointer as usize;
    seek_filling_gap(image, out, e_lfanew, options.fill_full_headers_data_gaps)?;

    image.image_signature.write_to(out, options.write_virtual_part)?;
    image.file_header.write_to(out, options.write_virtual_part)?;

    let optional_header_offset = out.wpos();
    image
        .optional_header
        .write_to(out, options.write_virtual_part)?;
    let size_of_optional_header = image.file_header.size_of_optional_header as usize;
    // Data directories follow the record prefix, exactly where the loader
    // found them.
    out.set_wpos(
        optional_header_offset
            + size_of_optional_header.min(image.optional_header.packed_size()),
    )?;
    image
        .data_directories
        .write_to(out, options.write_virtual_part)?;

    if !image.section_table.is_empty() {
        let section_table_offset = e_lfanew
            .checked_add(SIZEOF_IMAGE_SIGNATURE)
            .and_then(|o| o.checked_add(SIZEOF_COFF_HEADER))
            .and_then(|o| o.checked_add(size_of_optional_header))
            .ok_or_else(|| Error::Malformed("invalid section table offset".into()))?;
        seek_filling_gap(
            image,
            out,
            section_table_offset,
            options.fill_full_headers_data_gaps,
        )?;
        for header in &image.section_table {
            header.write_to(out, options.write_virtual_part)?;
        }
        let size_of_headers = image.optional_header.size_of_headers() as usize;
        if out.wpos() < size_of_headers {
            seek_filling_gap(image, out, size_of_headers, options.fill_full_headers_data_gaps)?;
        }
    }

    for (header, data) in image.section_table.iter().zip(&image.section_data) {
        if data.as_slice().is_empty() {
            continue;
        }
        let target = if image.loaded_to_memory {
            header.virtual_address as usize
        } else {
            header.pointer_to_raw_data as usize
        };
        debug!(
            "writing section {:?}: {:#x} bytes at {:#x}",
            header.name(),
            data.as_slice().len(),
            target
        );
        out.set_wpos(target)?;
        data.serialize(out)?;
    }

    if options.write_overlay && !image.overlay.as_slice().is_empty() {
        out.set_wpos(image.overlay.absolute_offset())?;
        image.overlay.serialize(out)?;
    }

    Ok(())
}
