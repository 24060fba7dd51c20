//! # kobold
//!
//! A mischievous PE32/PE32+ parsing, editing, and rebuilding crate.
//!
//! `kobold` decodes a Portable Executable into an owning [`image::Image`]
//! model, lets you pick apart every data directory with a dedicated loader,
//! edit the result, and serialize it back byte-accurately where the source
//! was well formed.
//!
//! Parsing is layered:
//!
//! 1. [`buffer`] — random-access byte sources and sinks with explicit
//!    "virtual" (beyond physical end) semantics.
//! 2. [`packed`] — endian-aware wrappers that carry each decoded value
//!    together with its provenance (file offset, RVA, physical size).
//! 3. [`image`] — the owning aggregate: headers, data directories, section
//!    table, section bytes, overlay; plus address conversion, typed
//!    accessors, and the rebuilder.
//! 4. Directory loaders — [`export`], [`import`], [`delay_import`],
//!    [`bound_import`], [`relocation`], [`exception`], [`exception_arm`],
//!    [`tls`], [`load_config`], [`dynreloc`], [`resource`], [`debug`],
//!    [`clr`], [`rich`], [`trustlet`]. Each takes `&Image` plus options and
//!    returns an owned result carrying both decoded content and a list of
//!    non-fatal diagnostics.
//!
//! # Example
//!
//! ```no_run
//! use kobold::buffer::InputMemoryBuffer;
//! use kobold::image::{Image, ImageLoadOptions};
//!
//! let bytes = std::fs::read("foo.dll").unwrap();
//! let buffer = InputMemoryBuffer::from_vec(bytes);
//! let image = Image::load(&buffer, &ImageLoadOptions::default()).unwrap();
//! if let Some(exports) =
//!     kobold::export::load(&image, &kobold::export::ExportLoadOptions::default()).unwrap()
//! {
//!     for symbol in &exports.symbols {
//!         println!("{:#x?}", symbol);
//!     }
//! }
//! ```

pub mod error;

pub mod buffer;
pub mod error_list;
pub mod packed;
pub mod utils;

pub mod data_directories;
pub mod header;
pub mod optional_header;
pub mod section_table;

pub mod image;

pub mod bound_import;
pub mod clr;
pub mod debug;
pub mod delay_import;
pub mod dynreloc;
pub mod exception;
pub mod exception_arm;
pub mod export;
pub mod import;
pub mod load_config;
pub mod relocation;
pub mod resource;
pub mod rich;
pub mod tls;
pub mod trustlet;

pub use crate::error::{Error, Result};

#[cfg(test)]
pub(crate) mod test_fixtures;
