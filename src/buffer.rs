//! Random-access byte sources and sinks.
//!
//! Everything a PE parser reads comes through an [`InputBuffer`]: a
//! random-access view with two bookkeeping offsets. `absolute_offset` maps a
//! position back to the underlying file; `relative_offset` maps it back to
//! the containing logical region (for section data that region is the
//! section, and the relative offset is its RVA). Short reads are legal and
//! signal a *virtual tail*: bytes that a structure logically covers but that
//! are not physically present in the file.
//!
//! [`RefBuffer`] is the owning side of the story: it either shares an
//! [`InputMemoryBuffer`] window (cheap, no bytes copied) or owns a private
//! copy. Mutation requires promoting to the owned state first via
//! [`RefBuffer::copy_referenced_buffer`].

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A random-access byte source.
///
/// `read_at` returns the number of bytes actually copied, which may be less
/// than `out.len()`; it never fails. Interpreting a short read as an error or
/// as a virtual tail is the caller's policy decision.
pub trait InputBuffer {
    /// Number of physically present bytes.
    fn size(&self) -> usize;
    /// Copies up to `out.len()` bytes starting at `pos`, returning the count copied.
    fn read_at(&self, pos: usize, out: &mut [u8]) -> usize;
    /// Byte offset of position 0 from the start of the underlying source.
    fn absolute_offset(&self) -> usize;
    /// Byte offset of position 0 from the start of the containing logical region.
    fn relative_offset(&self) -> usize;
}

/// A cheaply cloneable window over shared immutable bytes.
#[derive(Debug, Clone)]
pub struct InputMemoryBuffer {
    data: Arc<[u8]>,
    start: usize,
    len: usize,
    absolute_offset: usize,
    relative_offset: usize,
}

impl InputMemoryBuffer {
    /// Wraps `data` as a buffer starting at source offset 0.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        InputMemoryBuffer {
            data: data.into(),
            start: 0,
            len,
            absolute_offset: 0,
            relative_offset: 0,
        }
    }

    /// Reads the remainder of a seekable stream into a buffer.
    ///
    /// The stream's current position becomes the buffer's absolute offset.
    pub fn from_reader<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let absolute_offset = reader.stream_position()? as usize;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let len = data.len();
        Ok(InputMemoryBuffer {
            data: data.into(),
            start: 0,
            len,
            absolute_offset,
            relative_offset: 0,
        })
    }

    /// Returns a reduced view over `[offset, offset + len)` with both
    /// bookkeeping offsets advanced by `offset`. No bytes are copied.
    pub fn reduce(&self, offset: usize, len: usize) -> Result<Self> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::Malformed(format!("buffer window overflows: {offset:#x}+{len:#x}")))?;
        if end > self.len {
            return Err(Error::BufferOverrun {
                offset,
                wanted: len,
                available: self.len.saturating_sub(offset.min(self.len)),
            });
        }
        Ok(InputMemoryBuffer {
            data: Arc::clone(&self.data),
            start: self.start + offset,
            len,
            absolute_offset: self.absolute_offset + offset,
            relative_offset: self.relative_offset + offset,
        })
    }

    /// Replaces the relative offset, e.g. to make positions report RVAs.
    pub fn with_relative_offset(mut self, relative_offset: usize) -> Self {
        self.relative_offset = relative_offset;
        self
    }

    /// The physically present bytes of this window.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }
}

impl InputBuffer for InputMemoryBuffer {
    fn size(&self) -> usize {
        self.len
    }

    fn read_at(&self, pos: usize, out: &mut [u8]) -> usize {
        if pos >= self.len {
            return 0;
        }
        let count = out.len().min(self.len - pos);
        let src = &self.data[self.start + pos..self.start + pos + count];
        out[..count].copy_from_slice(src);
        count
    }

    fn absolute_offset(&self) -> usize {
        self.absolute_offset
    }

    fn relative_offset(&self) -> usize {
        self.relative_offset
    }
}

/// A stateful reader over any [`InputBuffer`].
pub struct InputCursor<'a> {
    buffer: &'a dyn InputBuffer,
    rpos: usize,
}

impl<'a> InputCursor<'a> {
    pub fn new(buffer: &'a dyn InputBuffer) -> Self {
        InputCursor { buffer, rpos: 0 }
    }

    pub fn at(buffer: &'a dyn InputBuffer, rpos: usize) -> Self {
        InputCursor { buffer, rpos }
    }

    pub fn buffer(&self) -> &'a dyn InputBuffer {
        self.buffer
    }

    pub fn rpos(&self) -> usize {
        self.rpos
    }

    pub fn set_rpos(&mut self, rpos: usize) {
        self.rpos = rpos;
    }

    pub fn advance_rpos(&mut self, count: usize) {
        self.rpos += count;
    }

    /// Reads up to `out.len()` bytes at the cursor, advancing by the amount read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let read = self.buffer.read_at(self.rpos, out);
        self.rpos += read;
        read
    }

    /// Bytes physically remaining past the cursor.
    pub fn remaining(&self) -> usize {
        self.buffer.size().saturating_sub(self.rpos)
    }
}

#[derive(Debug, Clone)]
enum RefBufferState {
    Shared(InputMemoryBuffer),
    Owned {
        data: Vec<u8>,
        absolute_offset: usize,
        relative_offset: usize,
    },
}

/// A byte region that either references shared storage or owns a copy.
///
/// Cloning a shared `RefBuffer` does not copy bytes. Mutable access promotes
/// to the owned state, after which the copy is fully independent.
#[derive(Debug, Clone)]
pub struct RefBuffer {
    state: RefBufferState,
}

impl Default for RefBuffer {
    fn default() -> Self {
        RefBuffer {
            state: RefBufferState::Owned {
                data: Vec::new(),
                absolute_offset: 0,
                relative_offset: 0,
            },
        }
    }
}

impl RefBuffer {
    /// Wraps an input window, copying its bytes eagerly iff `copy_memory`.
    pub fn from_input(buffer: InputMemoryBuffer, copy_memory: bool) -> Self {
        let mut this = RefBuffer {
            state: RefBufferState::Shared(buffer),
        };
        if copy_memory {
            this.copy_referenced_buffer();
        }
        this
    }

    /// Creates an owned buffer from raw bytes and bookkeeping offsets.
    pub fn from_vec(data: Vec<u8>, absolute_offset: usize, relative_offset: usize) -> Self {
        RefBuffer {
            state: RefBufferState::Owned {
                data,
                absolute_offset,
                relative_offset,
            },
        }
    }

    pub fn is_copied(&self) -> bool {
        matches!(self.state, RefBufferState::Owned { .. })
    }

    /// Materializes a private copy of the referenced bytes. No-op when owned.
    pub fn copy_referenced_buffer(&mut self) {
        if let RefBufferState::Shared(buffer) = &self.state {
            self.state = RefBufferState::Owned {
                data: buffer.as_slice().to_vec(),
                absolute_offset: buffer.absolute_offset(),
                relative_offset: buffer.relative_offset(),
            };
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.state {
            RefBufferState::Shared(buffer) => buffer.as_slice(),
            RefBufferState::Owned { data, .. } => data,
        }
    }

    /// Mutable access to the bytes, promoting to the owned state first.
    pub fn make_mut(&mut self) -> &mut [u8] {
        self.copy_referenced_buffer();
        match &mut self.state {
            RefBufferState::Owned { data, .. } => data,
            RefBufferState::Shared(_) => unreachable!("promoted above"),
        }
    }

    /// Writes `[offset, offset + size)` of this buffer to `out` at its
    /// current write position. `size` beyond the physical end fails.
    pub fn serialize_until(
        &self,
        out: &mut dyn OutputBuffer,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        let bytes = self.as_slice();
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::Malformed(format!("serialize window overflows: {offset:#x}+{size:#x}")))?;
        if end > bytes.len() {
            return Err(Error::BufferOverrun {
                offset,
                wanted: size,
                available: bytes.len().saturating_sub(offset.min(bytes.len())),
            });
        }
        out.write(&bytes[offset..end])
    }

    /// Writes the whole physical contents to `out`.
    pub fn serialize(&self, out: &mut dyn OutputBuffer) -> Result<()> {
        out.write(self.as_slice())
    }
}

impl InputBuffer for RefBuffer {
    fn size(&self) -> usize {
        self.as_slice().len()
    }

    fn read_at(&self, pos: usize, out: &mut [u8]) -> usize {
        let bytes = self.as_slice();
        if pos >= bytes.len() {
            return 0;
        }
        let count = out.len().min(bytes.len() - pos);
        out[..count].copy_from_slice(&bytes[pos..pos + count]);
        count
    }

    fn absolute_offset(&self) -> usize {
        match &self.state {
            RefBufferState::Shared(buffer) => buffer.absolute_offset(),
            RefBufferState::Owned {
                absolute_offset, ..
            } => *absolute_offset,
        }
    }

    fn relative_offset(&self) -> usize {
        match &self.state {
            RefBufferState::Shared(buffer) => buffer.relative_offset(),
            RefBufferState::Owned {
                relative_offset, ..
            } => *relative_offset,
        }
    }
}

/// A random-access byte sink with a movable write position.
pub trait OutputBuffer {
    /// Appends `data` at the write position, extending the sink if needed.
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn wpos(&mut self) -> usize;
    /// Moves the write position; positions past the end are legal and
    /// zero-fill on the next write.
    fn set_wpos(&mut self, wpos: usize) -> Result<()>;
    fn advance_wpos(&mut self, count: usize) -> Result<()> {
        let wpos = self.wpos();
        self.set_wpos(wpos + count)
    }
}

/// A growable in-memory sink.
#[derive(Debug, Default)]
pub struct OutputMemoryBuffer {
    data: Vec<u8>,
    wpos: usize,
}

impl OutputMemoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl OutputBuffer for OutputMemoryBuffer {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let end = self.wpos + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.wpos..end].copy_from_slice(data);
        self.wpos = end;
        Ok(())
    }

    fn wpos(&mut self) -> usize {
        self.wpos
    }

    fn set_wpos(&mut self, wpos: usize) -> Result<()> {
        self.wpos = wpos;
        Ok(())
    }
}

/// A sink over any `Write + Seek` stream.
pub struct OutputStreamBuffer<W: Write + Seek> {
    inner: W,
}

impl<W: Write + Seek> OutputStreamBuffer<W> {
    pub fn new(inner: W) -> Self {
        OutputStreamBuffer { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Seek> OutputBuffer for OutputStreamBuffer<W> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        Ok(())
    }

    fn wpos(&mut self) -> usize {
        // Seek failure on tell is not representable here; treat as position 0.
        self.inner.stream_position().map(|p| p as usize).unwrap_or(0)
    }

    fn set_wpos(&mut self, wpos: usize) -> Result<()> {
        self.inner.seek(SeekFrom::Start(wpos as u64))?;
        Ok(())
    }
}
