//! Provenance-carrying packed value wrappers.
//!
//! Every decoded datum remembers where it came from: its absolute offset in
//! the file, its offset within the containing logical region (the RVA for
//! section data), its position within the buffer it was read from, and how
//! many of its bytes were physically present. The latter matters because PE
//! structures may extend past the physical end of their section; the missing
//! tail is implicitly zero at load time and is called *virtual* here.
//!
//! The codec itself is `scroll`: a record is any `#[derive(Pread, Pwrite,
//! SizeWith)]` type, which gives declaration-order field traversal with
//! explicit endianness. Prefix-truncated ("until size") reads and writes are
//! layered on top with a zero-padded scratch buffer; reading up to a named
//! field is spelled `until_size(core::mem::offset_of!(T, field))` at the call
//! site.

use scroll::ctx::{SizeWith, TryFromCtx, TryIntoCtx};
use scroll::{Endian, LE, Pread, Pwrite};

use crate::buffer::{InputCursor, OutputBuffer};
use crate::error::{Error, Result};

/// A fixed-layout record usable inside [`PackedStruct`].
///
/// Satisfied by every `#[derive(Pread, Pwrite, SizeWith)]` record and by the
/// primitive integers.
pub trait PackedRecord:
    Default
    + Copy
    + for<'a> TryFromCtx<'a, Endian, Error = scroll::Error>
    + TryIntoCtx<Endian, Error = scroll::Error>
    + SizeWith<Endian>
{
}

impl<T> PackedRecord for T where
    T: Default
        + Copy
        + for<'a> TryFromCtx<'a, Endian, Error = scroll::Error>
        + TryIntoCtx<Endian, Error = scroll::Error>
        + SizeWith<Endian>
{
}

/// Packed (no padding, declaration-order) size of `T`.
pub fn packed_size_of<T: PackedRecord>() -> usize {
    T::size_with(&LE)
}

/// Where a decoded datum came from and how much of it physically existed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerializedState {
    absolute_offset: usize,
    relative_offset: usize,
    buffer_pos: usize,
    physical_size: usize,
}

impl SerializedState {
    pub(crate) fn from_cursor(cursor: &InputCursor, start: usize, physical_size: usize) -> Self {
        SerializedState {
            absolute_offset: cursor.buffer().absolute_offset() + start,
            relative_offset: cursor.buffer().relative_offset() + start,
            buffer_pos: start,
            physical_size,
        }
    }

    /// Byte offset from the start of the underlying source.
    pub fn absolute_offset(&self) -> usize {
        self.absolute_offset
    }

    /// Byte offset from the start of the containing logical region.
    pub fn relative_offset(&self) -> usize {
        self.relative_offset
    }

    /// Read position within the immediate buffer.
    pub fn buffer_pos(&self) -> usize {
        self.buffer_pos
    }

    /// Bytes actually read from physical storage.
    pub fn physical_size(&self) -> usize {
        self.physical_size
    }

    pub fn set_physical_size(&mut self, physical_size: usize) {
        self.physical_size = physical_size;
    }
}

/// A fixed-size record plus its provenance.
///
/// Dereferences to the inner value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackedStruct<T: PackedRecord> {
    value: T,
    state: SerializedState,
}

impl<T: PackedRecord> Default for PackedStruct<T> {
    fn default() -> Self {
        PackedStruct::new(T::default())
    }
}

impl<T: PackedRecord> core::ops::Deref for PackedStruct<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: PackedRecord> core::ops::DerefMut for PackedStruct<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: PackedRecord> PackedStruct<T> {
    /// Wraps a freshly built value; its full size counts as physical.
    pub fn new(value: T) -> Self {
        PackedStruct {
            value,
            state: SerializedState {
                physical_size: packed_size_of::<T>(),
                ..SerializedState::default()
            },
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn state(&self) -> &SerializedState {
        &self.state
    }

    pub fn packed_size(&self) -> usize {
        packed_size_of::<T>()
    }

    pub fn physical_size(&self) -> usize {
        self.state.physical_size
    }

    /// Whether part of the record lies beyond the physical end of storage.
    pub fn is_virtual(&self) -> bool {
        self.state.physical_size < self.packed_size()
    }

    /// Imports offsets from another datum's state, clamping the physical size
    /// to this record's packed size.
    pub fn copy_metadata_from(&mut self, other: &SerializedState) {
        self.state = *other;
        self.state.physical_size = other.physical_size.min(self.packed_size());
    }

    /// Reads a full record at the cursor in little-endian.
    pub fn read_from(cursor: &mut InputCursor, allow_virtual_data: bool) -> Result<Self> {
        Self::read_from_until_with_endian(cursor, usize::MAX, allow_virtual_data, LE)
    }

    /// Reads a prefix of at most `until_size` bytes, zero-filling the rest.
    pub fn read_from_until(
        cursor: &mut InputCursor,
        until_size: usize,
        allow_virtual_data: bool,
    ) -> Result<Self> {
        Self::read_from_until_with_endian(cursor, until_size, allow_virtual_data, LE)
    }

    /// Reads a prefix of at most `until_size` bytes with the given byte order.
    ///
    /// The cursor advances by the logical (not the physical) amount, so
    /// sequential walks stay in lockstep across virtual tails.
    pub fn read_from_until_with_endian(
        cursor: &mut InputCursor,
        until_size: usize,
        allow_virtual_data: bool,
        endian: Endian,
    ) -> Result<Self> {
        let full = packed_size_of::<T>();
        let requested = until_size.min(full);
        let start = cursor.rpos();
        let mut raw = vec![0u8; full];
        let physical = cursor.read(&mut raw[..requested]);
        if physical < requested && !allow_virtual_data {
            return Err(Error::BufferOverrun {
                offset: start,
                wanted: requested,
                available: physical,
            });
        }
        cursor.set_rpos(start + requested);
        let value = raw.pread_with::<T>(0, endian)?;
        Ok(PackedStruct {
            value,
            state: SerializedState::from_cursor(cursor, start, physical),
        })
    }

    /// Serializes the record at the sink's write position in little-endian.
    pub fn write_to(&self, out: &mut dyn OutputBuffer, write_virtual_part: bool) -> Result<usize> {
        self.write_to_until_with_endian(out, usize::MAX, write_virtual_part, LE)
    }

    /// Serializes at most `until_size` leading bytes of the record.
    pub fn write_to_until(
        &self,
        out: &mut dyn OutputBuffer,
        until_size: usize,
        write_virtual_part: bool,
    ) -> Result<usize> {
        self.write_to_until_with_endian(out, until_size, write_virtual_part, LE)
    }

    pub fn write_to_until_with_endian(
        &self,
        out: &mut dyn OutputBuffer,
        until_size: usize,
        write_virtual_part: bool,
        endian: Endian,
    ) -> Result<usize> {
        let raw = self.to_bytes_with_endian(endian)?;
        let logical = until_size.min(raw.len());
        let count = if write_virtual_part {
            logical
        } else {
            logical.min(self.state.physical_size)
        };
        out.write(&raw[..count])?;
        Ok(count)
    }

    /// The full packed byte image of the value.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_bytes_with_endian(LE)
    }

    pub fn to_bytes_with_endian(&self, endian: Endian) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; packed_size_of::<T>()];
        raw.pwrite_with(self.value, 0, endian)?;
        Ok(raw)
    }
}

/// A NUL-terminated byte string plus provenance.
///
/// When the buffer ends before the terminator, the string is still produced
/// and the NUL is recorded as virtual.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedCString {
    value: String,
    state: SerializedState,
    virtual_nul: bool,
}

impl PackedCString {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let physical_size = value.len() + 1;
        PackedCString {
            value,
            state: SerializedState {
                physical_size,
                ..SerializedState::default()
            },
            virtual_nul: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn set(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn state(&self) -> &SerializedState {
        &self.state
    }

    /// String bytes plus the terminator.
    pub fn packed_size(&self) -> usize {
        self.value.len() + 1
    }

    pub fn physical_size(&self) -> usize {
        self.state.physical_size
    }

    /// Whether the terminating NUL was absent from physical storage.
    pub fn has_virtual_nul(&self) -> bool {
        self.virtual_nul
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_nul
    }

    pub fn read_from(cursor: &mut InputCursor, allow_virtual_data: bool) -> Result<Self> {
        let start = cursor.rpos();
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        let mut virtual_nul = true;
        while cursor.read(&mut byte) == 1 {
            if byte[0] == 0 {
                virtual_nul = false;
                break;
            }
            bytes.push(byte[0]);
        }
        if virtual_nul && !allow_virtual_data {
            return Err(Error::BufferOverrun {
                offset: start,
                wanted: bytes.len() + 1,
                available: bytes.len(),
            });
        }
        let physical = bytes.len() + usize::from(!virtual_nul);
        let value = String::from_utf8_lossy(&bytes).into_owned();
        Ok(PackedCString {
            value,
            state: SerializedState::from_cursor(cursor, start, physical),
            virtual_nul,
        })
    }

    pub fn write_to(&self, out: &mut dyn OutputBuffer, write_virtual_part: bool) -> Result<usize> {
        out.write(self.value.as_bytes())?;
        let mut written = self.value.len();
        if write_virtual_part || !self.virtual_nul {
            out.write(&[0])?;
            written += 1;
        }
        Ok(written)
    }
}

/// A NUL-terminated UTF-16LE string plus provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedUtf16CString {
    value: String,
    state: SerializedState,
    virtual_nul: bool,
}

impl PackedUtf16CString {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let physical_size = (value.encode_utf16().count() + 1) * 2;
        PackedUtf16CString {
            value,
            state: SerializedState {
                physical_size,
                ..SerializedState::default()
            },
            virtual_nul: false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn state(&self) -> &SerializedState {
        &self.state
    }

    /// UTF-16 code units plus the terminator, in bytes.
    pub fn packed_size(&self) -> usize {
        (self.value.encode_utf16().count() + 1) * 2
    }

    pub fn physical_size(&self) -> usize {
        self.state.physical_size
    }

    pub fn has_virtual_nul(&self) -> bool {
        self.virtual_nul
    }

    pub fn read_from(cursor: &mut InputCursor, allow_virtual_data: bool) -> Result<Self> {
        let start = cursor.rpos();
        let mut units = Vec::new();
        let mut pair = [0u8; 2];
        let mut physical = 0usize;
        let mut virtual_nul = true;
        loop {
            let read = cursor.read(&mut pair);
            physical += read;
            if read < 2 {
                break;
            }
            let unit = u16::from_le_bytes(pair);
            if unit == 0 {
                virtual_nul = false;
                break;
            }
            units.push(unit);
        }
        if virtual_nul && !allow_virtual_data {
            return Err(Error::BufferOverrun {
                offset: start,
                wanted: (units.len() + 1) * 2,
                available: physical,
            });
        }
        let value = String::from_utf16_lossy(&units);
        Ok(PackedUtf16CString {
            value,
            state: SerializedState::from_cursor(cursor, start, physical),
            virtual_nul,
        })
    }

    pub fn write_to(&self, out: &mut dyn OutputBuffer, write_virtual_part: bool) -> Result<usize> {
        let mut written = 0;
        for unit in self.value.encode_utf16() {
            out.write(&unit.to_le_bytes())?;
            written += 2;
        }
        if write_virtual_part || !self.virtual_nul {
            out.write(&[0, 0])?;
            written += 2;
        }
        Ok(written)
    }
}

/// Up to `N` bytes with an explicit logical size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedByteArray<const N: usize> {
    data: [u8; N],
    data_size: usize,
    state: SerializedState,
}

impl<const N: usize> Default for PackedByteArray<N> {
    fn default() -> Self {
        PackedByteArray {
            data: [0; N],
            data_size: 0,
            state: SerializedState::default(),
        }
    }
}

impl<const N: usize> PackedByteArray<N> {
    pub const MAX_SIZE: usize = N;

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.data_size]
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn physical_size(&self) -> usize {
        self.state.physical_size
    }

    pub fn is_virtual(&self) -> bool {
        self.state.physical_size < self.data_size
    }

    pub fn state(&self) -> &SerializedState {
        &self.state
    }

    /// Reads `size.min(N)` logical bytes; missing physical bytes stay zero.
    pub fn read_from(
        cursor: &mut InputCursor,
        size: usize,
        allow_virtual_data: bool,
    ) -> Result<Self> {
        let data_size = size.min(N);
        let start = cursor.rpos();
        let mut data = [0u8; N];
        let physical = cursor.read(&mut data[..data_size]);
        if physical < data_size && !allow_virtual_data {
            return Err(Error::BufferOverrun {
                offset: start,
                wanted: data_size,
                available: physical,
            });
        }
        cursor.set_rpos(start + data_size);
        Ok(PackedByteArray {
            data,
            data_size,
            state: SerializedState::from_cursor(cursor, start, physical),
        })
    }

    pub fn write_to(&self, out: &mut dyn OutputBuffer, write_virtual_part: bool) -> Result<usize> {
        let count = if write_virtual_part {
            self.data_size
        } else {
            self.data_size.min(self.state.physical_size)
        };
        out.write(&self.data[..count])?;
        Ok(count)
    }
}

/// A variable-size byte block whose logical size may exceed its physical one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedByteVector {
    data: Vec<u8>,
    data_size: usize,
    state: SerializedState,
}

impl PackedByteVector {
    pub fn new(data: Vec<u8>) -> Self {
        let data_size = data.len();
        PackedByteVector {
            data,
            data_size,
            state: SerializedState {
                physical_size: data_size,
                ..SerializedState::default()
            },
        }
    }

    /// The physically present bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Logical size including the virtual tail.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn physical_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_virtual(&self) -> bool {
        self.data.len() < self.data_size
    }

    pub fn state(&self) -> &SerializedState {
        &self.state
    }

    pub fn read_from(
        cursor: &mut InputCursor,
        size: usize,
        allow_virtual_data: bool,
    ) -> Result<Self> {
        let start = cursor.rpos();
        let mut data = vec![0u8; size.min(cursor.remaining())];
        let physical = cursor.read(&mut data);
        data.truncate(physical);
        if physical < size && !allow_virtual_data {
            return Err(Error::BufferOverrun {
                offset: start,
                wanted: size,
                available: physical,
            });
        }
        cursor.set_rpos(start + size);
        let mut state = SerializedState::from_cursor(cursor, start, physical);
        state.physical_size = physical;
        Ok(PackedByteVector {
            data,
            data_size: size,
            state,
        })
    }

    /// Emits the physical bytes, plus a zero tail when `write_virtual_part`.
    pub fn write_to(&self, out: &mut dyn OutputBuffer, write_virtual_part: bool) -> Result<usize> {
        out.write(&self.data)?;
        let mut written = self.data.len();
        if write_virtual_part && self.data_size > self.data.len() {
            let zeros = vec![0u8; self.data_size - self.data.len()];
            out.write(&zeros)?;
            written += zeros.len();
        }
        Ok(written)
    }
}
