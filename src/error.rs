use core::fmt;
use core::result;

#[derive(Debug)]
/// A custom kobold error
#[non_exhaustive]
pub enum Error {
    /// The binary is malformed somehow
    Malformed(String),
    /// The magic is unknown or bad
    BadMagic(u64),
    /// The buffer ran out of physical bytes: `wanted` at `offset`, only `available` remained
    BufferOverrun {
        /// Read position within the buffer
        offset: usize,
        /// Bytes the caller asked for
        wanted: usize,
        /// Bytes that were physically available
        available: usize,
    },
    /// A call to the scroll api failed
    Scroll(scroll::Error),
    /// An IO based error
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(io) => Some(io),
            Error::Scroll(scroll) => Some(scroll),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(fmt, "{err}"),
            Error::Scroll(err) => write!(fmt, "{err}"),
            Error::BadMagic(magic) => write!(fmt, "Invalid magic number: 0x{magic:x}"),
            Error::Malformed(msg) => write!(fmt, "Malformed entity: {msg}"),
            Error::BufferOverrun {
                offset,
                wanted,
                available,
            } => write!(
                fmt,
                "Buffer overrun: wanted {wanted} bytes at offset {offset:#x}, only {available} available"
            ),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
