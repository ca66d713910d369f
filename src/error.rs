use core::fmt;

/// Errors returned by the mesh stack.
///
/// Only local encoding and buffer handling produces an `Error`. Protocol failures observed on
/// received packets (bad MAC, replayed timestamp, unknown destination) are silent drops and never
/// surface here, so that no information leaks back over the air.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when a payload does not fit into a packet or other fixed-size buffer, and
    /// also when reaching EOF prematurely while reading data from a buffer.
    Eof,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
        })
    }
}
