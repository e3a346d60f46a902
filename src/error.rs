//! Error types for assuan-ipc.
//!
//! Errors are plain values: every operation returns [`Result`], and every
//! variant maps to a stable numeric code via [`Error::code`]. The codes are
//! the ones a peer sees on the wire in `ERR` lines, so they are part of the
//! protocol contract and never change between releases.

use thiserror::Error;

/// Main error type for all assuan-ipc operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Unspecific failure.
    #[error("General error")]
    General,

    /// The requested operation exists but is not implemented.
    #[error("Not implemented")]
    NotImplemented,

    /// The current command was canceled, by the peer or the embedder.
    #[error("canceled")]
    Canceled,

    /// A value (option argument, escape sequence, keyword) is malformed.
    #[error("Invalid value")]
    InvalidValue,

    /// Accepting a connection on a listening socket failed.
    #[error("Accept failed")]
    AcceptFailed,

    /// Connecting or spawning the peer failed.
    #[error("Connect failed")]
    ConnectFailed,

    /// The peer sent a line that is not valid at this point of the protocol.
    #[error("Invalid response")]
    InvalidResponse,

    /// A line exceeded the 1,002 byte wire envelope.
    #[error("Line too long")]
    LineTooLong,

    /// A handler started a second inquiry before the first resolved.
    #[error("Nested commands")]
    NestedCommands,

    /// A `D` line arrived but no data sink was registered.
    #[error("No data callback")]
    NoDataCallback,

    /// An `INQUIRE` arrived but no inquiry handler was registered.
    #[error("No inquire callback")]
    NoInquireCallback,

    /// Reading from the transport failed.
    #[error("Read error")]
    ReadError,

    /// Writing to the transport failed.
    #[error("Write error")]
    WriteError,

    /// An inquiry reply exceeded the caller's size limit.
    #[error("Too much data")]
    TooMuchData,

    /// A command arrived that is not valid in the current state,
    /// e.g. `END` outside an inquiry.
    #[error("Unexpected command")]
    UnexpectedCommand,

    /// The verb of a command line matched no registered handler.
    #[error("Unknown command")]
    UnknownCommand,

    /// An argument passed by the caller is invalid for this context,
    /// e.g. descriptor passing on a pipe transport.
    #[error("Invalid parameter")]
    Parameter,

    /// The peer closed the connection.
    #[error("End of file")]
    Eof,

    /// An error code relayed by the peer in an `ERR` line that does not
    /// correspond to one of the codes this library produces itself.
    #[error("{}", description.as_deref().unwrap_or("Peer error"))]
    Peer {
        /// Numeric code from the `ERR` line.
        code: u32,
        /// Optional human-readable description from the `ERR` line.
        description: Option<String>,
    },
}

impl Error {
    /// The stable numeric code used on the wire for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::General => 1,
            Error::NotImplemented => 69,
            Error::Canceled => 99,
            Error::AcceptFailed => 258,
            Error::ConnectFailed => 259,
            Error::InvalidResponse => 260,
            Error::InvalidValue => 261,
            Error::LineTooLong => 263,
            Error::NestedCommands => 264,
            Error::NoDataCallback => 265,
            Error::NoInquireCallback => 266,
            Error::ReadError => 270,
            Error::WriteError => 271,
            Error::TooMuchData => 273,
            Error::UnexpectedCommand => 274,
            Error::UnknownCommand => 275,
            Error::Parameter => 280,
            Error::Eof => 16383,
            Error::Peer { code, .. } => *code,
        }
    }

    /// Reconstruct an error from a numeric code received in an `ERR` line.
    ///
    /// Codes this library produces itself map back to their canonical
    /// variant; anything else becomes [`Error::Peer`] carrying the code and
    /// the peer's description verbatim.
    pub fn from_code(code: u32, description: Option<&str>) -> Error {
        match code {
            1 => Error::General,
            69 => Error::NotImplemented,
            99 => Error::Canceled,
            258 => Error::AcceptFailed,
            259 => Error::ConnectFailed,
            260 => Error::InvalidResponse,
            261 => Error::InvalidValue,
            263 => Error::LineTooLong,
            264 => Error::NestedCommands,
            265 => Error::NoDataCallback,
            266 => Error::NoInquireCallback,
            270 => Error::ReadError,
            271 => Error::WriteError,
            273 => Error::TooMuchData,
            274 => Error::UnexpectedCommand,
            275 => Error::UnknownCommand,
            280 => Error::Parameter,
            16383 => Error::Eof,
            code => Error::Peer {
                code,
                description: description.map(str::to_owned),
            },
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::UnknownCommand.code(), 275);
        assert_eq!(Error::Canceled.code(), 99);
        assert_eq!(Error::LineTooLong.code(), 263);
        assert_eq!(Error::Eof.code(), 16383);
    }

    #[test]
    fn test_from_code_roundtrip_canonical() {
        for err in [
            Error::General,
            Error::NotImplemented,
            Error::Canceled,
            Error::InvalidResponse,
            Error::LineTooLong,
            Error::NestedCommands,
            Error::NoDataCallback,
            Error::NoInquireCallback,
            Error::UnknownCommand,
            Error::Eof,
        ] {
            assert_eq!(Error::from_code(err.code(), None), err);
        }
    }

    #[test]
    fn test_from_code_unknown_becomes_peer() {
        let err = Error::from_code(11001, Some("something agent-specific"));
        assert_eq!(err.code(), 11001);
        assert_eq!(err.to_string(), "something agent-specific");
    }

    #[test]
    fn test_wire_descriptions() {
        // These exact strings appear in ERR lines on the wire.
        assert_eq!(Error::UnknownCommand.to_string(), "Unknown command");
        assert_eq!(Error::Canceled.to_string(), "canceled");
    }
}
