use std::fmt;
use std::io;

use crate::interface::ArgKind;
use crate::object::ObjectId;

/// Error produced while decoding message arguments against a signature.
///
/// Decode errors are local to a single message: the message is reported and
/// dropped, the connection stays usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The raw argument list ran out before the signature was satisfied.
    Truncated { expected: ArgKind, index: usize },
    /// A raw slot had the wrong shape for its signature character.
    SlotMismatch { expected: ArgKind, index: usize },
    /// A signature character outside the wire alphabet.
    BadSignature(char),
    /// A new-id slot carried id 0.
    NullNewId { index: usize },
    /// A new-id slot named an id that already has a live record.
    IdInUse(ObjectId),
    /// A dynamic new-id was not preceded by its interface name and version.
    MissingNewIdContext { index: usize },
    /// A dynamic new-id named an interface this connection does not know.
    UnknownInterface(String),
    /// A text argument was not valid UTF-8.
    BadUtf8 { index: usize },
    /// The message frame itself was malformed (short header, bad size, ...).
    BadFrame(&'static str),
    /// A file-descriptor argument arrived without an fd on the ancillary
    /// channel.
    MissingFd { index: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { expected, index } => {
                write!(f, "argument list truncated at #{index} (expected {expected})")
            }
            DecodeError::SlotMismatch { expected, index } => {
                write!(f, "raw slot #{index} does not match signature kind {expected}")
            }
            DecodeError::BadSignature(c) => write!(f, "unknown signature character {c:?}"),
            DecodeError::NullNewId { index } => {
                write!(f, "new-id argument #{index} carries the null id")
            }
            DecodeError::IdInUse(id) => {
                write!(f, "new-id argument names id {id} which is already live")
            }
            DecodeError::MissingNewIdContext { index } => {
                write!(f, "dynamic new-id #{index} lacks a preceding name/version pair")
            }
            DecodeError::UnknownInterface(name) => write!(f, "unknown interface {name:?}"),
            DecodeError::BadUtf8 { index } => write!(f, "text argument #{index} is not UTF-8"),
            DecodeError::BadFrame(what) => write!(f, "malformed message frame: {what}"),
            DecodeError::MissingFd { index } => {
                write!(f, "fd argument #{index} has no descriptor on the ancillary channel")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// A `WireValue` was read with the wrong expected tag.
///
/// This is a programming error in generated glue, not a protocol error; it
/// is surfaced immediately instead of being coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeMismatch {
    pub expected: ArgKind,
    pub found: ArgKind,
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire value is {}, accessed as {}", self.found, self.expected)
    }
}

impl std::error::Error for TypeMismatch {}

/// Error produced while encoding a value sequence against a signature.
///
/// Encode errors are programming errors in the calling glue (wrong tag,
/// wrong arity), surfaced instead of coerced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    Type(TypeMismatch),
    /// Value count does not match the signature's argument count.
    Arity { expected: usize, found: usize },
    BadSignature(char),
    /// Encoded message exceeds the 16-bit frame size field.
    Oversize(usize),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Type(e) => write!(f, "{e}"),
            EncodeError::Arity { expected, found } => {
                write!(f, "signature names {expected} arguments, {found} supplied")
            }
            EncodeError::BadSignature(c) => write!(f, "unknown signature character {c:?}"),
            EncodeError::Oversize(n) => write!(f, "message of {n} bytes exceeds frame size field"),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<TypeMismatch> for EncodeError {
    fn from(e: TypeMismatch) -> Self {
        EncodeError::Type(e)
    }
}

/// Errors raised while routing a decoded message to its callback slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The target id has no live object record (already destroyed or never
    /// created).
    UnknownObject(ObjectId),
    /// The opcode is outside the interface's declared message list.
    BadOpcode { interface: &'static str, opcode: u16 },
    /// Argument decoding failed; no callback was invoked.
    Decode(DecodeError),
    /// A callback slot read an argument with the wrong tag.
    Type(TypeMismatch),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::UnknownObject(id) => write!(f, "no live object with id {id}"),
            DispatchError::BadOpcode { interface, opcode } => {
                write!(f, "interface {interface} has no message at opcode {opcode}")
            }
            DispatchError::Decode(e) => write!(f, "decode failed: {e}"),
            DispatchError::Type(e) => write!(f, "argument access failed: {e}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Decode(e) => Some(e),
            DispatchError::Type(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DecodeError> for DispatchError {
    fn from(e: DecodeError) -> Self {
        DispatchError::Decode(e)
    }
}

impl From<TypeMismatch> for DispatchError {
    fn from(e: TypeMismatch) -> Self {
        DispatchError::Type(e)
    }
}

/// Connection-level failures.
///
/// `Again` is a retry condition (transport not ready for more data); every
/// other variant is fatal: it is recorded on the connection and surfaced by
/// all subsequent operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The transport is not ready; retry after polling the descriptor.
    Again,
    /// The peer closed the connection.
    Closed,
    /// An I/O error on the transport.
    Io(io::ErrorKind),
    /// The connection already hit a fatal error and must not be used.
    Defunct,
    /// The single-owner destroy invariant was violated (a handle outlived
    /// its record). Fatal; never masked.
    InvariantViolated(&'static str),
}

impl ConnectionError {
    /// Fatal errors poison the connection; `Again` does not.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionError::Again)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Again => write!(f, "transport not ready, retry"),
            ConnectionError::Closed => write!(f, "connection closed by peer"),
            ConnectionError::Io(kind) => write!(f, "transport i/o error: {kind}"),
            ConnectionError::Defunct => write!(f, "connection is defunct after a fatal error"),
            ConnectionError::InvariantViolated(what) => {
                write!(f, "object lifecycle invariant violated: {what}")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => ConnectionError::Again,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => ConnectionError::Closed,
            kind => ConnectionError::Io(kind),
        }
    }
}

/// Errors from emitting a request or event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    Encode(EncodeError),
    Connection(ConnectionError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Encode(e) => write!(f, "encode failed: {e}"),
            SendError::Connection(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Encode(e) => Some(e),
            SendError::Connection(e) => Some(e),
        }
    }
}

impl From<EncodeError> for SendError {
    fn from(e: EncodeError) -> Self {
        SendError::Encode(e)
    }
}

impl From<ConnectionError> for SendError {
    fn from(e: ConnectionError) -> Self {
        SendError::Connection(e)
    }
}

/// Outcome of `prepare_read`.
///
/// Both non-`Defunct` variants are retry conditions: the caller drains the
/// queue (or waits for the active reader) and tries again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareError {
    /// Undispatched messages sit on the queue; drain them first.
    QueuePending,
    /// Another thread already announced read intent.
    ReadInProgress,
    /// The connection hit a fatal error.
    Defunct(ConnectionError),
}

impl PrepareError {
    pub fn is_retry(&self) -> bool {
        !matches!(self, PrepareError::Defunct(_))
    }
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrepareError::QueuePending => write!(f, "queue has undispatched messages"),
            PrepareError::ReadInProgress => write!(f, "another thread holds the read intent"),
            PrepareError::Defunct(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PrepareError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_display() {
        let e = DecodeError::Truncated { expected: ArgKind::Uint, index: 2 };
        assert!(format!("{e}").contains("#2"));

        let e = DecodeError::UnknownInterface("frobnicator".into());
        assert!(format!("{e}").contains("frobnicator"));
    }

    #[test]
    fn io_error_mapping() {
        let e: ConnectionError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(e, ConnectionError::Again);
        assert!(!e.is_fatal());

        let e: ConnectionError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(e, ConnectionError::Closed);
        assert!(e.is_fatal());
    }

    #[test]
    fn prepare_error_retry() {
        assert!(PrepareError::QueuePending.is_retry());
        assert!(PrepareError::ReadInProgress.is_retry());
        assert!(!PrepareError::Defunct(ConnectionError::Closed).is_retry());
    }
}
