//! Error taxonomy for the transport core.
//!
//! Transport, framing and decode errors are terminal for the session that
//! produced them; timeouts are local to a single call. [`CallError`] is the
//! unified kind that response continuations observe.

use core::fmt;

/// Socket-level failures.
#[derive(Debug)]
pub enum TransportError {
    /// The peer refused the connection.
    Refused(std::io::Error),
    /// The peer closed the connection.
    Closed,
    /// The operation was cancelled because the session was stopped.
    Cancelled,
    Io(std::io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(e) => write!(f, "connection refused: {e}"),
            Self::Closed => write!(f, "connection closed"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Refused(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Violations of the wire format.
#[derive(Debug)]
pub enum FramingError {
    /// The stream ended inside a frame.
    Truncated,
    /// A frame announced a payload above the negotiated cap.
    Oversize { len: usize, max: usize },
    /// The version byte of a v1 frame was not a known protocol version.
    UnknownVersion(u8),
    /// The kind byte of a v1 frame was not a known frame kind.
    UnknownKind(u8),
    /// A well-formed frame arrived where a different kind was required.
    UnexpectedKind { expected: crate::FrameKind, got: crate::FrameKind },
    /// Bytes arrived while no request was in flight.
    Unsolicited,
    /// The handshake produced no common protocol version.
    HandshakeRejected { offered: u8 },
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated frame"),
            Self::Oversize { len, max } => {
                write!(f, "frame payload {len} bytes exceeds max {max}")
            }
            Self::UnknownVersion(v) => write!(f, "unknown protocol version {v}"),
            Self::UnknownKind(k) => write!(f, "unknown frame kind {k}"),
            Self::UnexpectedKind { expected, got } => {
                write!(f, "expected {expected:?} frame, got {got:?}")
            }
            Self::Unsolicited => write!(f, "unsolicited data outside a request"),
            Self::HandshakeRejected { offered } => {
                write!(f, "handshake rejected: no common version (offered {offered})")
            }
        }
    }
}

impl std::error::Error for FramingError {}

/// An envelope that could not be parsed.
#[derive(Debug)]
pub struct DecodeError(String);

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not parse envelope: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

/// Everything a response continuation can observe.
///
/// `Timeout` renders as the literal string `"Timeout"`; per-endpoint result
/// slots are pre-populated with it and keep it when the deadline passes.
#[derive(Debug)]
pub enum CallError {
    Transport(TransportError),
    Framing(FramingError),
    Decode(DecodeError),
    /// The client-side deadline elapsed before a response arrived.
    Timeout,
    /// No endpoint matched the service name and host filter.
    NotFound,
    /// The session manager is stopped or the client was never created.
    NotReady,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Framing(e) => write!(f, "framing error: {e}"),
            Self::Decode(e) => write!(f, "{e}"),
            Self::Timeout => write!(f, "Timeout"),
            Self::NotFound => write!(f, "no matching service endpoint"),
            Self::NotReady => write!(f, "client not ready"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Framing(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<FramingError> for CallError {
    fn from(e: FramingError) -> Self {
        Self::Framing(e)
    }
}

impl From<DecodeError> for CallError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}
