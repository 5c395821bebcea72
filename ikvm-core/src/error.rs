//! Domain-specific error types for the iKVM update engine.
//!
//! Every fallible operation in the update path returns one of the typed
//! errors below. None of them is fatal to the process: capture failures
//! degrade to a placeholder frame, encode failures cost one rectangle and
//! transport failures cost one session.

use thiserror::Error;

use crate::rfb::types::Rect;

// ── CaptureError ─────────────────────────────────────────────────

/// Failures reported by the video capture engine.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The capture device could not be opened, queried or mapped.
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device reported a geometry the server cannot serve.
    #[error("invalid video mode {width}x{height}")]
    InvalidMode { width: u32, height: u32 },

    /// An ioctl or mmap on the device node failed.
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── EncodeError ──────────────────────────────────────────────────

/// Failures while turning a rectangle into wire bytes.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The tile codec device is not open or not configured.
    #[error("tile codec unavailable: {0}")]
    DeviceUnavailable(String),

    /// The codec kept producing unusable output until the retry budget ran out.
    #[error("tile codec stalled after {attempts} attempts")]
    DeviceStalled { attempts: u32 },

    /// The client's pixel format cannot be produced from the capture format.
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(&'static str),

    /// The rectangle does not fit inside the current frame.
    #[error("rectangle {rect:?} lies outside the frame")]
    OutOfBounds { rect: Rect },
}

// ── TransportError ───────────────────────────────────────────────

/// Failures on a single client connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer went away or the writer task has finished.
    #[error("connection closed")]
    Closed,

    /// The outgoing queue is full; the socket is not draining.
    #[error("send would block")]
    WouldBlock,

    /// The socket reported an error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent bytes that are not a valid RFB message.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Version or security negotiation failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

// ── IkvmError ────────────────────────────────────────────────────

/// The crate-level error type.
#[derive(Debug, Error)]
pub enum IkvmError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for IkvmError {
    fn from(s: String) -> Self {
        IkvmError::Other(s)
    }
}

impl From<&str> for IkvmError {
    fn from(s: &str) -> Self {
        IkvmError::Other(s.to_string())
    }
}
