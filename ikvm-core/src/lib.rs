//! # ikvm-core
//!
//! Video and input engine for a BMC KVM-over-IP server.
//!
//! This crate contains:
//! - **Capture**: `CaptureController` driving the video engine's compare/capture commands
//! - **Encoding**: `TileEncoder` for the hardware Hextile codec, software Raw/Hextile fallback
//! - **Sessions**: `ClientSession` and `ServerState` with primary/view-only roles
//! - **Scheduling**: `UpdateScheduler` serving framebuffer update requests once per tick
//! - **Transport**: `TcpTransport`, the RFB handshake and `ClientMessageCodec`
//! - **Input**: `HidInput` turning key/pointer events into USB HID reports
//! - **Error**: `IkvmError` and its per-concern `thiserror` enums

pub mod config;
pub mod error;
pub mod rfb;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use config::ServerConfig;
pub use error::{CaptureError, EncodeError, IkvmError, TransportError};
pub use rfb::{
    CaptureController, ClientSession, EventLoop, FrameSource, HidInput, InputRelay, NullInput,
    ResizeSignal, ResizeWatcher, ServerState, TcpTransport, TileEncoder, Transport,
    UpdateScheduler,
};
