//! The connection substrate the event loop runs on.
//!
//! A [`Transport`] owns sockets, the RFB handshake and client message
//! parsing. The update engine only sees the resulting [`TransportEvent`]s
//! and writes through each connection's [`FrameSink`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::rfb::types::{PixelFormat, Rect, ScreenInfo};
use crate::rfb::wire::FrameSink;

/// Transport-assigned connection identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Something that happened on a connection since the last poll.
pub enum TransportEvent {
    /// Handshake finished; the client is ready for updates.
    Connected {
        conn: ConnectionId,
        sink: Box<dyn FrameSink>,
    },
    /// The peer went away or the connection failed.
    Closed { conn: ConnectionId },
    /// FramebufferUpdateRequest.
    UpdateRequested {
        conn: ConnectionId,
        incremental: bool,
        region: Rect,
    },
    SetPixelFormat {
        conn: ConnectionId,
        format: PixelFormat,
    },
    SetEncodings {
        conn: ConnectionId,
        encodings: Vec<i32>,
    },
    Key {
        conn: ConnectionId,
        down: bool,
        keysym: u32,
    },
    Pointer {
        conn: ConnectionId,
        buttons: u8,
        x: u16,
        y: u16,
    },
    /// ClientCutText; clipboard transfer is not supported, only the length is kept.
    CutText { conn: ConnectionId, len: usize },
}

impl TransportEvent {
    pub fn conn(&self) -> ConnectionId {
        match self {
            TransportEvent::Connected { conn, .. }
            | TransportEvent::Closed { conn }
            | TransportEvent::UpdateRequested { conn, .. }
            | TransportEvent::SetPixelFormat { conn, .. }
            | TransportEvent::SetEncodings { conn, .. }
            | TransportEvent::Key { conn, .. }
            | TransportEvent::Pointer { conn, .. }
            | TransportEvent::CutText { conn, .. } => *conn,
        }
    }
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Connected { conn, .. } => write!(f, "Connected({conn})"),
            TransportEvent::Closed { conn } => write!(f, "Closed({conn})"),
            TransportEvent::UpdateRequested {
                conn,
                incremental,
                region,
            } => write!(f, "UpdateRequested({conn}, incremental={incremental}, {region:?})"),
            TransportEvent::SetPixelFormat { conn, format } => {
                write!(f, "SetPixelFormat({conn}, {}bpp)", format.bits_per_pixel)
            }
            TransportEvent::SetEncodings { conn, encodings } => {
                write!(f, "SetEncodings({conn}, {encodings:?})")
            }
            TransportEvent::Key { conn, down, keysym } => {
                write!(f, "Key({conn}, down={down}, {keysym:#x})")
            }
            TransportEvent::Pointer { conn, buttons, x, y } => {
                write!(f, "Pointer({conn}, {buttons:#04x}, {x}, {y})")
            }
            TransportEvent::CutText { conn, len } => write!(f, "CutText({conn}, {len} bytes)"),
        }
    }
}

/// Socket substrate driven by [`EventLoop`](crate::rfb::EventLoop).
#[async_trait]
pub trait Transport: Send {
    /// Wait up to `timeout` for activity and return everything that happened.
    async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent>;

    /// Geometry and format announced to clients that connect from now on.
    fn publish_screen(&mut self, info: ScreenInfo);

    /// Drop a connection the engine has given up on.
    fn close(&mut self, conn: ConnectionId);
}
