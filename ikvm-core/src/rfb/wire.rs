//! Server → client message framing.
//!
//! ## FramebufferUpdate
//!
//! ```text
//! message_type:  u8   (0)
//! padding:       u8
//! rect_count:    u16  (0xFFFF = terminated by a LastRect marker)
//! rects:         [rect_header, payload]*
//! ```
//!
//! **Rectangle header** (12 bytes):
//! ```text
//! x, y, w, h:    u16 each
//! encoding:      i32
//! ```
//!
//! All multi-byte fields are big-endian. Bytes are staged in the session's
//! output buffer and handed to the socket sink whenever the next write would
//! overflow it.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TransportError;
use crate::rfb::types::Rect;

// ── Constants ────────────────────────────────────────────────────

pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_HEXTILE: i32 = 5;
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
pub const ENCODING_LAST_RECT: i32 = -224;

/// Rect count announcing that a LastRect marker ends the update.
pub const RECT_COUNT_UNKNOWN: u16 = 0xFFFF;

pub const UPDATE_HEADER_SIZE: usize = 4;

// ── ClientCaps ───────────────────────────────────────────────────

bitflags! {
    /// Encodings and pseudo-encodings a client advertised in SetEncodings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientCaps: u8 {
        const RAW          = 0b0000_0001;
        const HEXTILE      = 0b0000_0010;
        const LAST_RECT    = 0b0000_0100;
        const DESKTOP_SIZE = 0b0000_1000;
    }
}

impl ClientCaps {
    pub fn from_encodings(encodings: &[i32]) -> Self {
        let mut caps = ClientCaps::RAW;
        for &enc in encodings {
            caps |= match enc {
                ENCODING_HEXTILE => ClientCaps::HEXTILE,
                ENCODING_LAST_RECT => ClientCaps::LAST_RECT,
                ENCODING_DESKTOP_SIZE => ClientCaps::DESKTOP_SIZE,
                _ => ClientCaps::empty(),
            };
        }
        caps
    }
}

// ── RectHeader ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RectHeader {
    pub rect: Rect,
    pub encoding: i32,
}

impl RectHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 12;

    pub fn new(rect: Rect, encoding: i32) -> Self {
        Self { rect, encoding }
    }

    /// Serialize to bytes (big-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.rect.x.to_be_bytes());
        buf[2..4].copy_from_slice(&self.rect.y.to_be_bytes());
        buf[4..6].copy_from_slice(&self.rect.w.to_be_bytes());
        buf[6..8].copy_from_slice(&self.rect.h.to_be_bytes());
        buf[8..12].copy_from_slice(&self.encoding.to_be_bytes());
        buf
    }
}

/// Rectangle count announced in the update header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RectCount {
    Known(u16),
    /// Terminated by a LastRect marker.
    Unknown,
}

impl RectCount {
    pub fn wire_value(self) -> u16 {
        match self {
            RectCount::Known(n) => n,
            RectCount::Unknown => RECT_COUNT_UNKNOWN,
        }
    }
}

// ── FrameSink ────────────────────────────────────────────────────

/// Where a session's flushed output goes.
pub trait FrameSink: Send {
    /// Whether the sink can take an update right now.
    fn ready(&self) -> bool;

    /// Queue one chunk for the socket. Never blocks.
    fn send(&mut self, chunk: Bytes) -> Result<(), TransportError>;
}

// ── WireWriter ───────────────────────────────────────────────────

/// Buffered writer for one framebuffer update.
pub struct WireWriter<'a> {
    buf: &'a mut BytesMut,
    sink: &'a mut dyn FrameSink,
    capacity: usize,
    bytes_out: u64,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut BytesMut, sink: &'a mut dyn FrameSink, capacity: usize) -> Self {
        Self {
            buf,
            sink,
            capacity: capacity.max(RectHeader::SIZE),
            bytes_out: 0,
        }
    }

    /// Start a FramebufferUpdate.
    pub fn begin_update(&mut self, count: RectCount) -> Result<(), TransportError> {
        let mut hdr = [0u8; UPDATE_HEADER_SIZE];
        hdr[0] = SERVER_MSG_FRAMEBUFFER_UPDATE;
        hdr[2..4].copy_from_slice(&count.wire_value().to_be_bytes());
        self.write(&hdr)
    }

    pub fn rect_header(&mut self, rect: Rect, encoding: i32) -> Result<(), TransportError> {
        self.write(&RectHeader::new(rect, encoding).encode())
    }

    /// Append rectangle payload, split into buffer-sized chunks.
    pub fn payload(&mut self, data: &[u8]) -> Result<(), TransportError> {
        for chunk in data.chunks(self.capacity) {
            self.write(chunk)?;
        }
        Ok(())
    }

    /// The LastRect marker ending an update announced with [`RectCount::Unknown`].
    pub fn last_rect(&mut self) -> Result<(), TransportError> {
        self.rect_header(Rect::default(), ENCODING_LAST_RECT)
    }

    /// DesktopSize pseudo-rectangle carrying the new geometry.
    pub fn desktop_size(&mut self, width: u16, height: u16) -> Result<(), TransportError> {
        self.rect_header(Rect::full(width, height), ENCODING_DESKTOP_SIZE)
    }

    /// Hand everything buffered to the sink. Returns bytes emitted by this writer.
    pub fn finish(mut self) -> Result<u64, TransportError> {
        self.flush()?;
        Ok(self.bytes_out)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.buf.len() + data.len() > self.capacity {
            self.flush()?;
        }
        self.buf.put_slice(data);
        self.bytes_out += data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.sink.send(chunk)
    }
}

// ── Tests ────────────────────────────────────────────────────────
