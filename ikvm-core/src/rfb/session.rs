//! Per-connection state.
//!
//! ```text
//! Connecting ──► Active ──► Closing ──► Gone
//!                  │
//!                  └─ role: Primary | ViewOnly
//! ```
//!
//! The first session of a generation is `Primary`: it drives the capture
//! engine and its input reaches the host. Later sessions are `ViewOnly`.

use std::time::Instant;

use bytes::BytesMut;
use tracing::debug;

use crate::error::{EncodeError, TransportError};
use crate::rfb::capture::RefreshState;
use crate::rfb::soft::SoftEncoding;
use crate::rfb::transport::ConnectionId;
use crate::rfb::types::PixelFormat;
use crate::rfb::wire::{ClientCaps, FrameSink, WireWriter};

// ── Phase / role ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Accepted, no update request seen yet.
    Connecting,
    Active,
    /// A send failed or the engine gave up on it; removed at the end of the tick.
    Closing,
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Primary {
        /// Input events relayed to the host.
        relayed_input: u64,
    },
    ViewOnly {
        /// Input events dropped because this session is view-only.
        dropped_input: u64,
    },
}

// ── SessionStats ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub failed_sends: u64,
    /// Updates postponed because the socket was not ready.
    pub deferred: u64,
    pub bytes_sent: u64,
    /// Rectangles dropped because the tile codec stalled.
    pub skipped_rects: u64,
}

// ── ClientSession ────────────────────────────────────────────────

/// One connected viewer: its role, negotiated format and update bookkeeping.
pub struct ClientSession {
    conn: ConnectionId,
    slot: usize,
    /// Position in connection order; smaller is older.
    order: u64,
    phase: SessionPhase,
    role: SessionRole,
    sink: Box<dyn FrameSink>,
    out: BytesMut,
    out_capacity: usize,
    format: PixelFormat,
    encodings: Vec<i32>,
    caps: ClientCaps,
    soft: SoftEncoding,
    requests_received: u64,
    last_serviced: u64,
    pub(crate) refresh: RefreshState,
    pending_resize: Option<(u16, u16)>,
    stats: SessionStats,
    last_sent_at: Option<Instant>,
}

impl ClientSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: ConnectionId,
        slot: usize,
        order: u64,
        sink: Box<dyn FrameSink>,
        format: PixelFormat,
        primary: bool,
        settle_frames: u32,
        out_capacity: usize,
    ) -> Self {
        let role = if primary {
            SessionRole::Primary { relayed_input: 0 }
        } else {
            SessionRole::ViewOnly { dropped_input: 0 }
        };
        Self {
            conn,
            slot,
            order,
            phase: SessionPhase::Connecting,
            role,
            sink,
            out: BytesMut::with_capacity(out_capacity),
            out_capacity,
            format,
            encodings: Vec::new(),
            caps: ClientCaps::RAW,
            soft: SoftEncoding::Raw,
            requests_received: 0,
            last_serviced: 0,
            refresh: RefreshState::settling(settle_frames),
            pending_resize: None,
            stats: SessionStats::default(),
            last_sent_at: None,
        }
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.role, SessionRole::Primary { .. })
    }

    pub fn is_view_only(&self) -> bool {
        !self.is_primary()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.phase, SessionPhase::Connecting | SessionPhase::Active)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn caps(&self) -> ClientCaps {
        self.caps
    }

    pub fn soft_encoding(&self) -> SoftEncoding {
        self.soft
    }

    pub fn refresh(&self) -> RefreshState {
        self.refresh
    }

    pub fn backlog(&self) -> u32 {
        self.refresh.backlog
    }

    pub fn pending_resize(&self) -> Option<(u16, u16)> {
        self.pending_resize
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    pub fn requests_received(&self) -> u64 {
        self.requests_received
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Count a FramebufferUpdateRequest. A non-incremental request asks
    /// for the whole screen, so the diff cursor is dropped.
    pub fn request_update(&mut self, incremental: bool) {
        if self.phase == SessionPhase::Connecting {
            self.phase = SessionPhase::Active;
        }
        if !incremental {
            self.refresh.resync();
        }
        self.requests_received += 1;
    }

    /// Whether a request arrived that has not been answered yet.
    pub fn is_due(&self) -> bool {
        self.phase == SessionPhase::Active && self.requests_received != self.last_serviced
    }

    /// Answer every outstanding request with the update just sent.
    pub fn mark_serviced(&mut self) {
        self.last_serviced = self.requests_received;
    }

    pub fn sink_ready(&self) -> bool {
        self.sink.ready()
    }

    pub fn set_pixel_format(&mut self, format: PixelFormat) -> Result<(), EncodeError> {
        format.validate()?;
        debug!(conn = %self.conn, bpp = format.bits_per_pixel, "pixel format set");
        self.format = format;
        self.refresh.resync();
        Ok(())
    }

    pub fn set_encodings(&mut self, encodings: Vec<i32>) {
        self.caps = ClientCaps::from_encodings(&encodings);
        self.soft = SoftEncoding::negotiate(&encodings);
        debug!(conn = %self.conn, caps = ?self.caps, soft = ?self.soft, "encodings set");
        self.encodings = encodings;
    }

    pub fn encodings(&self) -> &[i32] {
        &self.encodings
    }

    // ── Role changes ─────────────────────────────────────────────

    pub fn promote(&mut self) {
        if self.is_view_only() {
            self.role = SessionRole::Primary { relayed_input: 0 };
        }
    }

    /// Record an input event; returns whether it should reach the host.
    pub fn accept_input(&mut self) -> bool {
        match &mut self.role {
            SessionRole::Primary { relayed_input } => {
                *relayed_input += 1;
                true
            }
            SessionRole::ViewOnly { dropped_input } => {
                *dropped_input += 1;
                false
            }
        }
    }

    // ── Resize ───────────────────────────────────────────────────

    /// Schedule a DesktopSize notification and restart the settle window.
    pub fn begin_resize(&mut self, width: u16, height: u16, settle_frames: u32) {
        self.pending_resize = Some((width, height));
        self.refresh.reset(settle_frames);
    }

    pub fn finish_resize(&mut self) {
        self.pending_resize = None;
    }

    // ── Output ───────────────────────────────────────────────────

    /// Writer over this session's output buffer and socket sink.
    pub fn writer(&mut self) -> WireWriter<'_> {
        WireWriter::new(&mut self.out, self.sink.as_mut(), self.out_capacity)
    }

    pub fn record_sent(&mut self, bytes: u64, now: Instant) {
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += bytes;
        self.last_sent_at = Some(now);
        self.mark_serviced();
    }

    pub fn record_deferred(&mut self) {
        self.stats.deferred += 1;
    }

    pub fn record_skipped(&mut self, rects: u64) {
        self.stats.skipped_rects += rects;
    }

    /// A send failed; the session will be torn down.
    pub fn fail(&mut self, err: &TransportError) {
        debug!(conn = %self.conn, error = %err, "send failed; closing session");
        self.stats.failed_sends += 1;
        self.out.clear();
        self.phase = SessionPhase::Closing;
    }

    pub fn close(&mut self) {
        self.out.clear();
        if self.is_open() {
            self.phase = SessionPhase::Closing;
        }
    }

    pub fn mark_gone(&mut self) {
        self.phase = SessionPhase::Gone;
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("conn", &self.conn)
            .field("slot", &self.slot)
            .field("phase", &self.phase)
            .field("role", &self.role)
            .field("refresh", &self.refresh)
            .field("pending_resize", &self.pending_resize)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────
