//! Per-tick update scheduling.
//!
//! Each tick the scheduler:
//!
//! 1. collects the sessions with an unanswered update request,
//! 2. elects one of them to drive the capture engine,
//! 3. applies a pending mode change (DesktopSize notifications, no pixels),
//! 4. otherwise fetches a change set per session and writes one
//!    FramebufferUpdate to each, oldest connection first.
//!
//! Nothing here is fatal: a failed capture skips the tick, a stalled tile
//! costs one rectangle and a failed send closes one session.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::error::{EncodeError, TransportError};
use crate::rfb::capture::CaptureController;
use crate::rfb::monitor::ResizeSignal;
use crate::rfb::rate::{FpsDump, FrameRateMeter};
use crate::rfb::session::ClientSession;
use crate::rfb::soft::{self, PixelTranslator, SoftEncoding};
use crate::rfb::state::ServerState;
use crate::rfb::tile::{TileEncoder, send_encoded_tile};
use crate::rfb::transport::ConnectionId;
use crate::rfb::types::{ChangeKind, ChangeSet, FrameSource, Rect};
use crate::rfb::wire::{ClientCaps, RectCount, WireWriter};

// ── Reports ──────────────────────────────────────────────────────

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickOutcome {
    /// No session was due.
    #[default]
    Idle,
    /// Updates were written.
    Served,
    /// A mode change was applied; only DesktopSize went out.
    Resized,
    /// A mode change is pending but a frame went out too recently.
    ResizeDeferred,
    /// No usable video; nothing but DesktopSize notifications are sent.
    Placeholder,
    /// The capture engine failed; requests stay outstanding.
    CaptureFailed,
}

/// One FramebufferUpdate written this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentUpdate {
    pub conn: ConnectionId,
    /// Pixel rectangles written (markers excluded).
    pub rects: usize,
    pub full_frame: bool,
    pub desktop_size: bool,
    /// Rectangles dropped because the tile codec stalled.
    pub skipped: usize,
    pub bytes: u64,
}

/// What one tick did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub outcome: TickOutcome,
    /// Sessions that had an outstanding request.
    pub due: usize,
    /// Session that issued this tick's capture command.
    pub driver: Option<ConnectionId>,
    pub updates: Vec<SentUpdate>,
    /// Sessions moved to `Closing` this tick.
    pub closed: Vec<ConnectionId>,
    /// Sessions whose socket was not ready; their request stays outstanding.
    pub deferred: Vec<ConnectionId>,
}

impl TickReport {
    pub fn resized(&self) -> bool {
        self.outcome == TickOutcome::Resized
    }

    pub fn update_for(&self, conn: ConnectionId) -> Option<&SentUpdate> {
        self.updates.iter().find(|u| u.conn == conn)
    }
}

// ── UpdateScheduler ──────────────────────────────────────────────

/// Serves outstanding update requests once per event-loop tick.
pub struct UpdateScheduler {
    config: ServerConfig,
    meter: FrameRateMeter,
    dump: Option<FpsDump>,
    last_reinit_attempt: Option<Instant>,
    scratch: Vec<u8>,
}

impl UpdateScheduler {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            dump: config
                .fps_dump_interval()
                .map(|every| FpsDump::new(every, Instant::now())),
            config,
            meter: FrameRateMeter::new(),
            last_reinit_attempt: None,
            scratch: Vec::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Rolling fps over all sessions.
    pub fn meter(&self) -> &FrameRateMeter {
        &self.meter
    }

    /// Run one tick.
    pub fn tick(
        &mut self,
        state: &mut ServerState,
        capture: &mut CaptureController,
        tiles: &mut TileEncoder,
        signal: &ResizeSignal,
        now: Instant,
    ) -> TickReport {
        let mut report = TickReport::default();
        self.meter.advance(now);

        let due = self.collect_due(state, &mut report);
        if !due.is_empty() {
            self.service(state, capture, tiles, signal, now, &due, &mut report);
        }

        if let Some(dump) = self.dump.as_mut() {
            dump.poll(now);
        }
        report
    }

    /// Due slots in connection order, minus those whose socket is backed up.
    fn collect_due(&self, state: &mut ServerState, report: &mut TickReport) -> Vec<usize> {
        let mut due = Vec::new();
        for slot in state.due_slots() {
            let Some(session) = state.slot_mut(slot) else {
                continue;
            };
            report.due += 1;
            if session.sink_ready() {
                due.push(slot);
            } else {
                trace!(conn = %session.conn(), "socket busy; deferring update");
                session.record_deferred();
                report.deferred.push(session.conn());
            }
        }
        due
    }

    #[allow(clippy::too_many_arguments)]
    fn service(
        &mut self,
        state: &mut ServerState,
        capture: &mut CaptureController,
        tiles: &mut TileEncoder,
        signal: &ResizeSignal,
        now: Instant,
        due: &[usize],
        report: &mut TickReport,
    ) {
        match capture.query_resolution_changed(true) {
            Ok(true) => signal.raise(),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "resolution query failed"),
        }

        // the watcher and the device flag can both report one change
        if signal.is_raised() && !state.frame().is_placeholder() && self.mode_installed(capture) {
            signal.take();
            debug!("mode change already applied; ignoring signal");
        }

        if signal.is_raised() {
            if !self.dwell_elapsed(state, now) {
                debug!("mode change pending; waiting for the current frame to settle");
                report.outcome = TickOutcome::ResizeDeferred;
                return;
            }
            signal.take();
            self.reinitialize(state, capture, tiles, now, report);
            self.send_desktop_sizes(state, due, now, report);
            report.outcome = TickOutcome::Resized;
            return;
        }

        if state.frame().is_placeholder() {
            let retry_due = self
                .last_reinit_attempt
                .is_none_or(|t| now.saturating_duration_since(t) >= self.config.placeholder_retry());
            if retry_due && self.reinitialize(state, capture, tiles, now, report) {
                self.send_desktop_sizes(state, due, now, report);
                report.outcome = TickOutcome::Resized;
                return;
            }
            self.send_desktop_sizes(state, due, now, report);
            report.outcome = TickOutcome::Placeholder;
            return;
        }

        // sessions still owed a DesktopSize get only that
        self.send_desktop_sizes(state, due, now, report);
        let frame_due: Vec<usize> = due
            .iter()
            .copied()
            .filter(|&slot| {
                state
                    .slot(slot)
                    .is_some_and(|s| s.is_due() && s.pending_resize().is_none())
            })
            .collect();
        if frame_due.is_empty() {
            report.outcome = TickOutcome::Served;
            return;
        }

        let driver = frame_due
            .iter()
            .copied()
            .find(|&slot| state.slot(slot).is_some_and(ClientSession::is_primary))
            .unwrap_or(frame_due[0]);

        // the driver commands the engine once; everyone else reads its result
        let driven = {
            let Some(session) = state.slot_mut(driver) else {
                return;
            };
            report.driver = Some(session.conn());
            match capture.request_change_set(true, &mut session.refresh) {
                Ok(set) => set,
                Err(e) => {
                    warn!(conn = %session.conn(), error = %e, "capture failed; skipping tick");
                    report.outcome = TickOutcome::CaptureFailed;
                    return;
                }
            }
        };

        for &slot in &frame_due {
            let set = if slot == driver {
                Arc::clone(&driven)
            } else {
                let Some(session) = state.slot_mut(slot) else {
                    continue;
                };
                match capture.request_change_set(false, &mut session.refresh) {
                    Ok(set) => set,
                    Err(e) => {
                        warn!(conn = %session.conn(), error = %e, "no change set available");
                        continue;
                    }
                }
            };
            self.send_frame(state, slot, &set, tiles, now, report);
        }
        report.outcome = TickOutcome::Served;
    }

    /// Whether one nominal frame interval has passed since the last send.
    fn dwell_elapsed(&self, state: &ServerState, now: Instant) -> bool {
        state
            .last_send_at()
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.frame_interval())
    }

    fn mode_installed(&self, capture: &mut CaptureController) -> bool {
        match capture.mode_is_current() {
            Ok(current) => current,
            Err(e) => {
                warn!(error = %e, "mode query failed");
                false
            }
        }
    }

    /// Re-read the video mode and install the new frame.
    ///
    /// Falls back to the placeholder when the engine has no usable signal.
    /// Returns whether a real frame is now mapped.
    fn reinitialize(
        &mut self,
        state: &mut ServerState,
        capture: &mut CaptureController,
        tiles: &mut TileEncoder,
        now: Instant,
        report: &mut TickReport,
    ) -> bool {
        self.last_reinit_attempt = Some(now);
        let frame = match capture.reinitialize() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "capture reinitialisation failed; serving placeholder frame");
                FrameSource::placeholder()
            }
        };
        if state.frame().is_placeholder() && frame.is_placeholder() {
            return false;
        }
        if let Err(e) = tiles.configure(&frame) {
            warn!(error = %e, "tile codec configuration failed; using software encoding");
        }
        let mapped = !frame.is_placeholder();

        let same_geometry =
            frame.width() == state.frame().width() && frame.height() == state.frame().height();
        if same_geometry {
            state.replace_frame(frame);
            return mapped;
        }
        state.apply_resize(frame);

        // viewers without DesktopSize cannot follow the new geometry
        for session in state.sessions_mut() {
            if session.is_open() && !session.caps().contains(ClientCaps::DESKTOP_SIZE) {
                warn!(conn = %session.conn(), "client cannot resize; closing");
                session.close();
                report.closed.push(session.conn());
            }
        }
        mapped
    }

    /// Answer due sessions that are owed a DesktopSize notification.
    fn send_desktop_sizes(
        &mut self,
        state: &mut ServerState,
        due: &[usize],
        now: Instant,
        report: &mut TickReport,
    ) {
        for &slot in due {
            let Some(session) = state.slot_mut(slot) else {
                continue;
            };
            if !session.is_due() {
                continue;
            }
            let Some((width, height)) = session.pending_resize() else {
                continue;
            };
            let conn = session.conn();
            match write_desktop_size(session, width, height) {
                Ok(bytes) => {
                    session.finish_resize();
                    session.record_sent(bytes, now);
                    report.updates.push(SentUpdate {
                        conn,
                        rects: 0,
                        full_frame: false,
                        desktop_size: true,
                        skipped: 0,
                        bytes,
                    });
                    debug!(%conn, width, height, "DesktopSize sent");
                }
                Err(e) => {
                    session.fail(&e);
                    report.closed.push(conn);
                }
            }
        }
    }

    /// Write one FramebufferUpdate built from `set`.
    fn send_frame(
        &mut self,
        state: &mut ServerState,
        slot: usize,
        set: &ChangeSet,
        tiles: &mut TileEncoder,
        now: Instant,
        report: &mut TickReport,
    ) {
        let use_last_rect = self.config.use_last_rect;
        let Some((frame, session)) = state.frame_and_slot_mut(slot) else {
            return;
        };
        let conn = session.conn();
        match emit_update(frame, session, set, tiles, use_last_rect, &mut self.scratch) {
            Ok(sent) => {
                session.record_sent(sent.bytes, now);
                if sent.skipped > 0 {
                    session.record_skipped(sent.skipped as u64);
                }
                trace!(%conn, rects = sent.rects, bytes = sent.bytes, full = set.is_full(), "update sent");
                self.meter.record_at(now, sent.bytes);
                if let Some(dump) = self.dump.as_mut() {
                    dump.record(sent.bytes);
                }
                state.note_send(now);
                report.updates.push(SentUpdate {
                    conn,
                    rects: sent.rects,
                    full_frame: set.is_full(),
                    desktop_size: false,
                    skipped: sent.skipped,
                    bytes: sent.bytes,
                });
            }
            Err(EmitError::Transport(e)) => {
                session.fail(&e);
                report.closed.push(conn);
            }
            Err(EmitError::Encode(e)) => {
                warn!(%conn, error = %e, "cannot encode for client; closing");
                session.close();
                report.closed.push(conn);
            }
        }
    }
}

// ── Emitting ─────────────────────────────────────────────────────

fn write_desktop_size(
    session: &mut ClientSession,
    width: u16,
    height: u16,
) -> Result<u64, TransportError> {
    let mut w = session.writer();
    w.begin_update(RectCount::Known(1))?;
    w.desktop_size(width, height)?;
    w.finish()
}

struct Emitted {
    rects: usize,
    skipped: usize,
    bytes: u64,
}

enum EmitError {
    Transport(TransportError),
    Encode(EncodeError),
}

impl From<TransportError> for EmitError {
    fn from(e: TransportError) -> Self {
        EmitError::Transport(e)
    }
}

impl From<EncodeError> for EmitError {
    fn from(e: EncodeError) -> Self {
        EmitError::Encode(e)
    }
}

/// Whether the tile codec's output can go to this client as-is.
fn hardware_path(frame: &FrameSource, session: &ClientSession, tiles: &TileEncoder) -> bool {
    let format = session.format();
    format.is_hardware_compatible()
        && !format.big_endian
        && format.layout == frame.layout()
        && session.caps().contains(ClientCaps::HEXTILE)
        && tiles.is_available()
}

fn emit_update(
    frame: &FrameSource,
    session: &mut ClientSession,
    set: &ChangeSet,
    tiles: &mut TileEncoder,
    use_last_rect: bool,
    scratch: &mut Vec<u8>,
) -> Result<Emitted, EmitError> {
    let translator = PixelTranslator::new(frame.pixel_format(), session.format())?;
    let soft_encoding = session.soft_encoding();
    let hardware = set.kind == ChangeKind::Diff && hardware_path(frame, session, tiles);
    let last_rect = use_last_rect && session.caps().contains(ClientCaps::LAST_RECT);

    // an exact count must fit in the header; otherwise send the whole frame
    let full = [frame.full_rect()];
    let rects: &[Rect] = match u16::try_from(set.len()) {
        Ok(n) if n < u16::MAX || last_rect => &set.rects,
        _ => &full,
    };
    let count = if last_rect {
        RectCount::Unknown
    } else {
        RectCount::Known(rects.len() as u16)
    };

    let mut written = 0;
    let mut skipped = 0;
    let mut w = session.writer();
    w.begin_update(count)?;
    for &rect in rects {
        if hardware {
            match tiles.encode_region(rect) {
                Ok(tile) => {
                    send_encoded_tile(&mut w, &tile)?;
                    written += 1;
                    continue;
                }
                Err(e) => {
                    warn!(?rect, error = %e, "tile encode failed");
                    if matches!(e, EncodeError::DeviceStalled { .. })
                        && let Err(e) = tiles.reset()
                    {
                        warn!(error = %e, "tile codec reset failed");
                    }
                    if last_rect {
                        skipped += 1;
                        continue;
                    }
                }
            }
        }
        soft_rect(&mut w, frame, rect, soft_encoding, &translator, scratch)?;
        written += 1;
    }
    if last_rect {
        w.last_rect()?;
    }
    let bytes = w.finish()?;
    Ok(Emitted {
        rects: written,
        skipped,
        bytes,
    })
}

fn soft_rect(
    w: &mut WireWriter<'_>,
    frame: &FrameSource,
    rect: Rect,
    encoding: SoftEncoding,
    translator: &PixelTranslator,
    scratch: &mut Vec<u8>,
) -> Result<(), EmitError> {
    scratch.clear();
    soft::encode_rect(encoding, frame, rect, translator, scratch)?;
    w.rect_header(rect, encoding.tag())?;
    w.payload(scratch)?;
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────
