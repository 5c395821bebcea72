//! Process-wide server state, owned by the event loop.

use std::time::Instant;

use tracing::info;

use crate::config::ServerConfig;
use crate::rfb::session::{ClientSession, SessionPhase};
use crate::rfb::transport::ConnectionId;
use crate::rfb::types::FrameSource;
use crate::rfb::wire::FrameSink;

/// What happened when a session was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub conn: ConnectionId,
    pub was_primary: bool,
    /// Session that took over as primary, if any.
    pub promoted: Option<ConnectionId>,
    /// No sessions remain.
    pub now_empty: bool,
}

/// The current frame and the bounded table of connected sessions.
pub struct ServerState {
    frame: FrameSource,
    slots: Vec<Option<ClientSession>>,
    next_order: u64,
    settle_frames: u32,
    out_capacity: usize,
    /// When any session was last sent a frame.
    last_send_at: Option<Instant>,
    /// Bumped on every mode change.
    generation: u64,
}

impl ServerState {
    pub fn new(frame: FrameSource, config: &ServerConfig) -> Self {
        Self {
            frame,
            slots: (0..config.max_clients.max(1)).map(|_| None).collect(),
            next_order: 0,
            settle_frames: config.settle_frames,
            out_capacity: config.update_buf_size,
            last_send_at: None,
            generation: 0,
        }
    }

    pub fn frame(&self) -> &FrameSource {
        &self.frame
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn settle_frames(&self) -> u32 {
        self.settle_frames
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_send_at(&self) -> Option<Instant> {
        self.last_send_at
    }

    pub fn note_send(&mut self, now: Instant) {
        self.last_send_at = Some(now);
    }

    // ── Sessions ─────────────────────────────────────────────────

    /// Admit a new connection into the lowest free slot.
    ///
    /// Returns `None` when every slot is taken. The first session of a
    /// generation becomes primary.
    pub fn accept(&mut self, conn: ConnectionId, sink: Box<dyn FrameSink>) -> Option<usize> {
        let slot = self.slots.iter().position(Option::is_none)?;
        let primary = self.primary().is_none();
        let order = self.next_order;
        self.next_order += 1;
        self.slots[slot] = Some(ClientSession::new(
            conn,
            slot,
            order,
            sink,
            self.frame.pixel_format(),
            primary,
            self.settle_frames,
            self.out_capacity,
        ));
        info!(%conn, slot, primary, clients = self.len(), "client connected");
        Some(slot)
    }

    /// Tear a session down and free its slot.
    ///
    /// Losing the primary promotes the oldest remaining session.
    pub fn remove(&mut self, conn: ConnectionId) -> Option<Departure> {
        let slot = self.slot_of(conn)?;
        let mut session = self.slots[slot].take()?;
        session.mark_gone();
        let was_primary = session.is_primary();

        let promoted = if was_primary {
            self.sessions_mut()
                .filter(|s| s.is_open())
                .min_by_key(|s| s.order())
                .map(|s| {
                    s.promote();
                    s.conn()
                })
        } else {
            None
        };
        let now_empty = self.is_empty();
        info!(%conn, slot, was_primary, promoted = ?promoted, clients = self.len(), "client disconnected");
        Some(Departure {
            conn,
            was_primary,
            promoted,
            now_empty,
        })
    }

    fn slot_of(&self, conn: ConnectionId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.conn() == conn))
    }

    pub fn session(&self, conn: ConnectionId) -> Option<&ClientSession> {
        self.sessions().find(|s| s.conn() == conn)
    }

    pub fn session_mut(&mut self, conn: ConnectionId) -> Option<&mut ClientSession> {
        self.sessions_mut().find(|s| s.conn() == conn)
    }

    pub fn slot(&self, slot: usize) -> Option<&ClientSession> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut ClientSession> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// The current frame alongside one session, for encoding.
    pub fn frame_and_slot_mut(&mut self, slot: usize) -> Option<(&FrameSource, &mut ClientSession)> {
        let session = self.slots.get_mut(slot)?.as_mut()?;
        Some((&self.frame, session))
    }

    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.slots.iter().flatten()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.slots.iter_mut().flatten()
    }

    pub fn primary(&self) -> Option<&ClientSession> {
        self.sessions().find(|s| s.is_primary() && s.is_open())
    }

    /// Slots of open sessions, oldest connection first.
    pub fn slots_in_order(&self) -> Vec<usize> {
        let mut open: Vec<&ClientSession> = self.sessions().filter(|s| s.is_open()).collect();
        open.sort_by_key(|s| s.order());
        open.into_iter().map(ClientSession::slot).collect()
    }

    /// Slots of sessions with an unanswered request, oldest first.
    pub fn due_slots(&self) -> Vec<usize> {
        self.slots_in_order()
            .into_iter()
            .filter(|&slot| self.slot(slot).is_some_and(ClientSession::is_due))
            .collect()
    }

    /// Sessions that failed this tick and must be dropped.
    pub fn closing(&self) -> Vec<ConnectionId> {
        self.sessions()
            .filter(|s| s.phase() == SessionPhase::Closing)
            .map(ClientSession::conn)
            .collect()
    }

    // ── Mode changes ─────────────────────────────────────────────

    /// Install a new frame and restart every session's settle window.
    pub fn apply_resize(&mut self, frame: FrameSource) {
        let (width, height) = (frame.width(), frame.height());
        self.frame = frame;
        self.generation += 1;
        let settle = self.settle_frames;
        for s in self.sessions_mut() {
            s.begin_resize(width, height, settle);
        }
        info!(width, height, generation = self.generation, "frame geometry changed");
    }

    /// Swap the frame without notifying sessions (same geometry).
    pub fn replace_frame(&mut self, frame: FrameSource) {
        self.frame = frame;
        self.generation += 1;
        let settle = self.settle_frames;
        for s in self.sessions_mut() {
            s.refresh.reset(settle);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::fake::RecordingSink;

    fn state(max: usize) -> ServerState {
        let config = ServerConfig {
            max_clients: max,
            ..Default::default()
        };
        ServerState::new(FrameSource::placeholder(), &config)
    }

    fn add(st: &mut ServerState, id: u64) -> Option<usize> {
        st.accept(ConnectionId(id), Box::new(RecordingSink::new()))
    }

    #[test]
    fn first_session_is_primary() {
        let mut st = state(4);
        add(&mut st, 1);
        add(&mut st, 2);
        assert!(st.session(ConnectionId(1)).unwrap().is_primary());
        assert!(st.session(ConnectionId(2)).unwrap().is_view_only());
        assert_eq!(st.session(ConnectionId(2)).unwrap().backlog(), 30);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut st = state(2);
        assert_eq!(add(&mut st, 1), Some(0));
        assert_eq!(add(&mut st, 2), Some(1));
        assert_eq!(add(&mut st, 3), None);
        assert_eq!(st.len(), 2);
    }

    #[test]
    fn slots_are_reused_after_teardown() {
        let mut st = state(3);
        add(&mut st, 1);
        add(&mut st, 2);
        add(&mut st, 3);
        st.remove(ConnectionId(2));
        assert_eq!(add(&mut st, 4), Some(1));
        // connection order, not slot order
        let order: Vec<u64> = st
            .slots_in_order()
            .into_iter()
            .map(|slot| st.slot(slot).unwrap().conn().0)
            .collect();
        assert_eq!(order, vec![1, 3, 4]);
    }

    #[test]
    fn losing_primary_promotes_oldest() {
        let mut st = state(4);
        add(&mut st, 1);
        add(&mut st, 2);
        add(&mut st, 3);
        let d = st.remove(ConnectionId(1)).unwrap();
        assert!(d.was_primary);
        assert_eq!(d.promoted, Some(ConnectionId(2)));
        assert!(!d.now_empty);
        assert!(st.session(ConnectionId(2)).unwrap().is_primary());
    }

    #[test]
    fn last_departure_empties() {
        let mut st = state(4);
        add(&mut st, 1);
        let d = st.remove(ConnectionId(1)).unwrap();
        assert!(d.now_empty);
        assert_eq!(d.promoted, None);
        assert!(st.remove(ConnectionId(1)).is_none());
    }

    #[test]
    fn resize_marks_every_session() {
        let mut st = state(4);
        add(&mut st, 1);
        add(&mut st, 2);
        st.apply_resize(FrameSource::placeholder());
        assert!(st.sessions().all(|s| s.pending_resize() == Some((320, 240))));
        assert_eq!(st.generation(), 1);
    }
}
