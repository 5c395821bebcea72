//! The cooperative driver.
//!
//! One task runs [`EventLoop::run`]: poll the transport with a bounded
//! timeout, apply connection and client-message events, run one scheduler
//! tick, then drop whatever the tick gave up on. Shutdown is cooperative:
//! clearing the running flag ends the loop after the current iteration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::rfb::capture::CaptureController;
use crate::rfb::input::InputRelay;
use crate::rfb::monitor::ResizeSignal;
use crate::rfb::scheduler::{TickReport, UpdateScheduler};
use crate::rfb::state::ServerState;
use crate::rfb::tile::TileEncoder;
use crate::rfb::transport::{ConnectionId, Transport, TransportEvent};
use crate::rfb::types::{FrameSource, ScreenInfo};

pub struct EventLoop<T: Transport> {
    transport: T,
    state: ServerState,
    capture: CaptureController,
    tiles: TileEncoder,
    scheduler: UpdateScheduler,
    input: Box<dyn InputRelay>,
    input_connected: bool,
    signal: ResizeSignal,
    running: Arc<AtomicBool>,
    desktop_name: String,
    poll_timeout: std::time::Duration,
    published_generation: u64,
    iterations: u64,
}

impl<T: Transport> EventLoop<T> {
    /// Map the current video mode and announce it on the transport.
    ///
    /// A capture engine without signal yields the placeholder frame.
    pub fn new(
        config: ServerConfig,
        mut transport: T,
        mut capture: CaptureController,
        mut tiles: TileEncoder,
        input: Box<dyn InputRelay>,
        signal: ResizeSignal,
    ) -> Self {
        let config = config.sanitized();
        let frame = capture.reinitialize().unwrap_or_else(|e| {
            warn!(error = %e, "no usable video at startup; serving placeholder frame");
            FrameSource::placeholder()
        });
        if let Err(e) = tiles.configure(&frame) {
            warn!(error = %e, "tile codec configuration failed; using software encoding");
        }
        transport.publish_screen(ScreenInfo::from_frame(&frame, &config.desktop_name));

        let state = ServerState::new(frame, &config);
        Self {
            transport,
            published_generation: state.generation(),
            state,
            capture,
            tiles,
            desktop_name: config.desktop_name.clone(),
            poll_timeout: config.poll_timeout(),
            scheduler: UpdateScheduler::new(config),
            input,
            input_connected: false,
            signal,
            running: Arc::new(AtomicBool::new(true)),
            iterations: 0,
        }
    }

    /// Clearing the flag stops [`run`](Self::run) after the current iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }

    pub fn signal(&self) -> &ResizeSignal {
        &self.signal
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn input_connected(&self) -> bool {
        self.input_connected
    }

    /// Run until stopped.
    pub async fn run(&mut self) {
        info!(timeout_us = self.poll_timeout.as_micros() as u64, "event loop started");
        while self.is_running() {
            self.iterate().await;
        }
        if self.input_connected {
            self.input.disconnect();
            self.input_connected = false;
        }
        info!(iterations = self.iterations, "event loop stopped");
    }

    /// One poll-and-tick iteration.
    pub async fn iterate(&mut self) -> TickReport {
        self.iterate_at(None).await
    }

    /// Like [`iterate`](Self::iterate) with an explicit tick timestamp.
    pub async fn iterate_at(&mut self, now: Option<Instant>) -> TickReport {
        self.iterations += 1;
        let events = self.transport.poll(self.poll_timeout).await;
        for event in events {
            self.handle_event(event);
        }

        let report = self.scheduler.tick(
            &mut self.state,
            &mut self.capture,
            &mut self.tiles,
            &self.signal,
            now.unwrap_or_else(Instant::now),
        );

        if self.state.generation() != self.published_generation {
            self.published_generation = self.state.generation();
            let info = ScreenInfo::from_frame(self.state.frame(), &self.desktop_name);
            self.transport.publish_screen(info);
        }

        for conn in self.state.closing() {
            self.disconnect(conn);
            self.transport.close(conn);
        }
        report
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { conn, sink } => {
                if self.state.accept(conn, sink).is_none() {
                    warn!(%conn, max = self.state.capacity(), "client limit reached; refusing");
                    self.transport.close(conn);
                    return;
                }
                if !self.input_connected {
                    match self.input.connect() {
                        Ok(()) => self.input_connected = true,
                        Err(e) => warn!(error = %e, "input relay unavailable"),
                    }
                }
            }
            TransportEvent::Closed { conn } => self.disconnect(conn),
            TransportEvent::UpdateRequested {
                conn, incremental, ..
            } => {
                if let Some(session) = self.state.session_mut(conn) {
                    session.request_update(incremental);
                }
            }
            TransportEvent::SetPixelFormat { conn, format } => {
                if let Some(session) = self.state.session_mut(conn)
                    && let Err(e) = session.set_pixel_format(format)
                {
                    warn!(%conn, error = %e, "unusable pixel format; closing");
                    session.close();
                }
            }
            TransportEvent::SetEncodings { conn, encodings } => {
                if let Some(session) = self.state.session_mut(conn) {
                    session.set_encodings(encodings);
                }
            }
            TransportEvent::Key { conn, down, keysym } => {
                if !self.relay_allowed(conn) {
                    return;
                }
                if let Err(e) = self.input.key_event(down, keysym) {
                    warn!(%conn, error = %e, "key event not delivered");
                }
            }
            TransportEvent::Pointer {
                conn,
                buttons,
                x,
                y,
            } => {
                if !self.relay_allowed(conn) {
                    return;
                }
                let (width, height) = (self.state.frame().width(), self.state.frame().height());
                if let Err(e) = self.input.pointer_event(buttons, x, y, width, height) {
                    warn!(%conn, error = %e, "pointer event not delivered");
                }
            }
            TransportEvent::CutText { conn, len } => {
                debug!(%conn, len, "clipboard text ignored");
            }
        }
    }

    /// Input reaches the host only from the primary session.
    fn relay_allowed(&mut self, conn: ConnectionId) -> bool {
        self.input_connected
            && self
                .state
                .session_mut(conn)
                .is_some_and(|session| session.accept_input())
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        let Some(departure) = self.state.remove(conn) else {
            return;
        };
        if let Some(primary) = departure.promoted {
            info!(%primary, "promoted to primary");
        }
        if departure.now_empty && self.input_connected {
            self.input.disconnect();
            self.input_connected = false;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::fake::{FakeCaptureDevice, FakeTileCodec, ScriptedTransport, connect, request};
    use crate::rfb::input::NullInput;

    fn event_loop(dev: &FakeCaptureDevice, transport: &ScriptedTransport) -> EventLoop<ScriptedTransport> {
        let config = ServerConfig {
            settle_frames: 1,
            ..Default::default()
        };
        EventLoop::new(
            config,
            transport.clone(),
            CaptureController::new(Box::new(dev.clone())),
            TileEncoder::new(Box::new(FakeTileCodec::new()), 4),
            Box::new(NullInput),
            ResizeSignal::new(),
        )
    }

    #[tokio::test]
    async fn publishes_screen_at_startup() {
        let dev = FakeCaptureDevice::new(800, 600);
        let transport = ScriptedTransport::new();
        let el = event_loop(&dev, &transport);
        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!((published[0].width, published[0].height), (800, 600));
        assert!(el.is_running());
    }

    #[tokio::test]
    async fn connect_request_update() {
        let dev = FakeCaptureDevice::new(64, 64);
        let transport = ScriptedTransport::new();
        let mut el = event_loop(&dev, &transport);

        let (ev, sink) = connect(1);
        transport.push_batch(vec![ev, request(1)]);
        let report = el.iterate().await;
        assert_eq!(report.updates.len(), 1);
        assert_eq!(sink.updates(2).unwrap().len(), 1);
        assert!(el.input_connected());
    }

    #[tokio::test]
    async fn closed_primary_promotes_and_last_close_drops_input() {
        let dev = FakeCaptureDevice::new(64, 64);
        let transport = ScriptedTransport::new();
        let mut el = event_loop(&dev, &transport);

        let (a, _) = connect(1);
        let (b, _) = connect(2);
        transport.push_batch(vec![a, b]);
        el.iterate().await;

        transport.push_batch(vec![TransportEvent::Closed { conn: ConnectionId(1) }]);
        el.iterate().await;
        assert!(el.state().session(ConnectionId(2)).unwrap().is_primary());
        assert!(el.input_connected());

        transport.push_batch(vec![TransportEvent::Closed { conn: ConnectionId(2) }]);
        el.iterate().await;
        assert!(!el.input_connected());
    }

    #[tokio::test]
    async fn over_capacity_is_refused() {
        let dev = FakeCaptureDevice::new(64, 64);
        let transport = ScriptedTransport::new();
        let config = ServerConfig {
            max_clients: 1,
            ..Default::default()
        };
        let mut el = EventLoop::new(
            config,
            transport.clone(),
            CaptureController::new(Box::new(dev.clone())),
            TileEncoder::unavailable(4),
            Box::new(NullInput),
            ResizeSignal::new(),
        );
        let (a, _) = connect(1);
        let (b, _) = connect(2);
        transport.push_batch(vec![a, b]);
        el.iterate().await;
        assert_eq!(el.state().len(), 1);
        assert_eq!(transport.closed(), vec![ConnectionId(2)]);
    }

    #[tokio::test]
    async fn stop_handle_ends_run() {
        let dev = FakeCaptureDevice::new(64, 64);
        let transport = ScriptedTransport::new();
        let mut el = event_loop(&dev, &transport);
        el.stop_handle().store(false, Ordering::SeqCst);
        el.run().await;
        assert_eq!(el.iterations(), 0);
    }
}
