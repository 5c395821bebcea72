//! Integration tests: whole-engine scenarios on fake devices, and a real
//! viewer handshake over TCP on localhost.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ikvm_core::rfb::device::CaptureCommand;
use ikvm_core::rfb::fake::{
    FakeCaptureDevice, FakeTileCodec, RecordingSink, ScriptedTransport, decode_updates,
};
use ikvm_core::rfb::scheduler::TickOutcome;
use ikvm_core::rfb::tcp::{MSG_SET_ENCODINGS, MSG_UPDATE_REQUEST};
use ikvm_core::rfb::transport::{ConnectionId, TransportEvent};
use ikvm_core::rfb::types::{PixelFormat, Rect};
use ikvm_core::rfb::wire::{
    ENCODING_DESKTOP_SIZE, ENCODING_HEXTILE, ENCODING_LAST_RECT, ENCODING_RAW,
};
use ikvm_core::{
    CaptureController, EventLoop, InputRelay, ResizeSignal, ServerConfig, TcpTransport,
    TileEncoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ── Helpers ──────────────────────────────────────────────────────

/// Full-frame updates go out as Raw to keep large scenarios cheap; diffs
/// still take the hardware Hextile path.
const VIEWER: &[i32] = &[
    ENCODING_RAW,
    ENCODING_HEXTILE,
    ENCODING_LAST_RECT,
    ENCODING_DESKTOP_SIZE,
];

/// Input relay that records what reached the "host".
#[derive(Clone, Default)]
struct RecordingInput {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingInput {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl InputRelay for RecordingInput {
    fn connect(&mut self) -> std::io::Result<()> {
        self.log.lock().unwrap().push("connect".into());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.log.lock().unwrap().push("disconnect".into());
    }

    fn key_event(&mut self, down: bool, keysym: u32) -> std::io::Result<()> {
        self.log.lock().unwrap().push(format!("key {down} {keysym:#x}"));
        Ok(())
    }

    fn pointer_event(&mut self, buttons: u8, x: u16, y: u16, _w: u16, _h: u16) -> std::io::Result<()> {
        self.log.lock().unwrap().push(format!("pointer {buttons} {x} {y}"));
        Ok(())
    }
}

struct Harness {
    el: EventLoop<ScriptedTransport>,
    transport: ScriptedTransport,
    dev: FakeCaptureDevice,
    input: RecordingInput,
    now: Instant,
}

impl Harness {
    fn new(width: u32, height: u32, config: ServerConfig) -> Self {
        let dev = FakeCaptureDevice::new(width, height);
        let transport = ScriptedTransport::new();
        let input = RecordingInput::default();
        let el = EventLoop::new(
            config.clone(),
            transport.clone(),
            CaptureController::new(Box::new(dev.clone())),
            TileEncoder::new(Box::new(FakeTileCodec::new()), config.encode_retry_limit),
            Box::new(input.clone()),
            ResizeSignal::new(),
        );
        Self {
            el,
            transport,
            dev,
            input,
            now: Instant::now(),
        }
    }

    /// Connect a viewer that advertises [`VIEWER`].
    fn connect(&self, id: u64) -> (Vec<TransportEvent>, RecordingSink) {
        let sink = RecordingSink::new();
        let events = vec![
            TransportEvent::Connected {
                conn: ConnectionId(id),
                sink: Box::new(sink.clone()),
            },
            TransportEvent::SetEncodings {
                conn: ConnectionId(id),
                encodings: VIEWER.to_vec(),
            },
        ];
        (events, sink)
    }

    /// One iteration, 40 ms after the previous one.
    async fn step(&mut self, events: Vec<TransportEvent>) -> ikvm_core::rfb::TickReport {
        self.now += Duration::from_millis(40);
        self.transport.push_batch(events);
        self.el.iterate_at(Some(self.now)).await
    }
}

fn request(id: u64) -> TransportEvent {
    TransportEvent::UpdateRequested {
        conn: ConnectionId(id),
        incremental: true,
        region: Rect::full(u16::MAX, u16::MAX),
    }
}

// ── Settle window ────────────────────────────────────────────────

#[tokio::test]
async fn test_settle_window_on_1080p_feed() {
    let mut h = Harness::new(1920, 1080, ServerConfig::default());
    let (mut events, sink) = h.connect(1);
    events.push(request(1));

    let report = h.step(events).await;
    assert!(report.updates[0].full_frame);
    assert_eq!(h.el.state().session(ConnectionId(1)).unwrap().backlog(), 29);
    let first = decode_updates(&sink.take(), 2).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].rects.len(), 1);
    assert_eq!(first[0].rects[0].rect, Rect::full(1920, 1080));

    for _ in 0..29 {
        let report = h.step(vec![request(1)]).await;
        assert_eq!(report.updates.len(), 1);
        assert!(report.updates[0].full_frame);
        sink.take();
    }
    assert_eq!(h.el.state().session(ConnectionId(1)).unwrap().backlog(), 0);

    h.dev.push_changes(vec![Rect::new(64, 32, 16, 16), Rect::new(0, 0, 16, 16)]);
    let report = h.step(vec![request(1)]).await;
    assert!(!report.updates[0].full_frame);
    let diff = decode_updates(&sink.take(), 2).unwrap();
    let rects: Vec<Rect> = diff[0].rects.iter().map(|r| r.rect).collect();
    assert_eq!(rects, vec![Rect::new(64, 32, 16, 16), Rect::new(0, 0, 16, 16)]);
    assert!(diff[0].rects.iter().all(|r| r.encoding == ENCODING_HEXTILE));

    let commands = h.dev.commands();
    assert_eq!(commands.len(), 31);
    assert!(commands[..30].iter().all(|&c| c == CaptureCommand::CaptureFrame));
    assert_eq!(commands[30], CaptureCommand::Compare);
}

// ── One update per request ───────────────────────────────────────

#[tokio::test]
async fn test_at_most_one_update_per_request() {
    let config = ServerConfig {
        settle_frames: 2,
        ..Default::default()
    };
    let mut h = Harness::new(64, 64, config);
    let (mut events, sink) = h.connect(1);
    events.push(request(1));
    h.step(events).await;

    // no new request: nothing more goes out
    for _ in 0..5 {
        assert!(h.step(Vec::new()).await.updates.is_empty());
    }
    // two requests in one batch are answered by a single update
    let report = h.step(vec![request(1), request(1)]).await;
    assert_eq!(report.updates.len(), 1);
    assert!(h.step(Vec::new()).await.updates.is_empty());
    assert_eq!(decode_updates(&sink.bytes(), 2).unwrap().len(), 2);
}

// ── Shared capture ───────────────────────────────────────────────

#[tokio::test]
async fn test_one_device_command_per_tick() {
    let config = ServerConfig {
        settle_frames: 0,
        ..Default::default()
    };
    let mut h = Harness::new(64, 64, config);
    let mut events = Vec::new();
    let mut sinks = Vec::new();
    for id in 1..=4 {
        let (ev, sink) = h.connect(id);
        events.extend(ev);
        events.push(request(id));
        sinks.push(sink);
    }
    let report = h.step(events).await;
    assert_eq!(report.updates.len(), 4);
    assert_eq!(h.dev.command_count(), 1);

    h.dev.push_changes(vec![Rect::new(8, 8, 8, 8)]);
    let report = h.step((1..=4).map(request).collect()).await;
    assert_eq!(report.updates.len(), 4);
    assert_eq!(h.dev.command_count(), 2);
    for sink in &sinks {
        let updates = decode_updates(&sink.bytes(), 2).unwrap();
        assert_eq!(updates[1].rects[0].rect, Rect::new(8, 8, 8, 8));
    }
}

// ── Primary promotion ────────────────────────────────────────────

#[tokio::test]
async fn test_primary_promotion_keeps_video_flowing() {
    let config = ServerConfig {
        settle_frames: 0,
        ..Default::default()
    };
    let mut h = Harness::new(64, 64, config);
    let (mut events, _a) = h.connect(1);
    let (b_events, b) = h.connect(2);
    events.extend(b_events);
    events.extend([request(1), request(2)]);
    let report = h.step(events).await;
    assert_eq!(report.driver, Some(ConnectionId(1)));

    // view-only input is dropped
    h.step(vec![TransportEvent::Key {
        conn: ConnectionId(2),
        down: true,
        keysym: 0x61,
    }])
    .await;
    assert_eq!(h.input.log(), vec!["connect"]);

    h.dev.push_changes(vec![Rect::new(0, 0, 16, 16)]);
    let report = h
        .step(vec![TransportEvent::Closed { conn: ConnectionId(1) }, request(2)])
        .await;
    assert_eq!(report.driver, Some(ConnectionId(2)));
    assert!(h.el.state().session(ConnectionId(2)).unwrap().is_primary());

    // B's second update continues from the change set it last saw
    let updates = decode_updates(&b.bytes(), 2).unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].rects[0].rect, Rect::new(0, 0, 16, 16));

    h.step(vec![TransportEvent::Pointer {
        conn: ConnectionId(2),
        buttons: 1,
        x: 10,
        y: 20,
    }])
    .await;
    h.step(vec![TransportEvent::Closed { conn: ConnectionId(2) }]).await;
    assert_eq!(h.input.log(), vec!["connect", "pointer 1 10 20", "disconnect"]);
}

// ── Resolution change ────────────────────────────────────────────

#[tokio::test]
async fn test_resize_with_three_due_clients() {
    let config = ServerConfig {
        settle_frames: 4,
        ..Default::default()
    };
    let mut h = Harness::new(640, 480, config);
    let mut events = Vec::new();
    let mut sinks = Vec::new();
    for id in 1..=3 {
        let (ev, sink) = h.connect(id);
        events.extend(ev);
        events.push(request(id));
        sinks.push(sink);
    }
    h.step(events).await;
    for sink in &sinks {
        sink.take();
    }
    let commands_before = h.dev.command_count();

    h.dev.change_resolution(800, 600);
    let report = h.step((1..=3).map(request).collect()).await;
    assert_eq!(report.outcome, TickOutcome::Resized);
    assert_eq!(report.updates.len(), 3);
    assert!(report.updates.iter().all(|u| u.desktop_size && u.rects == 0));
    assert_eq!(h.dev.command_count(), commands_before);
    for sink in &sinks {
        let updates = decode_updates(&sink.take(), 2).unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_desktop_size());
        assert_eq!(updates[0].rects[0].rect, Rect::full(800, 600));
    }
    assert!(h.el.state().sessions().all(|s| s.backlog() == 4));

    // new geometry is announced to later viewers
    let published = h.transport.published();
    let last = published.last().unwrap();
    assert_eq!((last.width, last.height), (800, 600));

    let report = h.step((1..=3).map(request).collect()).await;
    assert!(report.updates.iter().all(|u| u.full_frame));
    for sink in &sinks {
        let updates = decode_updates(&sink.take(), 2).unwrap();
        assert_eq!(updates[0].rects[0].rect, Rect::full(800, 600));
    }
}

// ── Lost video ───────────────────────────────────────────────────

#[tokio::test]
async fn test_no_signal_serves_placeholder_geometry() {
    let dev = FakeCaptureDevice::new(0, 0);
    let transport = ScriptedTransport::new();
    let el = EventLoop::new(
        ServerConfig::default(),
        transport.clone(),
        CaptureController::new(Box::new(dev)),
        TileEncoder::new(Box::new(FakeTileCodec::new()), 8),
        Box::new(RecordingInput::default()),
        ResizeSignal::new(),
    );
    assert!(el.state().frame().is_placeholder());
    let published = transport.published();
    assert_eq!((published[0].width, published[0].height), (320, 240));
}

// ── TCP ──────────────────────────────────────────────────────────

async fn read_server_init(stream: &mut TcpStream) -> (u16, u16, PixelFormat, String) {
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await.unwrap();
    assert_eq!(&version, b"RFB 003.008\n");
    stream.write_all(b"RFB 003.008\n").await.unwrap();

    let mut types = [0u8; 2];
    stream.read_exact(&mut types).await.unwrap();
    assert_eq!(types, [1, 1]);
    stream.write_all(&[1]).await.unwrap();
    assert_eq!(stream.read_u32().await.unwrap(), 0);

    stream.write_all(&[1]).await.unwrap();
    let width = stream.read_u16().await.unwrap();
    let height = stream.read_u16().await.unwrap();
    let mut pf = [0u8; PixelFormat::SIZE];
    stream.read_exact(&mut pf).await.unwrap();
    let len = stream.read_u32().await.unwrap();
    let mut name = vec![0u8; len as usize];
    stream.read_exact(&mut name).await.unwrap();
    (width, height, PixelFormat::decode(&pf), String::from_utf8(name).unwrap())
}

#[tokio::test]
async fn test_tcp_viewer_receives_first_frame() {
    let config = ServerConfig::default();
    let transport = TcpTransport::bind("127.0.0.1:0", &config).await.unwrap();
    let addr = transport.local_addr();
    let mut el = EventLoop::new(
        config,
        transport,
        CaptureController::new(Box::new(FakeCaptureDevice::new(64, 48))),
        TileEncoder::new(Box::new(FakeTileCodec::new()), 8),
        Box::new(RecordingInput::default()),
        ResizeSignal::new(),
    );
    let stop = el.stop_handle();
    let server = tokio::spawn(async move {
        el.run().await;
        el
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (width, height, format, name) = read_server_init(&mut client).await;
    assert_eq!((width, height), (64, 48));
    assert_eq!(format, PixelFormat::RGB565);
    assert_eq!(name, "OpenBMC IKVM");

    let mut msg = vec![MSG_SET_ENCODINGS, 0, 0, 2];
    msg.extend_from_slice(&ENCODING_RAW.to_be_bytes());
    msg.extend_from_slice(&ENCODING_DESKTOP_SIZE.to_be_bytes());
    msg.extend_from_slice(&[MSG_UPDATE_REQUEST, 0, 0, 0, 0, 0, 0, 64, 0, 48]);
    client.write_all(&msg).await.unwrap();

    let update = tokio::time::timeout(Duration::from_secs(5), async {
        let mut header = [0u8; 4 + 12];
        client.read_exact(&mut header).await.unwrap();
        let mut payload = vec![0u8; 64 * 48 * 2];
        client.read_exact(&mut payload).await.unwrap();
        header
    })
    .await
    .expect("timeout");
    assert_eq!(update[0], 0);
    assert_eq!(u16::from_be_bytes([update[2], update[3]]), 1);
    assert_eq!(&update[4..12], &[0, 0, 0, 0, 0, 64, 0, 48]);
    assert_eq!(i32::from_be_bytes([update[12], update[13], update[14], update[15]]), ENCODING_RAW);

    stop.store(false, Ordering::SeqCst);
    let el = server.await.unwrap();
    assert_eq!(el.state().len(), 1);
}

#[tokio::test]
async fn test_tcp_protocol_violation_drops_viewer() {
    let config = ServerConfig::default();
    let transport = TcpTransport::bind("127.0.0.1:0", &config).await.unwrap();
    let addr = transport.local_addr();
    let mut el = EventLoop::new(
        config,
        transport,
        CaptureController::new(Box::new(FakeCaptureDevice::new(32, 32))),
        TileEncoder::new(Box::new(FakeTileCodec::new()), 8),
        Box::new(RecordingInput::default()),
        ResizeSignal::new(),
    );
    let stop = el.stop_handle();
    let server = tokio::spawn(async move {
        el.run().await;
        el
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    read_server_init(&mut client).await;
    client.write_all(&[99, 0, 0, 0]).await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("timeout")
        .unwrap_or(0);
    assert_eq!(n, 0);

    stop.store(false, Ordering::SeqCst);
    let el = server.await.unwrap();
    assert!(el.state().is_empty());
}
