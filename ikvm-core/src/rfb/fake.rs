//! In-memory stand-ins for the hardware and the socket layer.
//!
//! The fakes are deterministic and scriptable: tests queue change lists,
//! resolution changes and codec failures, then inspect what the engine
//! commanded and what reached each client. The server's simulation mode
//! runs on the same fakes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{CaptureError, EncodeError, TransportError};
use crate::rfb::device::{CaptureCommand, CaptureDevice, CaptureInfo, TileCodecDevice, TileInfo};
use crate::rfb::transport::{ConnectionId, Transport, TransportEvent};
use crate::rfb::types::{ChannelLayout, MappedFrame, Rect, ScreenInfo};
use crate::rfb::wire::{
    ENCODING_DESKTOP_SIZE, ENCODING_HEXTILE, ENCODING_LAST_RECT, ENCODING_RAW, FrameSink,
    RECT_COUNT_UNKNOWN,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// RGB565 gradient used as the fake capture content.
fn test_pattern(width: u32, height: u32) -> Arc<[u8]> {
    let mut data = Vec::with_capacity((width * height * 2) as usize);
    for y in 0..height {
        for x in 0..width {
            let r = x * 31 / width.max(1);
            let g = y * 63 / height.max(1);
            let b = (x ^ y) & 31;
            let px = ((r << 11) | (g << 5) | b) as u16;
            data.extend_from_slice(&px.to_le_bytes());
        }
    }
    data.into()
}

// ── FakeCaptureDevice ────────────────────────────────────────────

struct CaptureScript {
    width: u32,
    height: u32,
    frame: Arc<[u8]>,
    signal: bool,
    res_changed: bool,
    fail_commands: bool,
    changes: VecDeque<Vec<Rect>>,
    cycle: bool,
    cycle_pos: u32,
    pending: VecDeque<Rect>,
    commands: Vec<CaptureCommand>,
}

/// Scriptable capture engine. Clones share state, so a test can keep a
/// handle while the engine owns the device.
#[derive(Clone)]
pub struct FakeCaptureDevice {
    script: Arc<Mutex<CaptureScript>>,
}

impl FakeCaptureDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            script: Arc::new(Mutex::new(CaptureScript {
                width,
                height,
                frame: test_pattern(width, height),
                signal: true,
                res_changed: false,
                fail_commands: false,
                changes: VecDeque::new(),
                cycle: false,
                cycle_pos: 0,
                pending: VecDeque::new(),
                commands: Vec::new(),
            })),
        }
    }

    /// A device whose compares report a block sweeping across the screen.
    pub fn simulated(width: u32, height: u32) -> Self {
        let dev = Self::new(width, height);
        lock(&dev.script).cycle = true;
        dev
    }

    /// Queue the change list returned by the next unscripted COMPARE.
    pub fn push_changes(&self, rects: Vec<Rect>) {
        lock(&self.script).changes.push_back(rects);
    }

    /// Switch video mode and raise the resolution-changed flag.
    pub fn change_resolution(&self, width: u32, height: u32) {
        let mut s = lock(&self.script);
        s.width = width;
        s.height = height;
        s.frame = test_pattern(width, height);
        s.res_changed = true;
    }

    /// Simulate the host's video output going away or coming back.
    pub fn set_signal(&self, present: bool) {
        lock(&self.script).signal = present;
    }

    pub fn fail_commands(&self, fail: bool) {
        lock(&self.script).fail_commands = fail;
    }

    pub fn commands(&self) -> Vec<CaptureCommand> {
        lock(&self.script).commands.clone()
    }

    pub fn command_count(&self) -> usize {
        lock(&self.script).commands.len()
    }

    pub fn resolution(&self) -> (u32, u32) {
        let s = lock(&self.script);
        (s.width, s.height)
    }
}

impl CaptureDevice for FakeCaptureDevice {
    fn send_command(&mut self, cmd: CaptureCommand) -> Result<(), CaptureError> {
        let mut s = lock(&self.script);
        if s.fail_commands {
            return Err(CaptureError::Io(std::io::Error::other("injected command failure")));
        }
        s.commands.push(cmd);
        s.pending.clear();
        if cmd == CaptureCommand::Compare {
            let rects = match s.changes.pop_front() {
                Some(rects) => rects,
                None if s.cycle => {
                    let block = 64u32;
                    let cols = (s.width / block).max(1);
                    let rows = (s.height / block).max(1);
                    let pos = s.cycle_pos % (cols * rows);
                    s.cycle_pos = s.cycle_pos.wrapping_add(1);
                    let x = (pos % cols) * block;
                    let y = (pos / cols) * block;
                    vec![Rect::new(
                        x as u16,
                        y as u16,
                        block.min(s.width) as u16,
                        block.min(s.height) as u16,
                    )]
                }
                None => Vec::new(),
            };
            s.pending.extend(rects);
        }
        Ok(())
    }

    fn resolution_changed(&mut self) -> Result<bool, CaptureError> {
        let mut s = lock(&self.script);
        Ok(std::mem::take(&mut s.res_changed))
    }

    fn info(&mut self) -> Result<CaptureInfo, CaptureError> {
        let s = lock(&self.script);
        let (width, height) = if s.signal { (s.width, s.height) } else { (0, 0) };
        Ok(CaptureInfo {
            fb_addr: 0x3e20_0000,
            width,
            height,
            line_pitch: width * 2,
            bytes_per_pixel: 2,
            layout: ChannelLayout::RGB565,
            refresh_rate: 60,
        })
    }

    fn change_count(&mut self) -> Result<usize, CaptureError> {
        Ok(lock(&self.script).pending.len())
    }

    fn next_change(&mut self) -> Result<Rect, CaptureError> {
        lock(&self.script)
            .pending
            .pop_front()
            .ok_or_else(|| CaptureError::DeviceUnavailable("change list exhausted".into()))
    }

    fn map_frame(&mut self, len: usize) -> Result<Box<dyn MappedFrame>, CaptureError> {
        let s = lock(&self.script);
        if !s.signal || len > s.frame.len() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "cannot map {len} bytes"
            )));
        }
        Ok(Box::new(Arc::clone(&s.frame)))
    }
}

// ── FakeTileCodec ────────────────────────────────────────────────

#[derive(Default)]
struct CodecScript {
    unavailable: bool,
    stalled: bool,
    degenerate_next: u32,
    encodes: usize,
    clears: usize,
    fb_addr: Option<u32>,
    line_pitch: Option<u32>,
}

/// Test handle onto a [`FakeTileCodec`].
#[derive(Clone)]
pub struct CodecControl(Arc<Mutex<CodecScript>>);

impl CodecControl {
    /// Return a degenerate (1 byte) result for the next `n` encodes.
    pub fn degenerate_next(&self, n: u32) {
        lock(&self.0).degenerate_next = n;
    }

    /// Make every encode return an empty result.
    pub fn stall(&self, stalled: bool) {
        lock(&self.0).stalled = stalled;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.0).unavailable = unavailable;
    }

    pub fn encode_calls(&self) -> usize {
        lock(&self.0).encodes
    }

    pub fn clear_calls(&self) -> usize {
        lock(&self.0).clears
    }

    pub fn line_pitch(&self) -> Option<u32> {
        lock(&self.0).line_pitch
    }

    pub fn fb_addr(&self) -> Option<u32> {
        lock(&self.0).fb_addr
    }
}

/// Tile codec that writes valid Hextile data into its output window.
///
/// Each encoded rectangle is one background-specified tile followed by
/// tiles that reuse that background, so any Hextile decoder accepts it.
pub struct FakeTileCodec {
    window: Vec<u8>,
    offset: u32,
    script: Arc<Mutex<CodecScript>>,
}

impl FakeTileCodec {
    pub fn new() -> Self {
        Self {
            window: Vec::new(),
            offset: 0,
            script: Arc::new(Mutex::new(CodecScript::default())),
        }
    }

    pub fn control(&self) -> CodecControl {
        CodecControl(Arc::clone(&self.script))
    }

    /// The bytes this codec produces for `rect`.
    pub fn payload_for(rect: Rect) -> Vec<u8> {
        let tiles = usize::from(rect.w.div_ceil(16)) * usize::from(rect.h.div_ceil(16));
        let colour = rect.x.wrapping_mul(7) ^ rect.y.wrapping_mul(13);
        let mut data = Vec::with_capacity(tiles + 2);
        data.push(0x02);
        data.extend_from_slice(&colour.to_le_bytes());
        data.resize(tiles + 2, 0);
        data
    }
}

impl Default for FakeTileCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TileCodecDevice for FakeTileCodec {
    fn set_framebuffer(&mut self, fb_addr: u32) -> Result<(), EncodeError> {
        lock(&self.script).fb_addr = Some(fb_addr);
        Ok(())
    }

    fn set_line_pitch(&mut self, line_pitch: u32) -> Result<(), EncodeError> {
        lock(&self.script).line_pitch = Some(line_pitch);
        Ok(())
    }

    fn offset(&mut self) -> Result<u32, EncodeError> {
        Ok(self.offset)
    }

    fn clear_offset(&mut self) -> Result<(), EncodeError> {
        lock(&self.script).clears += 1;
        self.offset = 0;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EncodeError> {
        self.offset = 0;
        Ok(())
    }

    fn encode(&mut self, rect: Rect) -> Result<TileInfo, EncodeError> {
        let mut s = lock(&self.script);
        if s.unavailable || self.window.is_empty() {
            return Err(EncodeError::DeviceUnavailable("fake codec not mapped".into()));
        }
        s.encodes += 1;
        if s.stalled {
            return Ok(TileInfo { len: 0, gap_len: 0 });
        }
        if s.degenerate_next > 0 {
            s.degenerate_next -= 1;
            return Ok(TileInfo { len: 1, gap_len: 0 });
        }
        drop(s);

        let data = Self::payload_for(rect);
        let start = self.offset as usize;
        if let Some(dst) = self.window.get_mut(start..start + data.len()) {
            dst.copy_from_slice(&data);
        }
        self.offset += data.len() as u32;
        Ok(TileInfo {
            len: data.len() as u32,
            gap_len: 0,
        })
    }

    fn map_output(&mut self, len: usize) -> Result<(), EncodeError> {
        self.window = vec![0; len];
        self.offset = 0;
        Ok(())
    }

    fn output(&self) -> &[u8] {
        &self.window
    }
}

// ── RecordingSink ────────────────────────────────────────────────

/// How a [`RecordingSink`] refuses data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFailure {
    WouldBlock,
    Closed,
}

#[derive(Default)]
struct SinkLog {
    chunks: Vec<Bytes>,
    busy: bool,
    failure: Option<SinkFailure>,
}

/// A [`FrameSink`] that keeps everything it is sent.
#[derive(Clone, Default)]
pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While busy the sink reports not ready and updates are deferred.
    pub fn set_busy(&self, busy: bool) {
        lock(&self.log).busy = busy;
    }

    pub fn fail_with(&self, failure: Option<SinkFailure>) {
        lock(&self.log).failure = failure;
    }

    pub fn chunk_count(&self) -> usize {
        lock(&self.log).chunks.len()
    }

    pub fn bytes(&self) -> Vec<u8> {
        lock(&self.log)
            .chunks
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect()
    }

    /// Drain and return everything received so far.
    pub fn take(&self) -> Vec<u8> {
        let chunks = std::mem::take(&mut lock(&self.log).chunks);
        chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    /// Decode everything received so far as framebuffer updates.
    pub fn updates(&self, bytes_per_pixel: usize) -> Option<Vec<ParsedUpdate>> {
        decode_updates(&self.bytes(), bytes_per_pixel)
    }
}

impl FrameSink for RecordingSink {
    fn ready(&self) -> bool {
        !lock(&self.log).busy
    }

    fn send(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        let mut log = lock(&self.log);
        match log.failure {
            Some(SinkFailure::WouldBlock) => Err(TransportError::WouldBlock),
            Some(SinkFailure::Closed) => Err(TransportError::Closed),
            None => {
                log.chunks.push(chunk);
                Ok(())
            }
        }
    }
}

// ── Update decoding ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRect {
    pub rect: Rect,
    pub encoding: i32,
    pub payload_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUpdate {
    /// Count from the header (0xFFFF when terminated by LastRect).
    pub count: u16,
    /// Rectangles in wire order, LastRect marker excluded.
    pub rects: Vec<ParsedRect>,
}

impl ParsedUpdate {
    pub fn is_desktop_size(&self) -> bool {
        self.rects.iter().any(|r| r.encoding == ENCODING_DESKTOP_SIZE)
    }
}

/// Split a server → client byte stream into framebuffer updates.
///
/// Returns `None` on anything malformed or truncated.
pub fn decode_updates(data: &[u8], bytes_per_pixel: usize) -> Option<Vec<ParsedUpdate>> {
    let mut pos = 0;
    let mut updates = Vec::new();
    while pos < data.len() {
        let hdr = data.get(pos..pos + 4)?;
        if hdr[0] != 0 {
            return None;
        }
        let count = u16::from_be_bytes([hdr[2], hdr[3]]);
        pos += 4;

        let mut rects = Vec::new();
        loop {
            if count != RECT_COUNT_UNKNOWN && rects.len() == usize::from(count) {
                break;
            }
            let h = data.get(pos..pos + 12)?;
            let rect = Rect::new(
                u16::from_be_bytes([h[0], h[1]]),
                u16::from_be_bytes([h[2], h[3]]),
                u16::from_be_bytes([h[4], h[5]]),
                u16::from_be_bytes([h[6], h[7]]),
            );
            let encoding = i32::from_be_bytes([h[8], h[9], h[10], h[11]]);
            pos += 12;
            if encoding == ENCODING_LAST_RECT {
                break;
            }
            let payload_len = match encoding {
                ENCODING_RAW => rect.area() as usize * bytes_per_pixel,
                ENCODING_HEXTILE => hextile_len(data.get(pos..)?, rect, bytes_per_pixel)?,
                ENCODING_DESKTOP_SIZE => 0,
                _ => return None,
            };
            pos += payload_len;
            if pos > data.len() {
                return None;
            }
            rects.push(ParsedRect {
                rect,
                encoding,
                payload_len,
            });
        }
        updates.push(ParsedUpdate { count, rects });
    }
    Some(updates)
}

fn hextile_len(data: &[u8], rect: Rect, bpp: usize) -> Option<usize> {
    let mut pos = 0;
    for ty in (0..rect.h).step_by(16) {
        for tx in (0..rect.w).step_by(16) {
            let tw = usize::from(16.min(rect.w - tx));
            let th = usize::from(16.min(rect.h - ty));
            let sub = *data.get(pos)?;
            pos += 1;
            if sub & 0x01 != 0 {
                pos += tw * th * bpp;
                continue;
            }
            if sub & 0x02 != 0 {
                pos += bpp;
            }
            if sub & 0x04 != 0 {
                pos += bpp;
            }
            if sub & 0x08 != 0 {
                let n = usize::from(*data.get(pos)?);
                pos += 1;
                pos += if sub & 0x10 != 0 { n * (bpp + 2) } else { n * 2 };
            }
        }
    }
    (pos <= data.len()).then_some(pos)
}

// ── ScriptedTransport ────────────────────────────────────────────

#[derive(Default)]
struct TransportScript {
    batches: VecDeque<Vec<TransportEvent>>,
    published: Vec<ScreenInfo>,
    closed: Vec<ConnectionId>,
    polls: usize,
}

/// A [`Transport`] that replays queued event batches, one per poll.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<TransportScript>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the events returned by one future poll.
    pub fn push_batch(&self, events: Vec<TransportEvent>) {
        lock(&self.script).batches.push_back(events);
    }

    pub fn pending_batches(&self) -> usize {
        lock(&self.script).batches.len()
    }

    pub fn published(&self) -> Vec<ScreenInfo> {
        lock(&self.script).published.clone()
    }

    pub fn closed(&self) -> Vec<ConnectionId> {
        lock(&self.script).closed.clone()
    }

    pub fn polls(&self) -> usize {
        lock(&self.script).polls
    }
}

/// A `Connected` event plus a handle onto the connection's sink.
pub fn connect(conn: u64) -> (TransportEvent, RecordingSink) {
    let sink = RecordingSink::new();
    let event = TransportEvent::Connected {
        conn: ConnectionId(conn),
        sink: Box::new(sink.clone()),
    };
    (event, sink)
}

/// An incremental full-screen update request.
pub fn request(conn: u64) -> TransportEvent {
    TransportEvent::UpdateRequested {
        conn: ConnectionId(conn),
        incremental: true,
        region: Rect::full(u16::MAX, u16::MAX),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn poll(&mut self, _timeout: Duration) -> Vec<TransportEvent> {
        let batch = {
            let mut s = lock(&self.script);
            s.polls += 1;
            s.batches.pop_front()
        };
        tokio::task::yield_now().await;
        batch.unwrap_or_default()
    }

    fn publish_screen(&mut self, info: ScreenInfo) {
        lock(&self.script).published.push(info);
    }

    fn close(&mut self, conn: ConnectionId) {
        lock(&self.script).closed.push(conn);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_pops_scripted_changes() {
        let mut dev = FakeCaptureDevice::new(64, 64);
        dev.push_changes(vec![Rect::new(0, 0, 16, 16), Rect::new(16, 0, 16, 16)]);
        dev.send_command(CaptureCommand::Compare).unwrap();
        assert_eq!(dev.change_count().unwrap(), 2);
        assert_eq!(dev.next_change().unwrap(), Rect::new(0, 0, 16, 16));

        dev.send_command(CaptureCommand::Compare).unwrap();
        assert_eq!(dev.change_count().unwrap(), 0);
    }

    #[test]
    fn resolution_flag_clears_on_read() {
        let mut dev = FakeCaptureDevice::new(64, 64);
        dev.change_resolution(128, 64);
        assert!(dev.resolution_changed().unwrap());
        assert!(!dev.resolution_changed().unwrap());
        assert_eq!(dev.info().unwrap().width, 128);
    }

    #[test]
    fn codec_payload_is_valid_hextile() {
        let rect = Rect::new(0, 0, 40, 20);
        let payload = FakeTileCodec::payload_for(rect);
        assert_eq!(hextile_len(&payload, rect, 2), Some(payload.len()));
    }

    #[test]
    fn sink_failure_modes() {
        let mut sink = RecordingSink::new();
        sink.send(Bytes::from_static(b"ok")).unwrap();
        sink.fail_with(Some(SinkFailure::WouldBlock));
        assert!(matches!(
            sink.send(Bytes::from_static(b"x")),
            Err(TransportError::WouldBlock)
        ));
        assert_eq!(sink.bytes(), b"ok");
    }

    #[tokio::test]
    async fn scripted_transport_replays_batches() {
        let mut t = ScriptedTransport::new();
        t.push_batch(vec![request(1)]);
        assert_eq!(t.poll(Duration::ZERO).await.len(), 1);
        assert!(t.poll(Duration::ZERO).await.is_empty());
        assert_eq!(t.polls(), 2);
    }
}
