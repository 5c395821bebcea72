//! RFB over TCP.
//!
//! [`TcpTransport`] accepts viewers, runs the version/security/init
//! exchange and then splits each socket into a reader task, which decodes
//! client messages with [`ClientMessageCodec`] into [`TransportEvent`]s, and
//! a writer task, which drains the session's bounded chunk queue. The event
//! loop collects events through [`Transport::poll`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, trace, warn};

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::rfb::transport::{ConnectionId, Transport, TransportEvent};
use crate::rfb::types::{FrameSource, PixelFormat, Rect, ScreenInfo};
use crate::rfb::wire::FrameSink;

// ── Protocol constants ───────────────────────────────────────────

const SERVER_VERSION: &[u8; 12] = b"RFB 003.008\n";
const SECURITY_NONE: u8 = 1;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Longest ClientCutText payload accepted before the connection is dropped.
pub const MAX_CUT_TEXT: usize = 1 << 20;

pub const MSG_SET_PIXEL_FORMAT: u8 = 0;
pub const MSG_SET_ENCODINGS: u8 = 2;
pub const MSG_UPDATE_REQUEST: u8 = 3;
pub const MSG_KEY_EVENT: u8 = 4;
pub const MSG_POINTER_EVENT: u8 = 5;
pub const MSG_CUT_TEXT: u8 = 6;

/// Negotiated protocol minor version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V3_3,
    V3_7,
    V3_8,
}

impl ProtocolVersion {
    /// Parse a 12-byte `RFB xxx.yyy\n` version string.
    ///
    /// Unknown 3.x minors fall back to 3.3 behaviour.
    pub fn parse(msg: &[u8; 12]) -> Result<Self, TransportError> {
        let valid = &msg[..4] == b"RFB " && msg[7] == b'.' && msg[11] == b'\n';
        let digits = |s: &[u8]| -> Option<u32> {
            std::str::from_utf8(s).ok()?.parse().ok()
        };
        let (Some(major), Some(minor)) = (digits(&msg[4..7]), digits(&msg[8..11])) else {
            return Err(TransportError::Handshake("malformed version string".into()));
        };
        if !valid || major != 3 {
            return Err(TransportError::Handshake(format!(
                "unsupported protocol version {major}.{minor}"
            )));
        }
        Ok(match minor {
            8.. => ProtocolVersion::V3_8,
            7 => ProtocolVersion::V3_7,
            _ => ProtocolVersion::V3_3,
        })
    }
}

// ── Handshake ────────────────────────────────────────────────────

/// Server side of the RFB init sequence, up to and including ServerInit.
///
/// Only the "None" security type is offered. `screen` is read after the
/// client's ClientInit so the geometry sent is the one current at that moment.
pub async fn handshake<S>(
    stream: &mut S,
    screen: &watch::Receiver<ScreenInfo>,
) -> Result<ProtocolVersion, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(SERVER_VERSION).await?;
    let mut version = [0u8; 12];
    stream.read_exact(&mut version).await?;
    let version = ProtocolVersion::parse(&version)?;

    if version == ProtocolVersion::V3_3 {
        stream.write_all(&u32::from(SECURITY_NONE).to_be_bytes()).await?;
    } else {
        stream.write_all(&[1, SECURITY_NONE]).await?;
        let choice = stream.read_u8().await?;
        if choice != SECURITY_NONE {
            if version == ProtocolVersion::V3_8 {
                let reason = b"security type not offered";
                stream.write_all(&1u32.to_be_bytes()).await?;
                stream.write_all(&(reason.len() as u32).to_be_bytes()).await?;
                stream.write_all(reason).await?;
            }
            return Err(TransportError::Handshake(format!(
                "client chose security type {choice}"
            )));
        }
        if version == ProtocolVersion::V3_8 {
            stream.write_all(&0u32.to_be_bytes()).await?;
        }
    }

    // ClientInit: the shared flag is ignored, every viewer shares.
    let _shared = stream.read_u8().await?;

    let info = screen.borrow().clone();
    stream.write_all(&server_init(&info)).await?;
    stream.flush().await?;
    Ok(version)
}

/// Encode a ServerInit message.
pub fn server_init(info: &ScreenInfo) -> BytesMut {
    let name = info.name.as_bytes();
    let mut buf = BytesMut::with_capacity(24 + name.len());
    buf.extend_from_slice(&info.width.to_be_bytes());
    buf.extend_from_slice(&info.height.to_be_bytes());
    buf.extend_from_slice(&info.format.encode());
    buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buf.extend_from_slice(name);
    buf
}

// ── ClientMessageCodec ───────────────────────────────────────────

/// Decoder for client-to-server messages after the init phase.
#[derive(Debug, Clone)]
pub struct ClientMessageCodec {
    conn: ConnectionId,
}

impl ClientMessageCodec {
    pub fn new(conn: ConnectionId) -> Self {
        Self { conn }
    }
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

impl Decoder for ClientMessageCodec {
    type Item = TransportEvent;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&kind) = src.first() else {
            return Ok(None);
        };

        let needed = match kind {
            MSG_SET_PIXEL_FORMAT => 4 + PixelFormat::SIZE,
            MSG_SET_ENCODINGS => {
                if src.len() < 4 {
                    return Ok(None);
                }
                4 + 4 * be_u16(src, 2) as usize
            }
            MSG_UPDATE_REQUEST => 10,
            MSG_KEY_EVENT => 8,
            MSG_POINTER_EVENT => 6,
            MSG_CUT_TEXT => {
                if src.len() < 8 {
                    return Ok(None);
                }
                let len = be_u32(src, 4) as usize;
                if len > MAX_CUT_TEXT {
                    return Err(TransportError::ProtocolViolation("cut text too long"));
                }
                8 + len
            }
            _ => return Err(TransportError::ProtocolViolation("unknown client message type")),
        };

        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        let msg = src.split_to(needed);
        let conn = self.conn;
        let event = match kind {
            MSG_SET_PIXEL_FORMAT => {
                let mut raw = [0u8; PixelFormat::SIZE];
                raw.copy_from_slice(&msg[4..4 + PixelFormat::SIZE]);
                TransportEvent::SetPixelFormat {
                    conn,
                    format: PixelFormat::decode(&raw),
                }
            }
            MSG_SET_ENCODINGS => TransportEvent::SetEncodings {
                conn,
                encodings: msg[4..]
                    .chunks_exact(4)
                    .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            },
            MSG_UPDATE_REQUEST => TransportEvent::UpdateRequested {
                conn,
                incremental: msg[1] != 0,
                region: Rect::new(
                    be_u16(&msg, 2),
                    be_u16(&msg, 4),
                    be_u16(&msg, 6),
                    be_u16(&msg, 8),
                ),
            },
            MSG_KEY_EVENT => TransportEvent::Key {
                conn,
                down: msg[1] != 0,
                keysym: be_u32(&msg, 4),
            },
            MSG_POINTER_EVENT => TransportEvent::Pointer {
                conn,
                buttons: msg[1],
                x: be_u16(&msg, 2),
                y: be_u16(&msg, 4),
            },
            _ => TransportEvent::CutText {
                conn,
                len: needed - 8,
            },
        };
        trace!(?event, "client message");
        Ok(Some(event))
    }
}

// ── ChannelSink ──────────────────────────────────────────────────

/// A session's socket sink: the sending end of its writer task's queue.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl FrameSink for ChannelSink {
    /// At least half the queue must be free before an update starts. A
    /// closed queue reports ready so the next send surfaces the failure.
    fn ready(&self) -> bool {
        self.tx.is_closed() || self.tx.capacity() * 2 >= self.tx.max_capacity()
    }

    fn send(&mut self, chunk: Bytes) -> Result<(), TransportError> {
        self.tx.try_send(chunk).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::WouldBlock,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

// ── TcpTransport ─────────────────────────────────────────────────

type ConnectionMap = Arc<Mutex<HashMap<ConnectionId, AbortHandle>>>;

/// State shared by the accept loop and every connection task.
struct Shared {
    events: mpsc::Sender<TransportEvent>,
    screen: watch::Receiver<ScreenInfo>,
    connections: ConnectionMap,
    queue_depth: usize,
}

/// TCP listener feeding the event loop.
pub struct TcpTransport {
    local_addr: SocketAddr,
    events: mpsc::Receiver<TransportEvent>,
    screen: watch::Sender<ScreenInfo>,
    connections: ConnectionMap,
    accept_task: JoinHandle<()>,
}

impl TcpTransport {
    /// Listen on `addr`. The placeholder geometry is announced until the
    /// event loop publishes the real screen.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: &ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let initial = ScreenInfo::from_frame(&FrameSource::placeholder(), &config.desktop_name);
        let (screen, screen_rx) = watch::channel(initial);
        let connections: ConnectionMap = Arc::default();

        let shared = Arc::new(Shared {
            events: events_tx,
            screen: screen_rx,
            connections: Arc::clone(&connections),
            queue_depth: config.output_queue_depth.max(1),
        });
        let accept_task = tokio::spawn(accept_loop(listener, shared));
        info!(%local_addr, "RFB listener started");

        Ok(Self {
            local_addr,
            events,
            screen,
            connections,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections whose tasks are still running.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().map(|m| m.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn poll(&mut self, timeout: Duration) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(event)) => out.push(event),
            Ok(None) => {
                // Accept loop is gone; keep the caller's pacing.
                tokio::time::sleep(timeout).await;
                return out;
            }
            Err(_) => return out,
        }
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn publish_screen(&mut self, info: ScreenInfo) {
        debug!(width = info.width, height = info.height, "publishing screen");
        self.screen.send_replace(info);
    }

    fn close(&mut self, conn: ConnectionId) {
        let handle = match self.connections.lock() {
            Ok(mut map) => map.remove(&conn),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            handle.abort();
            debug!(%conn, "connection closed by server");
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Ok(mut map) = self.connections.lock() {
            for (_, handle) in map.drain() {
                handle.abort();
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut next_id = 1u64;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let conn = ConnectionId(next_id);
        next_id += 1;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%conn, error = %e, "TCP_NODELAY not set");
        }
        info!(%conn, %peer, "viewer connecting");

        // Hold the map across spawn so the task cannot remove itself first.
        match shared.connections.lock() {
            Ok(mut map) => {
                let task = tokio::spawn(serve_connection(stream, conn, Arc::clone(&shared)));
                map.insert(conn, task.abort_handle());
            }
            Err(_) => warn!(%conn, "connection map poisoned; refusing viewer"),
        }
    }
}

async fn serve_connection(mut stream: TcpStream, conn: ConnectionId, shared: Arc<Shared>) {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream, &shared.screen)).await {
        Ok(Ok(version)) => debug!(%conn, ?version, "handshake complete"),
        Ok(Err(e)) => {
            warn!(%conn, error = %e, "handshake failed");
            forget(&shared, conn);
            return;
        }
        Err(_) => {
            warn!(%conn, "handshake timed out");
            forget(&shared, conn);
            return;
        }
    }

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(shared.queue_depth);
    tokio::spawn(write_loop(write_half, rx, conn));

    let connected = TransportEvent::Connected {
        conn,
        sink: Box::new(ChannelSink::new(tx)),
    };
    if shared.events.send(connected).await.is_err() {
        forget(&shared, conn);
        return;
    }

    let mut reader = FramedRead::new(read_half, ClientMessageCodec::new(conn));
    while let Some(item) = reader.next().await {
        match item {
            Ok(event) => {
                if shared.events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(%conn, error = %e, "dropping viewer");
                break;
            }
        }
    }

    let _ = shared.events.send(TransportEvent::Closed { conn }).await;
    forget(&shared, conn);
}

/// Ends when the session drops its sink or the socket fails.
async fn write_loop(mut socket: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, conn: ConnectionId) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = socket.write_all(&chunk).await {
            debug!(%conn, error = %e, "socket write failed");
            break;
        }
    }
    let _ = socket.shutdown().await;
}

fn forget(shared: &Shared, conn: ConnectionId) {
    if let Ok(mut map) = shared.connections.lock() {
        map.remove(&conn);
    }
}

// ── Tests ────────────────────────────────────────────────────────
