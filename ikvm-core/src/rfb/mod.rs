//! # rfb: incremental framebuffer updates for a BMC video capture engine
//!
//! ## Pipeline
//!
//! ```text
//!  capture engine ──► CaptureController ──► ChangeSet
//!                                             │
//!  TcpTransport ──events──► EventLoop ──► UpdateScheduler
//!        ▲                                    │ per session
//!        │                                    ▼
//!   writer task ◄── ChannelSink ◄── TileEncoder (hardware Hextile)
//!                                  └─ soft (Raw / Hextile fallback)
//!
//!  Primary session key/pointer ──► InputRelay (USB HID gadget)
//! ```
//!
//! ## Sub-modules
//!
//! | Module       | Purpose                                              |
//! |--------------|------------------------------------------------------|
//! | `types`      | Rectangles, pixel formats, frames, change sets       |
//! | `device`     | Capture engine and tile codec capability traits      |
//! | `linux`      | ioctl/mmap device nodes (Linux only)                 |
//! | `fake`       | In-memory devices, scripted transport, recording sink|
//! | `capture`    | Capture command selection and change-set history     |
//! | `tile`       | Hardware tile encoding with stall detection          |
//! | `soft`       | Raw / Hextile software encoders, pixel translation   |
//! | `wire`       | FramebufferUpdate framing and buffered writes        |
//! | `session`    | Per-client lifecycle and refresh bookkeeping         |
//! | `state`      | Session slots, primary election, frame generation    |
//! | `scheduler`  | One tick of update service                           |
//! | `event_loop` | Poll, dispatch, tick, reap                           |
//! | `transport`  | Connection substrate trait and events                |
//! | `tcp`        | RFB over TCP: handshake and client message codec     |
//! | `input`      | Keyboard/pointer relay to USB HID reports            |
//! | `monitor`    | Video mode watcher and resize flag                   |
//! | `rate`       | Frame-rate and throughput accounting                 |

pub mod capture;
pub mod device;
pub mod event_loop;
pub mod fake;
pub mod input;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod monitor;
pub mod rate;
pub mod scheduler;
pub mod session;
pub mod soft;
pub mod state;
pub mod tcp;
pub mod tile;
pub mod transport;
pub mod types;
pub mod wire;

pub use capture::CaptureController;
pub use device::{CaptureCommand, CaptureDevice, CaptureInfo, TileCodecDevice};
pub use event_loop::EventLoop;
pub use input::{HidInput, InputRelay, NullInput};
pub use monitor::{ResizeSignal, ResizeWatcher};
pub use rate::{FpsDump, FrameRateMeter};
pub use scheduler::{TickOutcome, TickReport, UpdateScheduler};
pub use session::{ClientSession, SessionPhase};
pub use state::ServerState;
pub use tcp::TcpTransport;
pub use tile::TileEncoder;
pub use transport::{ConnectionId, Transport, TransportEvent};
pub use types::{ChangeSet, FrameSource, PixelFormat, Rect, ScreenInfo};
pub use wire::FrameSink;
