//! Configuration for the iKVM server process.

use std::path::Path;

use serde::{Deserialize, Serialize};

use ikvm_core::ServerConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IkvmConfig {
    /// Listener settings.
    pub network: NetworkConfig,
    /// Capture engine and tile codec settings.
    pub video: VideoConfig,
    /// Update engine tuning.
    pub rfb: RfbConfig,
    /// HID gadget settings.
    pub input: InputConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the RFB listener on.
    pub bind_address: String,
    /// TCP port for viewers.
    pub port: u16,
    /// Maximum concurrent viewers.
    pub max_clients: usize,
}

/// Video configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Capture engine device node.
    pub capture_device: String,
    /// Hextile codec device node.
    pub codec_device: String,
    /// Target frames per second (clamped to 1..=60).
    pub frame_rate: u32,
    /// Full-frame sends after connect or a mode change.
    pub settle_frames: u32,
    /// Tile codec attempts before a rectangle is given up.
    pub encode_retry_limit: u32,
    /// Mode watcher poll interval in milliseconds; 0 disables the watcher.
    pub mode_poll_ms: u64,
    /// Serve a synthetic test pattern instead of opening devices.
    pub simulate: bool,
    /// Simulated screen width.
    pub simulate_width: u32,
    /// Simulated screen height.
    pub simulate_height: u32,
}

/// RFB engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RfbConfig {
    /// Name announced in ServerInit.
    pub desktop_name: String,
    /// Use the LastRect terminator when viewers support it.
    pub use_last_rect: bool,
    /// Per-session output buffer in bytes.
    pub update_buf_size: usize,
    /// Chunks queued per socket before a session backs off.
    pub output_queue_depth: usize,
    /// Seconds between fps log lines; 0 disables.
    pub fps_dump_secs: u64,
    /// Milliseconds between attempts to leave the placeholder frame.
    pub placeholder_retry_ms: u64,
    /// Microseconds subtracted from the frame period for the poll timeout.
    pub poll_overhead_us: u64,
}

/// Input relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Relay keyboard and pointer events to the host.
    pub enabled: bool,
    /// Boot-keyboard gadget node.
    pub keyboard_device: String,
    /// Absolute pointer gadget node.
    pub pointer_device: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 5900,
            max_clients: 10,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            capture_device: "/dev/vcd".into(),
            codec_device: "/dev/hextile".into(),
            frame_rate: 30,
            settle_frames: 30,
            encode_retry_limit: 8,
            mode_poll_ms: 500,
            simulate: false,
            simulate_width: 1024,
            simulate_height: 768,
        }
    }
}

impl Default for RfbConfig {
    fn default() -> Self {
        let core = ServerConfig::default();
        Self {
            desktop_name: core.desktop_name,
            use_last_rect: core.use_last_rect,
            update_buf_size: core.update_buf_size,
            output_queue_depth: core.output_queue_depth,
            fps_dump_secs: core.fps_dump_secs,
            placeholder_retry_ms: core.placeholder_retry_ms,
            poll_overhead_us: core.poll_overhead_us,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keyboard_device: "/dev/hidg0".into(),
            pointer_device: "/dev/hidg1".into(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl IkvmConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Listener address as `host:port`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.network.port)
    }

    /// The engine parameters, clamped to workable ranges.
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            frame_rate: self.video.frame_rate.clamp(1, 60),
            poll_overhead_us: self.rfb.poll_overhead_us,
            max_clients: self.network.max_clients.max(1),
            settle_frames: self.video.settle_frames,
            fps_dump_secs: self.rfb.fps_dump_secs,
            encode_retry_limit: self.video.encode_retry_limit.max(1),
            update_buf_size: self.rfb.update_buf_size,
            output_queue_depth: self.rfb.output_queue_depth,
            use_last_rect: self.rfb.use_last_rect,
            desktop_name: self.rfb.desktop_name.clone(),
            placeholder_retry_ms: self.rfb.placeholder_retry_ms,
        }
        .sanitized()
    }
}

// ── Tests ────────────────────────────────────────────────────────
