//! Server bootstrap.
//!
//! Opens the video and input devices (or their simulated stand-ins),
//! starts the mode watcher and the RFB listener, then runs the event loop
//! until stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use ikvm_core::rfb::device::CaptureDevice;
use ikvm_core::rfb::fake::{FakeCaptureDevice, FakeTileCodec};
use ikvm_core::{
    CaptureController, EventLoop, HidInput, IkvmError, InputRelay, NullInput, ResizeSignal,
    ResizeWatcher, ServerConfig, TcpTransport, TileEncoder,
};

use crate::config::IkvmConfig;

/// Everything the event loop needs from the hardware side.
struct Devices {
    capture: CaptureController,
    tiles: TileEncoder,
    input: Box<dyn InputRelay>,
    /// Second handle on the capture engine for the mode watcher.
    probe: Option<Box<dyn CaptureDevice>>,
}

// ── IkvmService ──────────────────────────────────────────────────

/// The top-level server.
pub struct IkvmService {
    config: IkvmConfig,
    running: Arc<AtomicBool>,
}

impl IkvmService {
    pub fn new(config: IkvmConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the server from another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &IkvmConfig {
        &self.config
    }

    /// Run the server until stopped.
    ///
    /// 1. Opens (or simulates) the capture engine, tile codec and HID gadget.
    /// 2. Starts the mode watcher if a poll interval is configured.
    /// 3. Binds the RFB listener.
    /// 4. Runs the event loop until `running` becomes `false`.
    pub async fn run(&self) -> Result<(), IkvmError> {
        self.running.store(true, Ordering::SeqCst);

        let core = self.config.to_server_config();
        let devices = self.build_devices(&core)?;

        let signal = ResizeSignal::new();
        let mut watcher = None;
        if let Some(probe) = devices.probe
            && self.config.video.mode_poll_ms > 0
        {
            let interval = Duration::from_millis(self.config.video.mode_poll_ms);
            match ResizeWatcher::spawn(probe, signal.clone(), interval) {
                Ok(w) => watcher = Some(w),
                Err(e) => warn!(error = %e, "mode watcher not started"),
            }
        }

        let transport = TcpTransport::bind(self.config.listen_addr(), &core).await?;
        info!(addr = %transport.local_addr(), "iKVM server listening");

        let mut event_loop = EventLoop::new(
            core,
            transport,
            devices.capture,
            devices.tiles,
            devices.input,
            signal,
        );

        let loop_running = event_loop.stop_handle();
        let running = Arc::clone(&self.running);
        let bridge = tokio::spawn(async move {
            wait_for_stop(&running).await;
            loop_running.store(false, Ordering::SeqCst);
        });

        event_loop.run().await;

        bridge.abort();
        if let Some(mut w) = watcher {
            w.stop();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("iKVM server stopped");
        Ok(())
    }

    // ── Internal ─────────────────────────────────────────────────

    fn build_devices(&self, core: &ServerConfig) -> Result<Devices, IkvmError> {
        let input: Box<dyn InputRelay> = if self.config.input.enabled && !self.config.video.simulate {
            Box::new(HidInput::new(
                &self.config.input.keyboard_device,
                &self.config.input.pointer_device,
            ))
        } else {
            Box::new(NullInput)
        };

        if self.config.video.simulate {
            let (width, height) = (self.config.video.simulate_width, self.config.video.simulate_height);
            info!(width, height, "simulation mode: synthetic capture and codec");
            let dev = FakeCaptureDevice::simulated(width, height);
            return Ok(Devices {
                capture: CaptureController::new(Box::new(dev.clone())),
                tiles: TileEncoder::new(Box::new(FakeTileCodec::new()), core.encode_retry_limit),
                input,
                probe: Some(Box::new(dev)),
            });
        }

        self.hardware_devices(core, input)
    }

    #[cfg(target_os = "linux")]
    fn hardware_devices(
        &self,
        core: &ServerConfig,
        input: Box<dyn InputRelay>,
    ) -> Result<Devices, IkvmError> {
        use ikvm_core::rfb::linux::{EceDevice, VcdDevice};

        let video = &self.config.video;
        let capture = VcdDevice::open(&video.capture_device)?;
        let tiles = match EceDevice::open(&video.codec_device) {
            Ok(codec) => TileEncoder::new(Box::new(codec), core.encode_retry_limit),
            Err(e) => {
                warn!(error = %e, "tile codec unavailable; software encoding only");
                TileEncoder::unavailable(core.encode_retry_limit)
            }
        };
        let probe: Option<Box<dyn CaptureDevice>> = match VcdDevice::open(&video.capture_device) {
            Ok(dev) => Some(Box::new(dev)),
            Err(e) => {
                warn!(error = %e, "no second capture handle for the mode watcher");
                None
            }
        };
        Ok(Devices {
            capture: CaptureController::new(Box::new(capture)),
            tiles,
            input,
            probe,
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn hardware_devices(
        &self,
        _core: &ServerConfig,
        _input: Box<dyn InputRelay>,
    ) -> Result<Devices, IkvmError> {
        Err(IkvmError::Config(
            "video capture devices are only available on Linux; use simulation mode".into(),
        ))
    }
}

/// Resolves when `running` becomes false.
async fn wait_for_stop(running: &Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated() -> IkvmConfig {
        let mut cfg = IkvmConfig::default();
        cfg.video.simulate = true;
        cfg.video.simulate_width = 64;
        cfg.video.simulate_height = 48;
        cfg.video.mode_poll_ms = 0;
        cfg.network.bind_address = "127.0.0.1".into();
        cfg.network.port = 0;
        cfg
    }

    #[test]
    fn service_creates_with_defaults() {
        let svc = IkvmService::new(IkvmConfig::default());
        assert!(!svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = IkvmService::new(IkvmConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[test]
    fn simulation_builds_fake_devices() {
        let svc = IkvmService::new(simulated());
        let mut devices = svc.build_devices(&svc.config().to_server_config()).unwrap();
        assert!(devices.probe.is_some());
        let frame = devices.capture.reinitialize().unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
        devices.tiles.configure(&frame).unwrap();
        assert!(devices.tiles.is_available());
    }

    #[tokio::test]
    async fn simulated_server_stops_on_request() {
        let svc = Arc::new(IkvmService::new(simulated()));
        let stop = svc.stop_handle();
        let task = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.run().await }
        });
        while !stop.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.store(false, Ordering::SeqCst);
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("timeout")
            .unwrap();
        assert!(result.is_ok());
    }
}
