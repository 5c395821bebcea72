//! Resolution-change watcher.
//!
//! An optional background thread polls the capture engine's mode
//! description through its own device handle and raises a [`ResizeSignal`]
//! when the geometry moves. The signal is a single atomic word: the event
//! loop reads and clears it, and never waits on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::rfb::device::{CaptureDevice, CaptureInfo};

// ── ResizeSignal ─────────────────────────────────────────────────

/// Cross-thread "the video mode changed" flag.
#[derive(Debug, Clone, Default)]
pub struct ResizeSignal(Arc<AtomicBool>);

impl ResizeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

// ── ResizeWatcher ────────────────────────────────────────────────

/// Geometry fields whose change means a new mode.
fn mode_of(info: &CaptureInfo) -> (u32, u32, u32, u32) {
    (info.width, info.height, info.line_pitch, info.bytes_per_pixel)
}

/// Handle to a running watcher thread.
pub struct ResizeWatcher {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ResizeWatcher {
    /// Start polling `device` every `interval`.
    pub fn spawn(
        mut device: Box<dyn CaptureDevice>,
        signal: ResizeSignal,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("ikvm-mode-watch".into())
            .spawn(move || {
                let mut last = device.info().ok().map(|i| mode_of(&i));
                debug!(mode = ?last, "mode watcher started");
                while flag.load(Ordering::Acquire) {
                    thread::sleep(interval);
                    let current = match device.info() {
                        Ok(info) => Some(mode_of(&info)),
                        Err(e) => {
                            warn!(error = %e, "mode query failed");
                            None
                        }
                    };
                    if current.is_some() && current != last {
                        info!(from = ?last, to = ?current, "video mode changed");
                        signal.raise();
                        last = current;
                    }
                }
                debug!("mode watcher stopped");
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the thread to exit and wait for it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("mode watcher panicked");
        }
    }
}

impl Drop for ResizeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::fake::FakeCaptureDevice;
    use std::time::Instant;

    #[test]
    fn take_clears() {
        let s = ResizeSignal::new();
        assert!(!s.take());
        s.raise();
        assert!(s.is_raised());
        assert!(s.take());
        assert!(!s.is_raised());
    }

    #[test]
    fn watcher_raises_on_mode_change() {
        let dev = FakeCaptureDevice::new(640, 480);
        let signal = ResizeSignal::new();
        let mut watcher =
            ResizeWatcher::spawn(Box::new(dev.clone()), signal.clone(), Duration::from_millis(5))
                .unwrap();

        dev.change_resolution(800, 600);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !signal.is_raised() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        watcher.stop();
        assert!(signal.take());
        assert!(!watcher.is_running());
    }
}
