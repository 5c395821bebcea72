//! Capture engine command protocol.
//!
//! The [`CaptureController`] is the only code that talks to the capture
//! device. One elected session per tick (the driver) makes it issue a
//! capture or compare; every other session reads the result of that drive.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::rfb::device::{CaptureCommand, CaptureDevice, CaptureInfo};
use crate::rfb::types::{ChangeKind, ChangeSet, FrameGeometry, FrameSource};

/// Diff sets kept so a session that skipped a few ticks can catch up
/// without a full-frame resend.
const HISTORY_DEPTH: usize = 8;

// ── RefreshState ─────────────────────────────────────────────────

/// Per-session cursor into the stream of change sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshState {
    /// Remaining forced full-frame sends.
    pub backlog: u32,
    /// Sequence number of the last change set this session consumed.
    pub last_seq: Option<u64>,
}

impl RefreshState {
    pub fn settling(settle_frames: u32) -> Self {
        Self {
            backlog: settle_frames,
            last_seq: None,
        }
    }

    /// Forget the cursor and restart the settle window.
    pub fn reset(&mut self, settle_frames: u32) {
        *self = Self::settling(settle_frames);
    }

    /// Next send must be a full frame.
    pub fn resync(&mut self) {
        self.last_seq = None;
    }
}

// ── CaptureController ────────────────────────────────────────────

/// Sole owner of the capture device and of the shared change-set history.
pub struct CaptureController {
    device: Box<dyn CaptureDevice>,
    res_changed: bool,
    seq: u64,
    history: VecDeque<Arc<ChangeSet>>,
    width: u16,
    height: u16,
    /// Mode behind the currently mapped frame.
    installed: Option<CaptureInfo>,
}

impl CaptureController {
    pub fn new(device: Box<dyn CaptureDevice>) -> Self {
        Self {
            device,
            res_changed: false,
            seq: 0,
            history: VecDeque::with_capacity(HISTORY_DEPTH),
            width: 0,
            height: 0,
            installed: None,
        }
    }

    /// Whether the video mode changed.
    ///
    /// Only a driving caller queries the device; other callers see the cached
    /// flag. A change is reported once, then the flag is cleared.
    pub fn query_resolution_changed(&mut self, drive: bool) -> Result<bool, CaptureError> {
        if drive && self.device.resolution_changed()? {
            info!("capture engine reports a resolution change");
            self.res_changed = true;
        }
        Ok(std::mem::take(&mut self.res_changed))
    }

    /// Whether the device still describes the mode behind the mapped frame.
    ///
    /// False while nothing is mapped. Refresh rate is not part of the mode.
    pub fn mode_is_current(&mut self) -> Result<bool, CaptureError> {
        let Some(installed) = self.installed else {
            return Ok(false);
        };
        let info = self.device.info()?;
        Ok(info.fb_addr == installed.fb_addr
            && info.width == installed.width
            && info.height == installed.height
            && info.line_pitch == installed.line_pitch
            && info.bytes_per_pixel == installed.bytes_per_pixel
            && info.layout == installed.layout)
    }

    /// Re-read the video mode and map the new capture buffer.
    ///
    /// Fails with [`CaptureError::DeviceUnavailable`] when there is no usable
    /// signal; the caller serves [`FrameSource::placeholder`] in that case.
    pub fn reinitialize(&mut self) -> Result<FrameSource, CaptureError> {
        self.history.clear();
        self.res_changed = false;
        self.width = 0;
        self.height = 0;
        self.installed = None;

        let info = self.device.info()?;
        let geometry = Self::validate(&info)?;
        let memory = self.device.map_frame(geometry.frame_size())?;

        self.width = geometry.width;
        self.height = geometry.height;
        self.installed = Some(info);
        info!(
            width = geometry.width,
            height = geometry.height,
            line_pitch = geometry.line_pitch,
            bpp = geometry.bits_per_pixel,
            refresh = info.refresh_rate,
            "capture buffer mapped"
        );
        Ok(FrameSource::mapped(geometry, info.layout, info.fb_addr, memory))
    }

    fn validate(info: &CaptureInfo) -> Result<FrameGeometry, CaptureError> {
        if !info.has_signal() {
            return Err(CaptureError::DeviceUnavailable("no video signal".into()));
        }
        let invalid = CaptureError::InvalidMode {
            width: info.width,
            height: info.height,
        };
        let (Ok(width), Ok(height)) = (u16::try_from(info.width), u16::try_from(info.height))
        else {
            return Err(invalid);
        };
        let bits_per_pixel = match info.bytes_per_pixel {
            1 | 2 | 4 => (info.bytes_per_pixel * 8) as u8,
            _ => return Err(invalid),
        };
        if info.line_pitch < info.width * info.bytes_per_pixel {
            return Err(invalid);
        }
        Ok(FrameGeometry {
            width,
            height,
            line_pitch: info.line_pitch,
            bits_per_pixel,
        })
    }

    /// Issue one capture command and record its change set.
    ///
    /// A driver still inside its settle window captures a complete frame;
    /// otherwise the engine compares against the previous capture.
    pub fn drive(&mut self, cmd: CaptureCommand) -> Result<Arc<ChangeSet>, CaptureError> {
        if let Err(e) = self.device.send_command(cmd) {
            // whatever came before is no longer a valid diff base
            self.history.clear();
            return Err(e);
        }
        self.seq += 1;
        let set = match cmd {
            CaptureCommand::Compare => {
                let rects = match self.device.change_rects() {
                    Ok(rects) => rects,
                    Err(e) => {
                        self.history.clear();
                        return Err(e);
                    }
                };
                ChangeSet::diff(self.seq, rects, self.width, self.height)
            }
            _ => ChangeSet::full(self.seq, self.width, self.height),
        };
        debug!(seq = set.seq, kind = ?set.kind, rects = set.len(), "change set");

        let set = Arc::new(set);
        if self.history.len() == HISTORY_DEPTH {
            self.history.pop_front();
        }
        self.history.push_back(Arc::clone(&set));
        Ok(set)
    }

    /// Change set for one session this tick.
    ///
    /// With `drive` set the device is commanded first. A session inside its
    /// settle window gets one full-frame rectangle and its backlog shrinks by
    /// one. A session whose cursor is behind the shared history gets a full
    /// frame as well; otherwise it gets every diff it has not seen yet, in
    /// device order.
    pub fn request_change_set(
        &mut self,
        drive: bool,
        refresh: &mut RefreshState,
    ) -> Result<Arc<ChangeSet>, CaptureError> {
        if drive {
            let cmd = if refresh.backlog > 0 {
                CaptureCommand::CaptureFrame
            } else {
                CaptureCommand::Compare
            };
            self.drive(cmd)?;
        }
        let Some(latest) = self.history.back().cloned() else {
            return Err(CaptureError::DeviceUnavailable(
                "no capture has been driven yet".into(),
            ));
        };

        let full = || Arc::new(ChangeSet::full(latest.seq, self.width, self.height));

        if refresh.backlog > 0 {
            refresh.backlog -= 1;
            refresh.last_seq = Some(latest.seq);
            return Ok(full());
        }

        let set = match refresh.last_seq {
            Some(seen) if seen + 1 == latest.seq && latest.kind == ChangeKind::Diff => {
                Arc::clone(&latest)
            }
            Some(seen) if seen < latest.seq => self.catch_up(seen).unwrap_or_else(full),
            Some(seen) if seen == latest.seq => {
                warn!(seq = seen, "change set requested twice; resending full frame");
                full()
            }
            _ => full(),
        };
        refresh.last_seq = Some(latest.seq);
        Ok(set)
    }

    /// Concatenate every diff after `seen`, if the history still covers it.
    fn catch_up(&self, seen: u64) -> Option<Arc<ChangeSet>> {
        let missed: Vec<&Arc<ChangeSet>> = self.history.iter().filter(|s| s.seq > seen).collect();
        let first = missed.first()?;
        if first.seq != seen + 1 || missed.iter().any(|s| s.kind != ChangeKind::Diff) {
            return None;
        }
        let latest = missed.last()?;
        let rects = missed.iter().flat_map(|s| s.rects.iter().copied()).collect();
        Some(Arc::new(ChangeSet {
            seq: latest.seq,
            kind: ChangeKind::Diff,
            rects,
        }))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::fake::FakeCaptureDevice;
    use crate::rfb::types::Rect;

    fn controller(w: u32, h: u32) -> (CaptureController, FakeCaptureDevice) {
        let dev = FakeCaptureDevice::new(w, h);
        let mut ctl = CaptureController::new(Box::new(dev.clone()));
        ctl.reinitialize().unwrap();
        (ctl, dev)
    }

    #[test]
    fn reinitialize_maps_frame() {
        let (mut ctl, _) = controller(1024, 768);
        let frame = ctl.reinitialize().unwrap();
        assert_eq!(frame.full_rect(), Rect::full(1024, 768));
        assert!(!frame.is_placeholder());
        assert_eq!(frame.line_pitch(), 2048);
    }

    #[test]
    fn no_signal_is_unavailable() {
        let (mut ctl, dev) = controller(1024, 768);
        dev.set_signal(false);
        assert!(matches!(
            ctl.reinitialize(),
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn backlog_drives_capture_frame_then_compare() {
        let (mut ctl, dev) = controller(64, 64);
        let mut refresh = RefreshState::settling(1);

        let set = ctl.request_change_set(true, &mut refresh).unwrap();
        assert!(set.is_full());
        assert_eq!(refresh.backlog, 0);

        dev.push_changes(vec![Rect::new(0, 0, 8, 8)]);
        let set = ctl.request_change_set(true, &mut refresh).unwrap();
        assert_eq!(set.kind, ChangeKind::Diff);
        assert_eq!(set.rects, vec![Rect::new(0, 0, 8, 8)]);
        assert_eq!(
            dev.commands(),
            vec![CaptureCommand::CaptureFrame, CaptureCommand::Compare]
        );
    }

    #[test]
    fn passengers_reuse_driver_result() {
        let (mut ctl, dev) = controller(64, 64);
        let mut driver = RefreshState::default();
        let mut passenger = RefreshState::default();
        ctl.request_change_set(true, &mut driver).unwrap();
        ctl.request_change_set(false, &mut passenger).unwrap();

        dev.push_changes(vec![Rect::new(8, 8, 8, 8)]);
        let a = ctl.request_change_set(true, &mut driver).unwrap();
        let b = ctl.request_change_set(false, &mut passenger).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(dev.command_count(), 2);
    }

    #[test]
    fn lagging_session_catches_up_in_order() {
        let (mut ctl, dev) = controller(64, 64);
        let mut driver = RefreshState::default();
        let mut slow = RefreshState::default();
        ctl.request_change_set(true, &mut driver).unwrap();
        ctl.request_change_set(false, &mut slow).unwrap();

        dev.push_changes(vec![Rect::new(0, 0, 4, 4)]);
        dev.push_changes(vec![Rect::new(32, 0, 4, 4), Rect::new(0, 32, 4, 4)]);
        ctl.request_change_set(true, &mut driver).unwrap();
        ctl.request_change_set(true, &mut driver).unwrap();

        let set = ctl.request_change_set(false, &mut slow).unwrap();
        assert_eq!(
            set.rects,
            vec![
                Rect::new(0, 0, 4, 4),
                Rect::new(32, 0, 4, 4),
                Rect::new(0, 32, 4, 4)
            ]
        );
    }

    #[test]
    fn fresh_session_gets_full_frame() {
        let (mut ctl, dev) = controller(64, 64);
        let mut driver = RefreshState::default();
        ctl.request_change_set(true, &mut driver).unwrap();
        dev.push_changes(vec![Rect::new(0, 0, 4, 4)]);
        ctl.request_change_set(true, &mut driver).unwrap();

        let mut newcomer = RefreshState::default();
        let set = ctl.request_change_set(false, &mut newcomer).unwrap();
        assert!(set.is_full());
        assert_eq!(newcomer.last_seq, Some(2));
    }

    #[test]
    fn resolution_change_reported_once() {
        let (mut ctl, dev) = controller(64, 64);
        dev.change_resolution(128, 128);
        assert!(!ctl.query_resolution_changed(false).unwrap());
        assert!(ctl.query_resolution_changed(true).unwrap());
        assert!(!ctl.query_resolution_changed(true).unwrap());
    }

    #[test]
    fn command_failure_clears_history() {
        let (mut ctl, dev) = controller(64, 64);
        let mut driver = RefreshState::default();
        ctl.request_change_set(true, &mut driver).unwrap();
        dev.fail_commands(true);
        assert!(ctl.request_change_set(true, &mut driver).is_err());

        // nothing left for a passenger to read
        let mut passenger = RefreshState::default();
        assert!(matches!(
            ctl.request_change_set(false, &mut passenger),
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn installed_mode_tracks_reinitialize() {
        let (mut ctl, dev) = controller(64, 64);
        assert!(ctl.mode_is_current().unwrap());

        dev.change_resolution(128, 96);
        assert!(!ctl.mode_is_current().unwrap());
        ctl.reinitialize().unwrap();
        assert!(ctl.mode_is_current().unwrap());

        dev.set_signal(false);
        assert!(ctl.reinitialize().is_err());
        assert!(!ctl.mode_is_current().unwrap());
    }
}
