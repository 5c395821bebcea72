//! Capability interfaces of the two hardware blocks the update engine drives.
//!
//! The capture engine (VCD) grabs the host's video output into memory and
//! can diff consecutive captures. The tile codec (ECE) compresses a
//! rectangle of the captured frame into Hextile data inside a ring buffer.
//! Real implementations live in [`linux`](super::linux); deterministic
//! fakes live in [`fake`](super::fake).

use crate::error::{CaptureError, EncodeError};
use crate::rfb::types::{ChannelLayout, MappedFrame, Rect};

// ── Capture engine ───────────────────────────────────────────────

/// Upper bound on the rectangles preallocated for one change list.
pub const MAX_CHANGE_RECTS: usize = 1024;

/// Commands accepted by the capture engine.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    /// Capture one complete frame.
    CaptureFrame = 0,
    /// Capture two frames back to back (used to prime the comparator).
    CaptureTwoFrames = 1,
    /// Capture and diff against the previous capture.
    Compare = 2,
}

/// Structural description of the current video mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureInfo {
    /// Physical address of the capture buffer.
    pub fb_addr: u32,
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub line_pitch: u32,
    pub bytes_per_pixel: u32,
    pub layout: ChannelLayout,
    /// Refresh rate of the incoming video signal in Hz.
    pub refresh_rate: u32,
}

impl CaptureInfo {
    /// Whether the device is reporting a live signal.
    pub fn has_signal(&self) -> bool {
        self.width > 0 && self.height > 0 && self.line_pitch > 0 && self.bytes_per_pixel > 0
    }

    pub fn frame_size(&self) -> usize {
        self.line_pitch as usize * self.height as usize
    }
}

/// The video capture engine.
pub trait CaptureDevice: Send {
    /// Issue a capture command. Not idempotent: each call starts a new capture.
    fn send_command(&mut self, cmd: CaptureCommand) -> Result<(), CaptureError>;

    /// Whether the incoming video mode changed since the last query.
    fn resolution_changed(&mut self) -> Result<bool, CaptureError>;

    /// Current mode description.
    fn info(&mut self) -> Result<CaptureInfo, CaptureError>;

    /// Number of rectangles produced by the last command.
    fn change_count(&mut self) -> Result<usize, CaptureError>;

    /// Pop the next changed rectangle, in device order.
    fn next_change(&mut self) -> Result<Rect, CaptureError>;

    /// Fetch the whole change list of the last command.
    fn change_rects(&mut self) -> Result<Vec<Rect>, CaptureError> {
        let count = self.change_count()?;
        let mut rects = Vec::with_capacity(count.min(MAX_CHANGE_RECTS));
        for _ in 0..count {
            rects.push(self.next_change()?);
        }
        Ok(rects)
    }

    /// Map `len` bytes of the capture buffer read-only.
    fn map_frame(&mut self, len: usize) -> Result<Box<dyn MappedFrame>, CaptureError>;
}

// ── Tile codec ───────────────────────────────────────────────────

/// Placement of one encoded tile in the codec's output window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {
    /// Encoded length in bytes.
    pub len: u32,
    /// Bytes skipped between the read offset and the start of the data.
    pub gap_len: u32,
}

/// The hardware tile codec.
pub trait TileCodecDevice: Send {
    /// Point the codec at the capture buffer.
    fn set_framebuffer(&mut self, fb_addr: u32) -> Result<(), EncodeError>;

    /// Row pitch of the capture buffer in bytes.
    fn set_line_pitch(&mut self, line_pitch: u32) -> Result<(), EncodeError>;

    /// Current write offset inside the output window.
    fn offset(&mut self) -> Result<u32, EncodeError>;

    /// Rewind the write offset to the start of the window.
    fn clear_offset(&mut self) -> Result<(), EncodeError>;

    /// Full codec reset.
    fn reset(&mut self) -> Result<(), EncodeError>;

    /// Encode `rect` at the current offset.
    fn encode(&mut self, rect: Rect) -> Result<TileInfo, EncodeError>;

    /// Map `len` bytes of the output window.
    fn map_output(&mut self, len: usize) -> Result<(), EncodeError>;

    /// The mapped output window.
    fn output(&self) -> &[u8];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_values_match_driver_abi() {
        assert_eq!(CaptureCommand::CaptureFrame as u32, 0);
        assert_eq!(CaptureCommand::CaptureTwoFrames as u32, 1);
        assert_eq!(CaptureCommand::Compare as u32, 2);
    }

    #[test]
    fn zero_geometry_means_no_signal() {
        let info = CaptureInfo {
            fb_addr: 0,
            width: 0,
            height: 768,
            line_pitch: 2048,
            bytes_per_pixel: 2,
            layout: ChannelLayout::RGB565,
            refresh_rate: 60,
        };
        assert!(!info.has_signal());
        assert!(CaptureInfo { width: 1024, ..info }.has_signal());
    }

    /// Claims an absurd change count but only holds a few rectangles.
    struct BogusCount {
        left: usize,
    }

    impl CaptureDevice for BogusCount {
        fn send_command(&mut self, _cmd: CaptureCommand) -> Result<(), CaptureError> {
            Ok(())
        }

        fn resolution_changed(&mut self) -> Result<bool, CaptureError> {
            Ok(false)
        }

        fn info(&mut self) -> Result<CaptureInfo, CaptureError> {
            Err(CaptureError::DeviceUnavailable("none".into()))
        }

        fn change_count(&mut self) -> Result<usize, CaptureError> {
            Ok(usize::MAX)
        }

        fn next_change(&mut self) -> Result<Rect, CaptureError> {
            if self.left == 0 {
                return Err(CaptureError::DeviceUnavailable("list exhausted".into()));
            }
            self.left -= 1;
            Ok(Rect::new(0, 0, 16, 16))
        }

        fn map_frame(&mut self, _len: usize) -> Result<Box<dyn MappedFrame>, CaptureError> {
            Err(CaptureError::DeviceUnavailable("none".into()))
        }
    }

    #[test]
    fn garbage_change_count_fails_without_huge_allocation() {
        let mut dev = BogusCount { left: 3 };
        assert!(matches!(
            dev.change_rects(),
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }
}
