//! Device-node implementations of [`CaptureDevice`] and [`TileCodecDevice`].
//!
//! # Platform
//!
//! Linux only. Both blocks are driven through ioctls on character devices
//! and expose their buffers through `mmap`. All unsafe FFI calls are
//! confined to this module.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use tracing::{debug, info};

use crate::error::{CaptureError, EncodeError};
use crate::rfb::device::{CaptureCommand, CaptureDevice, CaptureInfo, TileCodecDevice, TileInfo};
use crate::rfb::types::{ChannelLayout, MappedFrame, Rect};

pub const DEFAULT_CAPTURE_NODE: &str = "/dev/vcd";
pub const DEFAULT_CODEC_NODE: &str = "/dev/hextile";

// ── Driver ABI ───────────────────────────────────────────────────

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct RawVcdInfo {
    vcd_fb: u32,
    pixel_clock: u32,
    line_pitch: u32,
    hdisp: i32,
    hfrontporch: i32,
    hsync: i32,
    hbackporch: i32,
    vdisp: i32,
    vfrontporch: i32,
    vsync: i32,
    vbackporch: i32,
    refresh_rate: i32,
    hpositive: i32,
    vpositive: i32,
    bpp: i32,
    r_max: i32,
    g_max: i32,
    b_max: i32,
    r_shift: i32,
    g_shift: i32,
    b_shift: i32,
    mode: i32,
    reg: u32,
    reg_val: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct RawRect {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
struct RawEceCmd {
    framebuf: u32,
    gap_len: u32,
    buf: *mut std::ffi::c_char,
    len: i32,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    lp: i32,
}

impl RawEceCmd {
    fn zeroed() -> Self {
        Self {
            framebuf: 0,
            gap_len: 0,
            buf: std::ptr::null_mut(),
            len: 0,
            x: 0,
            y: 0,
            w: 0,
            h: 0,
            lp: 0,
        }
    }
}

mod ioctls {
    use super::{RawEceCmd, RawRect, RawVcdInfo};

    nix::ioctl_read!(vcd_get_info, b'v', 1, RawVcdInfo);
    nix::ioctl_write_ptr!(vcd_send_cmd, b'v', 2, u32);
    nix::ioctl_read!(vcd_check_res, b'v', 3, i32);
    nix::ioctl_read!(vcd_get_diff, b'v', 4, RawRect);
    nix::ioctl_read!(vcd_diff_count, b'v', 5, i32);

    nix::ioctl_read!(ece_get_encoded, b'k', 1, RawEceCmd);
    nix::ioctl_write_ptr!(ece_set_fb, b'k', 2, RawEceCmd);
    nix::ioctl_write_ptr!(ece_set_lp, b'k', 3, RawEceCmd);
    nix::ioctl_read!(ece_get_offset, b'k', 4, u32);
    nix::ioctl_none!(ece_clear_offset, b'k', 5);
    nix::ioctl_none!(ece_reset, b'k', 7);
}

fn open_node(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn clamp_u16(v: i32) -> u16 {
    v.clamp(0, i32::from(u16::MAX)) as u16
}

fn codec_err(op: &str, e: nix::Error) -> EncodeError {
    EncodeError::DeviceUnavailable(format!("{op}: {e}"))
}

impl MappedFrame for Mmap {
    fn bytes(&self) -> &[u8] {
        self
    }
}

// ── VcdDevice ────────────────────────────────────────────────────

/// The capture engine behind `/dev/vcd`.
pub struct VcdDevice {
    file: File,
}

impl VcdDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        let file = open_node(path)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {e}", path.display())))?;
        info!(node = %path.display(), "capture device opened");
        Ok(Self { file })
    }
}

impl CaptureDevice for VcdDevice {
    fn send_command(&mut self, cmd: CaptureCommand) -> Result<(), CaptureError> {
        let value = cmd as u32;
        let res = unsafe { ioctls::vcd_send_cmd(self.file.as_raw_fd(), &value) };
        res.map_err(std::io::Error::from)?;
        Ok(())
    }

    fn resolution_changed(&mut self) -> Result<bool, CaptureError> {
        let mut changed: i32 = 0;
        let res = unsafe { ioctls::vcd_check_res(self.file.as_raw_fd(), &mut changed) };
        res.map_err(std::io::Error::from)?;
        Ok(changed != 0)
    }

    fn info(&mut self) -> Result<CaptureInfo, CaptureError> {
        let mut raw = RawVcdInfo::default();
        let res = unsafe { ioctls::vcd_get_info(self.file.as_raw_fd(), &mut raw) };
        res.map_err(std::io::Error::from)?;
        debug!(
            width = raw.hdisp,
            height = raw.vdisp,
            line_pitch = raw.line_pitch,
            bpp = raw.bpp,
            mode = raw.mode,
            "capture info"
        );
        Ok(CaptureInfo {
            fb_addr: raw.vcd_fb,
            width: raw.hdisp.max(0) as u32,
            height: raw.vdisp.max(0) as u32,
            line_pitch: raw.line_pitch,
            bytes_per_pixel: raw.bpp.max(0) as u32,
            layout: ChannelLayout {
                red_max: clamp_u16(raw.r_max),
                green_max: clamp_u16(raw.g_max),
                blue_max: clamp_u16(raw.b_max),
                red_shift: raw.r_shift.clamp(0, 31) as u8,
                green_shift: raw.g_shift.clamp(0, 31) as u8,
                blue_shift: raw.b_shift.clamp(0, 31) as u8,
            },
            refresh_rate: raw.refresh_rate.max(0) as u32,
        })
    }

    fn change_count(&mut self) -> Result<usize, CaptureError> {
        let mut count: i32 = 0;
        let res = unsafe { ioctls::vcd_diff_count(self.file.as_raw_fd(), &mut count) };
        res.map_err(std::io::Error::from)?;
        Ok(count.max(0) as usize)
    }

    fn next_change(&mut self) -> Result<Rect, CaptureError> {
        let mut raw = RawRect::default();
        let res = unsafe { ioctls::vcd_get_diff(self.file.as_raw_fd(), &mut raw) };
        res.map_err(std::io::Error::from)?;
        let cap = |v: u32| v.min(u32::from(u16::MAX)) as u16;
        Ok(Rect::new(cap(raw.x), cap(raw.y), cap(raw.w), cap(raw.h)))
    }

    fn map_frame(&mut self, len: usize) -> Result<Box<dyn MappedFrame>, CaptureError> {
        let map = unsafe { MmapOptions::new().len(len).map(&self.file) }?;
        Ok(Box::new(map))
    }
}

// ── EceDevice ────────────────────────────────────────────────────

/// The tile codec behind `/dev/hextile`.
pub struct EceDevice {
    file: File,
    window: Option<Mmap>,
}

impl EceDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EncodeError> {
        let path = path.as_ref();
        let file = open_node(path)
            .map_err(|e| EncodeError::DeviceUnavailable(format!("{}: {e}", path.display())))?;
        info!(node = %path.display(), "tile codec opened");
        Ok(Self { file, window: None })
    }
}

impl TileCodecDevice for EceDevice {
    fn set_framebuffer(&mut self, fb_addr: u32) -> Result<(), EncodeError> {
        let mut cmd = RawEceCmd::zeroed();
        cmd.framebuf = fb_addr;
        let res = unsafe { ioctls::ece_set_fb(self.file.as_raw_fd(), &cmd) };
        res.map_err(|e| codec_err("set framebuffer", e))?;
        Ok(())
    }

    fn set_line_pitch(&mut self, line_pitch: u32) -> Result<(), EncodeError> {
        let mut cmd = RawEceCmd::zeroed();
        cmd.lp = line_pitch.min(i32::MAX as u32) as i32;
        let res = unsafe { ioctls::ece_set_lp(self.file.as_raw_fd(), &cmd) };
        res.map_err(|e| codec_err("set line pitch", e))?;
        Ok(())
    }

    fn offset(&mut self) -> Result<u32, EncodeError> {
        let mut offset: u32 = 0;
        let res = unsafe { ioctls::ece_get_offset(self.file.as_raw_fd(), &mut offset) };
        res.map_err(|e| codec_err("get offset", e))?;
        Ok(offset)
    }

    fn clear_offset(&mut self) -> Result<(), EncodeError> {
        let res = unsafe { ioctls::ece_clear_offset(self.file.as_raw_fd()) };
        res.map_err(|e| codec_err("clear offset", e))?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), EncodeError> {
        let res = unsafe { ioctls::ece_reset(self.file.as_raw_fd()) };
        res.map_err(|e| codec_err("reset", e))?;
        Ok(())
    }

    fn encode(&mut self, rect: Rect) -> Result<TileInfo, EncodeError> {
        let mut cmd = RawEceCmd::zeroed();
        cmd.x = i32::from(rect.x);
        cmd.y = i32::from(rect.y);
        cmd.w = i32::from(rect.w);
        cmd.h = i32::from(rect.h);
        let res = unsafe { ioctls::ece_get_encoded(self.file.as_raw_fd(), &mut cmd) };
        res.map_err(|e| codec_err("encode", e))?;
        Ok(TileInfo {
            len: cmd.len.max(0) as u32,
            gap_len: cmd.gap_len,
        })
    }

    fn map_output(&mut self, len: usize) -> Result<(), EncodeError> {
        self.window = None;
        let map = unsafe { MmapOptions::new().len(len).map(&self.file) }
            .map_err(|e| EncodeError::DeviceUnavailable(format!("map output window: {e}")))?;
        self.window = Some(map);
        Ok(())
    }

    fn output(&self) -> &[u8] {
        self.window.as_deref().unwrap_or(&[])
    }
}
