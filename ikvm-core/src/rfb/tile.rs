//! Hardware tile encoding.
//!
//! The tile codec writes Hextile data for a rectangle into a ring buffer it
//! shares with us through `mmap`. The device tracks the write offset; we
//! rewind it whenever the next tile could run past the end of the ring.

use tracing::{debug, warn};

use crate::error::{EncodeError, TransportError};
use crate::rfb::device::TileCodecDevice;
use crate::rfb::types::{FrameSource, Rect};
use crate::rfb::wire::{ENCODING_HEXTILE, WireWriter};

/// One encoded rectangle, borrowed from the codec's output window.
#[derive(Debug, Clone, Copy)]
pub struct EncodedTile<'a> {
    pub rect: Rect,
    pub data: &'a [u8],
}

pub struct TileEncoder {
    device: Option<Box<dyn TileCodecDevice>>,
    retry_limit: u32,
    /// Usable bytes of the ring: one frame of pixel data.
    ring_len: usize,
    width: u16,
    height: u16,
    configured: bool,
    /// The previous tile took over half of the remaining ring.
    rewind_pending: bool,
    stalls: u64,
}

impl TileEncoder {
    pub fn new(device: Box<dyn TileCodecDevice>, retry_limit: u32) -> Self {
        Self {
            device: Some(device),
            ..Self::unavailable(retry_limit)
        }
    }

    /// An encoder without a codec; every rectangle goes to software.
    pub fn unavailable(retry_limit: u32) -> Self {
        Self {
            device: None,
            retry_limit: retry_limit.max(1),
            ring_len: 0,
            width: 0,
            height: 0,
            configured: false,
            rewind_pending: false,
            stalls: 0,
        }
    }

    /// Whether hardware tiles can be requested for the current frame.
    pub fn is_available(&self) -> bool {
        self.configured
    }

    /// Encodes that ran out of retries.
    pub fn stall_count(&self) -> u64 {
        self.stalls
    }

    /// Point the codec at a freshly mapped capture buffer.
    ///
    /// A placeholder frame has no physical buffer, so the codec is left
    /// unconfigured until the next real mode.
    pub fn configure(&mut self, frame: &FrameSource) -> Result<(), EncodeError> {
        self.configured = false;
        self.rewind_pending = false;
        let Some(dev) = self.device.as_deref_mut() else {
            return Ok(());
        };
        if frame.is_placeholder() {
            return Ok(());
        }
        let geometry = frame.geometry();
        dev.clear_offset()?;
        dev.set_framebuffer(frame.fb_addr())?;
        dev.set_line_pitch(geometry.line_pitch)?;
        dev.map_output(geometry.frame_size())?;

        self.ring_len =
            usize::from(geometry.width) * usize::from(geometry.height) * geometry.bytes_per_pixel();
        self.width = geometry.width;
        self.height = geometry.height;
        self.configured = true;
        debug!(
            fb_addr = frame.fb_addr(),
            line_pitch = geometry.line_pitch,
            ring = self.ring_len,
            "tile codec configured"
        );
        Ok(())
    }

    /// Full codec reset, used after a stall.
    pub fn reset(&mut self) -> Result<(), EncodeError> {
        self.rewind_pending = false;
        match self.device.as_deref_mut() {
            Some(dev) => {
                dev.reset()?;
                dev.clear_offset()
            }
            None => Ok(()),
        }
    }

    /// Ask the codec for `rect`.
    ///
    /// Output that would overrun the ring, or a length of one byte or less,
    /// rewinds the offset and retries. After `retry_limit` attempts the
    /// codec is considered stalled.
    pub fn encode_region(&mut self, rect: Rect) -> Result<EncodedTile<'_>, EncodeError> {
        if !self.configured {
            return Err(EncodeError::DeviceUnavailable("tile codec not configured".into()));
        }
        if rect.is_empty() || !rect.fits_within(self.width, self.height) {
            return Err(EncodeError::OutOfBounds { rect });
        }
        let ring_len = self.ring_len;
        let dev = self
            .device
            .as_deref_mut()
            .ok_or_else(|| EncodeError::DeviceUnavailable("no tile codec".into()))?;

        if std::mem::take(&mut self.rewind_pending) {
            dev.clear_offset()?;
        }

        let mut span = None;
        for attempt in 1..=self.retry_limit {
            let offset = dev.offset()? as usize;
            let info = dev.encode(rect)?;
            let len = info.len as usize;
            let start = offset + info.gap_len as usize;
            let end = start + len;

            if end >= ring_len || len <= 1 || end > dev.output().len() {
                debug!(attempt, offset, len, gap = info.gap_len, "rewinding tile ring");
                dev.clear_offset()?;
                continue;
            }
            if offset + len * 2 >= ring_len {
                self.rewind_pending = true;
            }
            span = Some((start, end));
            break;
        }

        let Some((start, end)) = span else {
            self.stalls += 1;
            warn!(?rect, attempts = self.retry_limit, "tile codec stalled");
            return Err(EncodeError::DeviceStalled {
                attempts: self.retry_limit,
            });
        };
        Ok(EncodedTile {
            rect,
            data: &dev.output()[start..end],
        })
    }
}

/// Write a Hextile rectangle header followed by the tile payload.
pub fn send_encoded_tile(
    writer: &mut WireWriter<'_>,
    tile: &EncodedTile<'_>,
) -> Result<(), TransportError> {
    writer.rect_header(tile.rect, ENCODING_HEXTILE)?;
    writer.payload(tile.data)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::capture::CaptureController;
    use crate::rfb::fake::{CodecControl, FakeCaptureDevice, FakeTileCodec, RecordingSink};
    use crate::rfb::wire::RectCount;
    use bytes::BytesMut;

    fn setup(retry: u32) -> (TileEncoder, CodecControl) {
        let mut ctl = CaptureController::new(Box::new(FakeCaptureDevice::new(64, 64)));
        let frame = ctl.reinitialize().unwrap();
        let codec = FakeTileCodec::new();
        let control = codec.control();
        let mut enc = TileEncoder::new(Box::new(codec), retry);
        enc.configure(&frame).unwrap();
        (enc, control)
    }

    #[test]
    fn configure_programs_codec() {
        let (enc, control) = setup(4);
        assert!(enc.is_available());
        assert_eq!(control.line_pitch(), Some(128));
        assert_eq!(control.fb_addr(), Some(0x3e20_0000));
    }

    #[test]
    fn encodes_rect() {
        let (mut enc, _) = setup(4);
        let rect = Rect::new(16, 16, 32, 16);
        let tile = enc.encode_region(rect).unwrap();
        assert_eq!(tile.data, FakeTileCodec::payload_for(rect).as_slice());
    }

    #[test]
    fn degenerate_output_is_retried() {
        let (mut enc, control) = setup(4);
        control.degenerate_next(2);
        let tile = enc.encode_region(Rect::new(0, 0, 16, 16)).unwrap();
        assert_eq!(tile.data.len(), 3);
        assert_eq!(control.encode_calls(), 3);
        assert!(control.clear_calls() >= 3);
    }

    #[test]
    fn stall_surfaces_after_retry_limit() {
        let (mut enc, control) = setup(3);
        control.stall(true);
        let err = enc.encode_region(Rect::new(0, 0, 16, 16)).unwrap_err();
        assert!(matches!(err, EncodeError::DeviceStalled { attempts: 3 }));
        assert_eq!(control.encode_calls(), 3);
        assert_eq!(enc.stall_count(), 1);
    }

    #[test]
    fn placeholder_leaves_codec_unconfigured() {
        let mut enc = TileEncoder::new(Box::new(FakeTileCodec::new()), 4);
        enc.configure(&FrameSource::placeholder()).unwrap();
        assert!(!enc.is_available());
        assert!(matches!(
            enc.encode_region(Rect::new(0, 0, 8, 8)),
            Err(EncodeError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn rejects_rect_outside_frame() {
        let (mut enc, _) = setup(4);
        assert!(matches!(
            enc.encode_region(Rect::new(60, 60, 8, 8)),
            Err(EncodeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn tile_goes_out_with_hextile_header() {
        let (mut enc, _) = setup(4);
        let sink = RecordingSink::new();
        let mut out_sink = sink.clone();
        let mut buf = BytesMut::new();
        let rect = Rect::new(0, 0, 16, 16);
        {
            let tile = enc.encode_region(rect).unwrap();
            let mut w = WireWriter::new(&mut buf, &mut out_sink, 1024);
            w.begin_update(RectCount::Known(1)).unwrap();
            send_encoded_tile(&mut w, &tile).unwrap();
            w.finish().unwrap();
        }
        let updates = sink.updates(2).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].rects[0].rect, rect);
        assert_eq!(updates[0].rects[0].encoding, ENCODING_HEXTILE);
    }
}
