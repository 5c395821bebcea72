//! Software rectangle encoders.
//!
//! Used when the hardware tile codec cannot serve a client: pixel formats
//! other than 16 bpp true colour, full-frame refreshes, and rectangles the
//! codec gave up on. Work is strictly per rectangle and reads the capture
//! buffer in place.

use crate::error::EncodeError;
use crate::rfb::types::{FrameSource, PixelFormat, Rect};
use crate::rfb::wire::{ENCODING_HEXTILE, ENCODING_RAW};

const TILE: u16 = 16;

const HEXTILE_RAW: u8 = 0x01;
const HEXTILE_BACKGROUND_SPECIFIED: u8 = 0x02;

// ── SoftEncoding ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoftEncoding {
    #[default]
    Raw,
    Hextile,
}

impl SoftEncoding {
    /// First encoding in the client's preference list that we can produce.
    pub fn negotiate(encodings: &[i32]) -> Self {
        encodings
            .iter()
            .find_map(|&e| match e {
                ENCODING_RAW => Some(SoftEncoding::Raw),
                ENCODING_HEXTILE => Some(SoftEncoding::Hextile),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn tag(self) -> i32 {
        match self {
            SoftEncoding::Raw => ENCODING_RAW,
            SoftEncoding::Hextile => ENCODING_HEXTILE,
        }
    }
}

// ── PixelTranslator ──────────────────────────────────────────────

/// Converts native capture pixels into a client's pixel format.
#[derive(Debug, Clone, Copy)]
pub struct PixelTranslator {
    src: PixelFormat,
    dst: PixelFormat,
    identity: bool,
}

impl PixelTranslator {
    pub fn new(src: PixelFormat, dst: PixelFormat) -> Result<Self, EncodeError> {
        dst.validate()?;
        let identity = src.bits_per_pixel == dst.bits_per_pixel
            && src.layout == dst.layout
            && !dst.big_endian;
        Ok(Self { src, dst, identity })
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.dst.bytes_per_pixel()
    }

    pub fn translate(&self, pixel: u32) -> u32 {
        if self.identity {
            return pixel;
        }
        let s = &self.src.layout;
        let d = &self.dst.layout;
        let scale = |v: u32, from: u16, to: u16| {
            if from == 0 {
                0
            } else {
                v * u32::from(to) / u32::from(from)
            }
        };
        let r = (pixel >> s.red_shift) & u32::from(s.red_max);
        let g = (pixel >> s.green_shift) & u32::from(s.green_max);
        let b = (pixel >> s.blue_shift) & u32::from(s.blue_max);
        (scale(r, s.red_max, d.red_max) << d.red_shift)
            | (scale(g, s.green_max, d.green_max) << d.green_shift)
            | (scale(b, s.blue_max, d.blue_max) << d.blue_shift)
    }

    /// Translate and append in the client's byte order.
    pub fn put(&self, pixel: u32, out: &mut Vec<u8>) {
        let p = self.translate(pixel);
        match (self.dst.bits_per_pixel, self.dst.big_endian) {
            (8, _) => out.push(p as u8),
            (16, false) => out.extend_from_slice(&(p as u16).to_le_bytes()),
            (16, true) => out.extend_from_slice(&(p as u16).to_be_bytes()),
            (_, false) => out.extend_from_slice(&p.to_le_bytes()),
            (_, true) => out.extend_from_slice(&p.to_be_bytes()),
        }
    }
}

// ── Encoders ─────────────────────────────────────────────────────

fn check_bounds(frame: &FrameSource, rect: Rect) -> Result<(), EncodeError> {
    let geometry = frame.geometry();
    let needed = (rect.bottom() as usize).saturating_sub(1) * geometry.line_pitch as usize
        + rect.right() as usize * geometry.bytes_per_pixel();
    if rect.is_empty()
        || !rect.fits_within(frame.width(), frame.height())
        || needed > frame.bytes().len()
    {
        return Err(EncodeError::OutOfBounds { rect });
    }
    Ok(())
}

fn read(frame: &FrameSource, x: u16, y: u16) -> Result<u32, EncodeError> {
    frame.pixel(x, y).ok_or(EncodeError::OutOfBounds {
        rect: Rect::new(x, y, 1, 1),
    })
}

/// Encode `rect` with the given software encoding, appending the payload to `out`.
pub fn encode_rect(
    encoding: SoftEncoding,
    frame: &FrameSource,
    rect: Rect,
    tr: &PixelTranslator,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    match encoding {
        SoftEncoding::Raw => encode_raw(frame, rect, tr, out),
        SoftEncoding::Hextile => encode_hextile(frame, rect, tr, out),
    }
}

/// Raw encoding: every pixel, row-major.
pub fn encode_raw(
    frame: &FrameSource,
    rect: Rect,
    tr: &PixelTranslator,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    check_bounds(frame, rect)?;
    out.reserve(rect.area() as usize * tr.bytes_per_pixel());
    for y in rect.y..rect.y + rect.h {
        for x in rect.x..rect.x + rect.w {
            tr.put(read(frame, x, y)?, out);
        }
    }
    Ok(())
}

/// Hextile encoding using solid-background and raw tiles only.
pub fn encode_hextile(
    frame: &FrameSource,
    rect: Rect,
    tr: &PixelTranslator,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    check_bounds(frame, rect)?;
    let mut background: Option<u32> = None;

    let mut ty = rect.y;
    while ty < rect.y + rect.h {
        let th = TILE.min(rect.y + rect.h - ty);
        let mut tx = rect.x;
        while tx < rect.x + rect.w {
            let tw = TILE.min(rect.x + rect.w - tx);
            let tile = Rect::new(tx, ty, tw, th);

            match solid_colour(frame, tile)? {
                Some(colour) if background == Some(colour) => out.push(0),
                Some(colour) => {
                    out.push(HEXTILE_BACKGROUND_SPECIFIED);
                    tr.put(colour, out);
                    background = Some(colour);
                }
                None => {
                    out.push(HEXTILE_RAW);
                    for y in ty..ty + th {
                        for x in tx..tx + tw {
                            tr.put(read(frame, x, y)?, out);
                        }
                    }
                    // background does not survive a raw tile
                    background = None;
                }
            }
            tx += tw;
        }
        ty += th;
    }
    Ok(())
}

fn solid_colour(frame: &FrameSource, tile: Rect) -> Result<Option<u32>, EncodeError> {
    let first = read(frame, tile.x, tile.y)?;
    for y in tile.y..tile.y + tile.h {
        for x in tile.x..tile.x + tile.w {
            if read(frame, x, y)? != first {
                return Ok(None);
            }
        }
    }
    Ok(Some(first))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::types::{ChannelLayout, FrameGeometry};

    fn frame_with(width: u16, height: u16, f: impl Fn(u16, u16) -> u16) -> FrameSource {
        let mut data = Vec::with_capacity(usize::from(width) * usize::from(height) * 2);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&f(x, y).to_le_bytes());
            }
        }
        let geometry = FrameGeometry {
            width,
            height,
            line_pitch: u32::from(width) * 2,
            bits_per_pixel: 16,
        };
        FrameSource::mapped(geometry, ChannelLayout::RGB565, 0, Box::new(data))
    }

    #[test]
    fn negotiate_follows_client_order() {
        assert_eq!(SoftEncoding::negotiate(&[16, 5, 0]), SoftEncoding::Hextile);
        assert_eq!(SoftEncoding::negotiate(&[0, 5]), SoftEncoding::Raw);
        assert_eq!(SoftEncoding::negotiate(&[-223]), SoftEncoding::Raw);
    }

    #[test]
    fn rgb565_to_rgb888() {
        let tr = PixelTranslator::new(PixelFormat::RGB565, PixelFormat::RGB888).unwrap();
        assert_eq!(tr.translate(0xf800), 0x00ff_0000);
        assert_eq!(tr.translate(0x07e0), 0x0000_ff00);
        assert_eq!(tr.translate(0x001f), 0x0000_00ff);
    }

    #[test]
    fn big_endian_client() {
        let dst = PixelFormat {
            big_endian: true,
            ..PixelFormat::RGB565
        };
        let tr = PixelTranslator::new(PixelFormat::RGB565, dst).unwrap();
        let mut out = Vec::new();
        tr.put(0x1234, &mut out);
        assert_eq!(out, vec![0x12, 0x34]);
    }

    #[test]
    fn colour_map_rejected() {
        let dst = PixelFormat {
            true_colour: false,
            ..PixelFormat::RGB565
        };
        assert!(PixelTranslator::new(PixelFormat::RGB565, dst).is_err());
    }

    #[test]
    fn raw_covers_rect() {
        let frame = frame_with(4, 4, |x, y| x + y * 4);
        let tr = PixelTranslator::new(PixelFormat::RGB565, PixelFormat::RGB565).unwrap();
        let mut out = Vec::new();
        encode_raw(&frame, Rect::new(1, 1, 2, 2), &tr, &mut out).unwrap();
        assert_eq!(out, vec![5, 0, 6, 0, 9, 0, 10, 0]);
    }

    #[test]
    fn hextile_reuses_background() {
        let frame = frame_with(32, 16, |_, _| 0x1111);
        let tr = PixelTranslator::new(PixelFormat::RGB565, PixelFormat::RGB565).unwrap();
        let mut out = Vec::new();
        encode_hextile(&frame, Rect::full(32, 16), &tr, &mut out).unwrap();
        assert_eq!(out, vec![HEXTILE_BACKGROUND_SPECIFIED, 0x11, 0x11, 0]);
    }

    #[test]
    fn hextile_raw_tile_resets_background() {
        let frame = frame_with(48, 16, |x, y| if x >= 16 && x < 32 { x + y } else { 7 });
        let tr = PixelTranslator::new(PixelFormat::RGB565, PixelFormat::RGB565).unwrap();
        let mut out = Vec::new();
        encode_hextile(&frame, Rect::full(48, 16), &tr, &mut out).unwrap();

        assert_eq!(&out[..3], &[HEXTILE_BACKGROUND_SPECIFIED, 7, 0]);
        assert_eq!(out[3], HEXTILE_RAW);
        let third = 4 + 16 * 16 * 2;
        assert_eq!(&out[third..], &[HEXTILE_BACKGROUND_SPECIFIED, 7, 0]);
    }

    #[test]
    fn out_of_bounds_rect() {
        let frame = frame_with(8, 8, |_, _| 0);
        let tr = PixelTranslator::new(PixelFormat::RGB565, PixelFormat::RGB565).unwrap();
        let mut out = Vec::new();
        let err = encode_raw(&frame, Rect::new(4, 4, 8, 8), &tr, &mut out).unwrap_err();
        assert!(matches!(err, EncodeError::OutOfBounds { .. }));
    }
}
