//! Shared types for the capture → encode → wire pipeline.
//!
//! [`FrameSource`] is the server's view of the capture buffer,
//! [`ChangeSet`] is the per-tick damage list shared by every session, and
//! [`PixelFormat`] is the 16-byte RFB pixel format exchanged with viewers.

use crate::error::EncodeError;

// ── Rect ─────────────────────────────────────────────────────────

/// A rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

impl Rect {
    pub const fn new(x: u16, y: u16, w: u16, h: u16) -> Self {
        Self { x, y, w, h }
    }

    /// The whole frame.
    pub const fn full(width: u16, height: u16) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Pixel count.
    pub fn area(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        u32::from(self.x) + u32::from(self.w)
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        u32::from(self.y) + u32::from(self.h)
    }

    pub fn fits_within(&self, width: u16, height: u16) -> bool {
        self.right() <= u32::from(width) && self.bottom() <= u32::from(height)
    }

    /// Intersect with a `width × height` frame anchored at the origin.
    ///
    /// Returns `None` when nothing of the rectangle remains.
    pub fn clip(&self, width: u16, height: u16) -> Option<Rect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.w.min(width - self.x);
        let h = self.h.min(height - self.y);
        let r = Rect::new(self.x, self.y, w, h);
        (!r.is_empty()).then_some(r)
    }
}

// ── ChannelLayout ────────────────────────────────────────────────

/// Maximum values and bit shifts of a true-colour pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelLayout {
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl ChannelLayout {
    /// 5-6-5 layout produced by the capture engine.
    pub const RGB565: Self = Self {
        red_max: 31,
        green_max: 63,
        blue_max: 31,
        red_shift: 11,
        green_shift: 5,
        blue_shift: 0,
    };

    /// 8-8-8 layout in the low 24 bits of a 32-bit pixel.
    pub const RGB888: Self = Self {
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 16,
        green_shift: 8,
        blue_shift: 0,
    };
}

// ── PixelFormat ──────────────────────────────────────────────────

/// The RFB `PIXEL_FORMAT` structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub layout: ChannelLayout,
}

impl PixelFormat {
    /// Encoded size on the wire.
    pub const SIZE: usize = 16;

    /// Native format of the capture engine.
    pub const RGB565: Self = Self {
        bits_per_pixel: 16,
        depth: 16,
        big_endian: false,
        true_colour: true,
        layout: ChannelLayout::RGB565,
    };

    /// Little-endian little-endian 32-bit true colour.
    pub const RGB888: Self = Self {
        bits_per_pixel: 32,
        depth: 24,
        big_endian: false,
        true_colour: true,
        layout: ChannelLayout::RGB888,
    };

    /// Server format for a capture buffer with the given depth and layout.
    pub fn native(bits_per_pixel: u8, layout: ChannelLayout) -> Self {
        Self {
            bits_per_pixel,
            depth: bits_per_pixel.min(24),
            big_endian: false,
            true_colour: true,
            layout,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel / 8)
    }

    /// Whether the hardware tile codec can produce this format directly.
    pub fn is_hardware_compatible(&self) -> bool {
        self.bits_per_pixel == 16 && self.true_colour
    }

    /// Serialize to the 16-byte wire structure (multi-byte fields big-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.bits_per_pixel;
        buf[1] = self.depth;
        buf[2] = self.big_endian as u8;
        buf[3] = self.true_colour as u8;
        buf[4..6].copy_from_slice(&self.layout.red_max.to_be_bytes());
        buf[6..8].copy_from_slice(&self.layout.green_max.to_be_bytes());
        buf[8..10].copy_from_slice(&self.layout.blue_max.to_be_bytes());
        buf[10] = self.layout.red_shift;
        buf[11] = self.layout.green_shift;
        buf[12] = self.layout.blue_shift;
        buf
    }

    /// Deserialize from the 16-byte wire structure.
    pub fn decode(data: &[u8; Self::SIZE]) -> Self {
        Self {
            bits_per_pixel: data[0],
            depth: data[1],
            big_endian: data[2] != 0,
            true_colour: data[3] != 0,
            layout: ChannelLayout {
                red_max: u16::from_be_bytes([data[4], data[5]]),
                green_max: u16::from_be_bytes([data[6], data[7]]),
                blue_max: u16::from_be_bytes([data[8], data[9]]),
                red_shift: data[10],
                green_shift: data[11],
                blue_shift: data[12],
            },
        }
    }

    /// Reject formats the software path cannot produce.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if !self.true_colour {
            return Err(EncodeError::UnsupportedFormat("colour-map pixel formats"));
        }
        match self.bits_per_pixel {
            8 | 16 | 32 => Ok(()),
            _ => Err(EncodeError::UnsupportedFormat("bits per pixel must be 8, 16 or 32")),
        }
    }
}

// ── ChangeSet ────────────────────────────────────────────────────

/// What produced a [`ChangeSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// A complete capture; the set is one full-frame rectangle.
    Full,
    /// A hardware compare against the previous capture.
    Diff,
}

/// Ordered damage rectangles for one capture cycle.
///
/// `seq` increases by one with every driven capture, so a session can tell
/// whether a diff is relative to the last frame it was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub seq: u64,
    pub kind: ChangeKind,
    pub rects: Vec<Rect>,
}

impl ChangeSet {
    /// A single full-frame rectangle.
    pub fn full(seq: u64, width: u16, height: u16) -> Self {
        Self {
            seq,
            kind: ChangeKind::Full,
            rects: vec![Rect::full(width, height)],
        }
    }

    /// Hardware-reported damage, clipped to the frame.
    ///
    /// An empty list is normalized to one full-frame rectangle.
    pub fn diff(seq: u64, rects: Vec<Rect>, width: u16, height: u16) -> Self {
        let rects: Vec<Rect> = rects
            .into_iter()
            .filter_map(|r| r.clip(width, height))
            .collect();
        if rects.is_empty() {
            return Self {
                seq,
                kind: ChangeKind::Diff,
                rects: vec![Rect::full(width, height)],
            };
        }
        Self {
            seq,
            kind: ChangeKind::Diff,
            rects,
        }
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.kind == ChangeKind::Full
    }
}

// ── FrameSource ──────────────────────────────────────────────────

/// A read-only mapping of the capture buffer.
pub trait MappedFrame: Send {
    fn bytes(&self) -> &[u8];
}

impl MappedFrame for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl MappedFrame for std::sync::Arc<[u8]> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

/// Geometry of the capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u16,
    pub height: u16,
    /// Row pitch in **bytes** (may exceed `width * bytes_per_pixel`).
    pub line_pitch: u32,
    pub bits_per_pixel: u8,
}

impl FrameGeometry {
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel / 8)
    }

    /// Bytes spanned by the whole frame, padding included.
    pub fn frame_size(&self) -> usize {
        self.line_pitch as usize * usize::from(self.height)
    }
}

enum FrameMemory {
    Mapped(Box<dyn MappedFrame>),
    Placeholder(Vec<u8>),
}

/// The capture buffer currently being served.
///
/// Replaced wholesale by the capture controller on every mode change.
pub struct FrameSource {
    geometry: FrameGeometry,
    layout: ChannelLayout,
    /// Physical address of the buffer, handed to the tile codec.
    fb_addr: u32,
    memory: FrameMemory,
}

impl FrameSource {
    pub const PLACEHOLDER_WIDTH: u16 = 320;
    pub const PLACEHOLDER_HEIGHT: u16 = 240;

    pub fn mapped(
        geometry: FrameGeometry,
        layout: ChannelLayout,
        fb_addr: u32,
        memory: Box<dyn MappedFrame>,
    ) -> Self {
        Self {
            geometry,
            layout,
            fb_addr,
            memory: FrameMemory::Mapped(memory),
        }
    }

    /// Blank 320×240 RGB565 frame served while no video is available.
    pub fn placeholder() -> Self {
        let geometry = FrameGeometry {
            width: Self::PLACEHOLDER_WIDTH,
            height: Self::PLACEHOLDER_HEIGHT,
            line_pitch: u32::from(Self::PLACEHOLDER_WIDTH) * 2,
            bits_per_pixel: 16,
        };
        Self {
            geometry,
            layout: ChannelLayout::RGB565,
            fb_addr: 0,
            memory: FrameMemory::Placeholder(vec![0; geometry.frame_size()]),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.memory, FrameMemory::Placeholder(_))
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn width(&self) -> u16 {
        self.geometry.width
    }

    pub fn height(&self) -> u16 {
        self.geometry.height
    }

    pub fn line_pitch(&self) -> u32 {
        self.geometry.line_pitch
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn fb_addr(&self) -> u32 {
        self.fb_addr
    }

    pub fn full_rect(&self) -> Rect {
        Rect::full(self.geometry.width, self.geometry.height)
    }

    /// Pixel format the server announces in ServerInit.
    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::native(self.geometry.bits_per_pixel, self.layout)
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.memory {
            FrameMemory::Mapped(m) => m.bytes(),
            FrameMemory::Placeholder(v) => v,
        }
    }

    /// Native pixel value at `(x, y)`, or `None` outside the mapping.
    pub fn pixel(&self, x: u16, y: u16) -> Option<u32> {
        let bpp = self.geometry.bytes_per_pixel();
        let offset =
            usize::from(y) * self.geometry.line_pitch as usize + usize::from(x) * bpp;
        let raw = self.bytes().get(offset..offset + bpp)?;
        Some(match *raw {
            [a] => u32::from(a),
            [a, b] => u32::from(u16::from_le_bytes([a, b])),
            [a, b, c] => u32::from_le_bytes([a, b, c, 0]),
            [a, b, c, d] => u32::from_le_bytes([a, b, c, d]),
            _ => return None,
        })
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSource")
            .field("geometry", &self.geometry)
            .field("layout", &self.layout)
            .field("placeholder", &self.is_placeholder())
            .finish()
    }
}

// ── ScreenInfo ───────────────────────────────────────────────────

/// What a newly connecting viewer is told in ServerInit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenInfo {
    pub width: u16,
    pub height: u16,
    pub format: PixelFormat,
    pub name: String,
}

impl ScreenInfo {
    pub fn from_frame(frame: &FrameSource, name: &str) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            format: frame.pixel_format(),
            name: name.to_string(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
