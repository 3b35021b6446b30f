//! Layer model: overlays, areas, transparency and the color tables shared by
//! the engines.

use core::ops::Range;

use embedded_graphics_core::pixelcolor::{Rgb888, RgbColor};
use embedded_graphics_core::primitives::Rectangle;

use crate::errors::Error;
use crate::format::PixelFormat;

/// Number of entries in the color lookup table and the adjustment curves.
pub const CLUT_SIZE: usize = 256;

/// Number of entries in the dither table.
pub const DITHER_SIZE: usize = 4;

/// Rectangle inside an overlay, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Area {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Area {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub const fn pixels(&self) -> u32 {
        self.w * self.h
    }

    pub const fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    pub const fn same_size(&self, other: &Area) -> bool {
        self.w == other.w && self.h == other.h
    }

    /// Exclusive right edge, saturating at `u32::MAX`.
    pub const fn right(&self) -> u32 {
        self.x.saturating_add(self.w)
    }

    /// Exclusive bottom edge, saturating at `u32::MAX`.
    pub const fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }
}

impl From<Rectangle> for Area {
    /// Negative coordinates are clipped to the origin.
    fn from(rect: Rectangle) -> Self {
        let x = rect.top_left.x.max(0) as u32;
        let y = rect.top_left.y.max(0) as u32;
        let clip_x = rect.top_left.x.min(0).unsigned_abs();
        let clip_y = rect.top_left.y.min(0).unsigned_abs();

        Area::new(
            x,
            y,
            rect.size.width.saturating_sub(clip_x),
            rect.size.height.saturating_sub(clip_y),
        )
    }
}

/// How the layer alpha is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    /// One alpha value for the whole layer
    #[default]
    Constant = 0,
    /// Alpha taken from each pixel
    PerPixel = 1,
}

impl TryFrom<u8> for BlendMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BlendMode::Constant),
            1 => Ok(BlendMode::PerPixel),
            _ => Err(Error::UnsupportedMode),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transparency {
    pub alpha: u8,
    pub mode: BlendMode,
}

impl Transparency {
    pub const fn new(alpha: u8, mode: BlendMode) -> Self {
        Self { alpha, mode }
    }
}

impl Default for Transparency {
    fn default() -> Self {
        Self::new(0xff, BlendMode::Constant)
    }
}

/// One addressable pixel surface.
///
/// The overlay only describes memory owned elsewhere. An engine borrows it
/// for the duration of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlay {
    /// Overlay number in the owning framebuffer device
    pub index: u8,
    /// Start address of the pixel buffer
    pub fbmem: usize,
    /// Length of the pixel buffer in bytes
    pub fblen: usize,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
    pub bpp: u32,
    /// Resolution as seen by the DMA engine
    pub xres: u32,
    pub yres: u32,
    /// Selected area
    pub sarea: Area,
    pub blank: bool,
    pub transp: Transparency,
    pub chromakey: u32,
    pub color: u32,
}

impl Overlay {
    /// Describes a `xres` x `yres` surface with a tightly packed stride and
    /// the whole surface selected.
    ///
    /// # Safety
    ///
    /// `fbmem` must be valid for reads and writes of `fblen` bytes for as long
    /// as the overlay is handed to an engine, and no other code may access
    /// that memory while a transfer targeting it is running.
    pub unsafe fn new(
        index: u8,
        fbmem: usize,
        fblen: usize,
        format: PixelFormat,
        xres: u32,
        yres: u32,
    ) -> Self {
        Self {
            index,
            fbmem,
            fblen,
            stride: format.bytes(xres),
            format,
            bpp: format.bits_per_pixel(),
            xres,
            yres,
            sarea: Area::new(0, 0, xres, yres),
            blank: false,
            transp: Transparency::default(),
            chromakey: 0,
            color: 0,
        }
    }

    /// Same surface, different start address (scratch and pan buffers).
    ///
    /// # Safety
    ///
    /// Same contract as [`Overlay::new`] for the new memory range.
    pub unsafe fn with_memory(&self, fbmem: usize, fblen: usize, xres: u32) -> Self {
        let mut overlay = *self;
        overlay.fbmem = fbmem;
        overlay.fblen = fblen;
        overlay.xres = xres;
        overlay.stride = self.format.bytes(xres);
        overlay
    }

    #[must_use]
    pub fn stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    #[must_use]
    pub fn transparency(mut self, transp: Transparency) -> Self {
        self.transp = transp;
        self
    }

    #[must_use]
    pub fn selected_area(mut self, area: Area) -> Self {
        self.sarea = area;
        self
    }

    /// Memory address of pixel (`x`, `y`).
    pub const fn mem_address(&self, x: u32, y: u32) -> usize {
        self.fbmem + (x * (self.bpp / 8)) as usize + (self.stride * y) as usize
    }

    /// Row pitch programmed into the DMA engine.
    pub const fn pitch(&self) -> u32 {
        self.xres * self.bpp / 8
    }

    /// Whether `area` is non-empty, lies within the surface and ends inside
    /// the buffer.
    pub fn validate(&self, area: &Area) -> bool {
        if area.is_empty() || area.right() > self.xres || area.bottom() > self.yres {
            return false;
        }

        let last_row = (area.bottom() - 1) as usize;
        let row_bytes = area.right() as usize * self.bpp as usize / 8;

        last_row
            .checked_mul(self.stride as usize)
            .and_then(|offset| offset.checked_add(row_bytes))
            .is_some_and(|end| end <= self.fblen)
    }

    pub fn check(&self, area: &Area) -> Result<(), Error> {
        if self.validate(area) {
            Ok(())
        } else {
            log::warn!(
                "overlay {}: area {:?} outside {}x{} (len {})",
                self.index,
                area,
                self.xres,
                self.yres,
                self.fblen
            );
            Err(Error::InvalidArg)
        }
    }

    /// Zero-fills the whole buffer.
    pub(crate) fn clear(&self) {
        // SAFETY: the constructor contract guarantees `fbmem..fbmem+fblen`
        // is valid writable memory.
        unsafe { core::ptr::write_bytes(self.fbmem as *mut u8, 0, self.fblen) }
    }
}

/// Display-wide information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub format: PixelFormat,
    pub xres: u32,
    pub yres: u32,
    pub nplanes: u8,
    pub noverlays: u8,
}

/// Information about the displayed plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneInfo {
    pub fbmem: usize,
    pub fblen: usize,
    pub stride: u32,
    pub display: u8,
    pub bpp: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
}

/// Packs an ARGB8888 value.
pub const fn argb8888(a: u8, r: u8, g: u8, b: u8) -> u32 {
    (a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32
}

/// Opaque ARGB8888 value of an `embedded-graphics` color.
pub fn argb_from_rgb888(color: Rgb888) -> u32 {
    argb8888(0xff, color.r(), color.g(), color.b())
}

/// Color lookup table range. `first..len` selects the entries in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorMap {
    pub first: u16,
    pub len: u16,
    pub red: [u8; CLUT_SIZE],
    pub green: [u8; CLUT_SIZE],
    pub blue: [u8; CLUT_SIZE],
    pub transp: [u8; CLUT_SIZE],
}

impl ColorMap {
    pub const fn new(first: u16, len: u16) -> Self {
        Self {
            first,
            len,
            red: [0; CLUT_SIZE],
            green: [0; CLUT_SIZE],
            blue: [0; CLUT_SIZE],
            transp: [0; CLUT_SIZE],
        }
    }

    /// Indices of the entries carried by this map.
    pub fn range(&self) -> Range<usize> {
        entry_range(self.first, self.len, CLUT_SIZE)
    }

    pub fn set(&mut self, n: usize, red: u8, green: u8, blue: u8) {
        self.red[n] = red;
        self.green[n] = green;
        self.blue[n] = blue;
    }

    /// Hardware encoding of entry `n`.
    pub fn rgb(&self, n: usize) -> u32 {
        table_rgb(self.red[n], self.green[n], self.blue[n])
    }
}

impl Default for ColorMap {
    fn default() -> Self {
        Self::new(0, CLUT_SIZE as u16)
    }
}

/// Color adjustment (gamma) curves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurveMap {
    pub first: u16,
    pub len: u16,
    pub red: [u8; CLUT_SIZE],
    pub green: [u8; CLUT_SIZE],
    pub blue: [u8; CLUT_SIZE],
}

impl CurveMap {
    pub const fn new(first: u16, len: u16) -> Self {
        Self {
            first,
            len,
            red: [0; CLUT_SIZE],
            green: [0; CLUT_SIZE],
            blue: [0; CLUT_SIZE],
        }
    }

    /// Identity curves over the whole range.
    pub fn linear() -> Self {
        let mut curves = Self::new(0, CLUT_SIZE as u16);
        for n in 0..CLUT_SIZE {
            curves.red[n] = n as u8;
            curves.green[n] = n as u8;
            curves.blue[n] = n as u8;
        }
        curves
    }

    pub fn range(&self) -> Range<usize> {
        entry_range(self.first, self.len, CLUT_SIZE)
    }

    pub fn rgb(&self, n: usize) -> u32 {
        table_rgb(self.red[n], self.green[n], self.blue[n])
    }
}

impl Default for CurveMap {
    fn default() -> Self {
        Self::new(0, CLUT_SIZE as u16)
    }
}

/// Ordered dither table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DitherMap {
    pub first: u8,
    pub len: u8,
    pub data: [u32; DITHER_SIZE],
}

impl DitherMap {
    pub const fn new(data: [u32; DITHER_SIZE]) -> Self {
        Self {
            first: 0,
            len: DITHER_SIZE as u8,
            data,
        }
    }

    pub fn range(&self) -> Range<usize> {
        entry_range(self.first as u16, self.len as u16, DITHER_SIZE)
    }
}

fn entry_range(first: u16, len: u16, size: usize) -> Range<usize> {
    let end = (len as usize).min(size);
    let start = (first as usize).min(end);

    start..end
}

const fn table_rgb(red: u8, green: u8, blue: u8) -> u32 {
    ((red as u32) << 16 | (green as u32) << 8 | blue as u32) & 0x00ff_ffff
}
