//! Pixel formats understood by the composition pipeline.

use crate::errors::Error;

/// Framebuffer pixel format, numbered as in the framebuffer interface
/// (`FB_FMT_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4-bit RGB
    Rgb4,
    /// 8-bit palette index (CLUT)
    Rgb8,
    /// 16-bit RGB, 5 bits per channel
    Rgb555,
    /// 16-bit RGB, 5-6-5
    Rgb565,
    /// 24-bit packed RGB
    Rgb888,
    /// 32-bit RGB, alpha byte unused
    Rgb32,
    /// 32-bit ARGB8888
    Argb8888,
    /// Packed YUV 4:2:2, Y0 U0 Y1 V0 order
    Yuvp,
    /// Planar YUV 4:2:0
    I420,
}

impl PixelFormat {
    /// Get the bits per pixel for this format
    pub const fn bits_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::Rgb4 => 4,
            PixelFormat::Rgb8 => 8,
            PixelFormat::Rgb555 | PixelFormat::Rgb565 | PixelFormat::Yuvp => 16,
            PixelFormat::I420 => 12,
            PixelFormat::Rgb888 => 24,
            PixelFormat::Rgb32 | PixelFormat::Argb8888 => 32,
        }
    }

    /// Format code programmed into the layer pixel-format register.
    pub const fn hw_code(&self) -> u8 {
        match self {
            PixelFormat::Rgb565 => 0x00,
            PixelFormat::Rgb555 => 0x01,
            PixelFormat::Rgb888 => 0x03,
            PixelFormat::Rgb32 => 0x04,
            PixelFormat::Yuvp => 0x05,
            PixelFormat::I420 => 0x07,
            PixelFormat::Rgb4 => 0x09,
            PixelFormat::Rgb8 => 0x0a,
            PixelFormat::Argb8888 => 0x0b,
        }
    }

    /// Whether pixels are palette indices resolved through the CLUT.
    pub const fn is_clut(&self) -> bool {
        matches!(self, PixelFormat::Rgb8)
    }

    /// Whether the DMA burst engine requires row widths that are a multiple
    /// of four pixels for this format.
    pub const fn needs_burst_alignment(&self) -> bool {
        matches!(self, PixelFormat::Rgb565 | PixelFormat::Yuvp)
    }

    /// Write-back sampling mode for an output in this format.
    pub const fn smpn_mode(&self) -> u8 {
        match self {
            PixelFormat::Rgb565 => 5,
            _ => 3,
        }
    }

    /// Bytes occupied by `pixels` pixels of this format, rounded down.
    pub const fn bytes(&self, pixels: u32) -> u32 {
        pixels * self.bits_per_pixel() / 8
    }
}

impl TryFrom<u8> for PixelFormat {
    type Error = Error;

    /// Converts a framebuffer `FB_FMT_*` number.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            5 => PixelFormat::Rgb4,
            6 => PixelFormat::Rgb8,
            10 => PixelFormat::Rgb555,
            11 => PixelFormat::Rgb565,
            12 => PixelFormat::Rgb888,
            13 => PixelFormat::Rgb32,
            21 => PixelFormat::Argb8888,
            45 => PixelFormat::Yuvp,
            51 => PixelFormat::I420,
            _ => return Err(Error::NotSupported),
        })
    }
}

impl From<PixelFormat> for u8 {
    fn from(value: PixelFormat) -> Self {
        match value {
            PixelFormat::Rgb4 => 5,
            PixelFormat::Rgb8 => 6,
            PixelFormat::Rgb555 => 10,
            PixelFormat::Rgb565 => 11,
            PixelFormat::Rgb888 => 12,
            PixelFormat::Rgb32 => 13,
            PixelFormat::Argb8888 => 21,
            PixelFormat::Yuvp => 45,
            PixelFormat::I420 => 51,
        }
    }
}
