//! Decoded pixel grids.
//!
//! A `PixelBuffer` is immutable once built: stages read the input buffer and
//! return a fresh one, so a failed stage never leaves a half-written image
//! behind.

use serde::Serialize;
use thiserror::Error;

/// Channel layout of an 8-bit pixel buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channels {
    Gray,
    Rgb,
    Rgba,
}

impl Channels {
    pub fn count(self) -> usize {
        match self {
            Channels::Gray => 1,
            Channels::Rgb => 3,
            Channels::Rgba => 4,
        }
    }

    pub fn from_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(Channels::Gray),
            3 => Some(Channels::Rgb),
            4 => Some(Channels::Rgba),
            _ => None,
        }
    }

    /// Number of leading channels that carry colour (alpha excluded).
    pub fn color_count(self) -> usize {
        match self {
            Channels::Gray => 1,
            Channels::Rgb | Channels::Rgba => 3,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(self, Channels::Rgba)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("pixel data holds {actual} bytes but {width}x{height}x{channels} needs {expected}")]
    LengthMismatch {
        width: u32,
        height: u32,
        channels: usize,
        expected: usize,
        actual: usize,
    },
    #[error("image dimensions {width}x{height} overflow addressable memory")]
    TooLarge { width: u32, height: u32 },
}

/// Width × height × channels grid of 8-bit samples, row-major, interleaved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    channels: Channels,
    data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(
        width: u32,
        height: u32,
        channels: Channels,
        data: Vec<u8>,
    ) -> Result<Self, BufferError> {
        let expected = Self::byte_len(width, height, channels)?;
        if data.len() != expected {
            return Err(BufferError::LengthMismatch {
                width,
                height,
                channels: channels.count(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Buffer with every sample set to `value`.
    pub fn filled(
        width: u32,
        height: u32,
        channels: Channels,
        value: u8,
    ) -> Result<Self, BufferError> {
        let len = Self::byte_len(width, height, channels)?;
        Self::new(width, height, channels, vec![value; len])
    }

    /// Build a buffer by evaluating `f(x, y)` for every pixel.
    pub fn from_fn<F>(
        width: u32,
        height: u32,
        channels: Channels,
        mut f: F,
    ) -> Result<Self, BufferError>
    where
        F: FnMut(u32, u32) -> [u8; 4],
    {
        let len = Self::byte_len(width, height, channels)?;
        let mut data = Vec::with_capacity(len);
        for y in 0..height {
            for x in 0..width {
                let px = f(x, y);
                data.extend_from_slice(&px[..channels.count()]);
            }
        }
        Self::new(width, height, channels, data)
    }

    fn byte_len(width: u32, height: u32, channels: Channels) -> Result<usize, BufferError> {
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(channels.count()))
            .ok_or(BufferError::TooLarge { width, height })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> Channels {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Samples of the pixel at `(x, y)`; panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let stride = self.channels.count();
        let offset = (y as usize * self.width as usize + x as usize) * stride;
        &self.data[offset..offset + stride]
    }

    /// Iterate pixels as sample slices in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.channels.count())
    }

    /// Rec. 601 luma of every pixel.
    pub fn luma(&self) -> Vec<u8> {
        self.pixels().map(|px| luma_of(px, self.channels)).collect()
    }

    /// New buffer of the same shape with every colour sample passed through
    /// `f`; alpha is copied unchanged.
    pub fn map_color<F>(&self, mut f: F) -> Self
    where
        F: FnMut(u8) -> u8,
    {
        let stride = self.channels.count();
        let color = self.channels.color_count();
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(idx, &v)| if idx % stride < color { f(v) } else { v })
            .collect();
        Self {
            width: self.width,
            height: self.height,
            channels: self.channels,
            data,
        }
    }
}

pub(crate) fn luma_of(px: &[u8], channels: Channels) -> u8 {
    match channels {
        Channels::Gray => px[0],
        Channels::Rgb | Channels::Rgba => clamp_sample(
            0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32,
        ),
    }
}

/// Round and saturate an intermediate sample into the 8-bit range.
pub fn clamp_sample(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 255.0) as u8
}
