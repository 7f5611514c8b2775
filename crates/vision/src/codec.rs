//! Image codec adapter over the `image` crate.
//!
//! Both directions are blocking, CPU-bound calls. Callers on an async runtime
//! must run them on the worker pool, never on the event loop.

use std::{fmt, io::Cursor, str::FromStr};

use image::{
    DynamicImage, ExtendedColorType, GrayImage, ImageEncoder, RgbImage, RgbaImage,
    codecs::jpeg::JpegEncoder,
};
use serde::Serialize;
use thiserror::Error;

use crate::buffer::{Channels, PixelBuffer};

/// Default JPEG quality when none is configured.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("corrupt input: {0}")]
    CorruptInput(String),
    #[error("encode failure: {0}")]
    EncodeFailure(String),
}

/// Transport formats the adapter can read and write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Bmp,
    Tiff,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 4] = [
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Bmp,
        ImageFormat::Tiff,
    ];

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Tiff => "image/tiff",
        }
    }

    /// Canonical short name, as accepted by `format=`.
    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Tiff => "tiff",
        }
    }

    pub fn is_lossy(self) -> bool {
        matches!(self, ImageFormat::Jpeg)
    }

    /// Resolve a `Content-Type` header value; parameters are ignored.
    pub fn from_mime(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(ImageFormat::Jpeg),
            "image/bmp" | "image/x-ms-bmp" | "image/x-bmp" => Some(ImageFormat::Bmp),
            "image/tiff" | "image/tif" => Some(ImageFormat::Tiff),
            _ => None,
        }
    }

    /// Identify the format from the leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            image::ImageFormat::Png => Some(ImageFormat::Png),
            image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
            image::ImageFormat::Bmp => Some(ImageFormat::Bmp),
            image::ImageFormat::Tiff => Some(ImageFormat::Tiff),
            _ => None,
        }
    }

    fn native(self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Bmp => image::ImageFormat::Bmp,
            ImageFormat::Tiff => image::ImageFormat::Tiff,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "bmp" => Ok(ImageFormat::Bmp),
            "tiff" | "tif" => Ok(ImageFormat::Tiff),
            _ => ImageFormat::from_mime(&lowered)
                .ok_or_else(|| CodecError::UnsupportedFormat(format!("unknown format {s:?}"))),
        }
    }
}

/// Formats accepted on upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatAllowList {
    formats: Vec<ImageFormat>,
}

impl FormatAllowList {
    pub fn new(formats: impl IntoIterator<Item = ImageFormat>) -> Self {
        let mut list: Vec<ImageFormat> = Vec::new();
        for format in formats {
            if !list.contains(&format) {
                list.push(format);
            }
        }
        Self { formats: list }
    }

    /// Parse a comma separated list such as `png,jpeg`.
    pub fn parse(list: &str) -> Result<Self, CodecError> {
        let formats = list
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(ImageFormat::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(formats))
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn contains(&self, format: ImageFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn formats(&self) -> &[ImageFormat] {
        &self.formats
    }

    /// Check a declared content type against the list without touching the
    /// payload.
    pub fn admit_declared(&self, content_type: &str) -> Result<ImageFormat, CodecError> {
        let format = ImageFormat::from_mime(content_type).ok_or_else(|| {
            CodecError::UnsupportedFormat(format!(
                "declared content type {content_type:?} is not an image type"
            ))
        })?;
        if !self.contains(format) {
            return Err(CodecError::UnsupportedFormat(format!(
                "{format} uploads are not accepted (allowed: {self})"
            )));
        }
        Ok(format)
    }
}

impl Default for FormatAllowList {
    fn default() -> Self {
        Self::new(ImageFormat::ALL)
    }
}

impl fmt::Display for FormatAllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.formats.iter().map(ToString::to_string).collect();
        f.write_str(&names.join(","))
    }
}

/// Decode/encode seam used by the dispatcher.
pub trait ImageCodec: Send + Sync {
    fn decode(&self, bytes: &[u8], declared_content_type: &str)
    -> Result<PixelBuffer, CodecError>;

    fn encode(&self, buffer: &PixelBuffer, format: ImageFormat) -> Result<Vec<u8>, CodecError>;
}

/// Production codec backed by the `image` crate.
#[derive(Clone, Debug)]
pub struct NativeCodec {
    allowed: FormatAllowList,
    jpeg_quality: u8,
}

impl NativeCodec {
    pub fn new(allowed: FormatAllowList, jpeg_quality: u8) -> Self {
        Self {
            allowed,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn allowed(&self) -> &FormatAllowList {
        &self.allowed
    }
}

impl Default for NativeCodec {
    fn default() -> Self {
        Self::new(FormatAllowList::default(), DEFAULT_JPEG_QUALITY)
    }
}

impl ImageCodec for NativeCodec {
    fn decode(
        &self,
        bytes: &[u8],
        declared_content_type: &str,
    ) -> Result<PixelBuffer, CodecError> {
        let declared = self.allowed.admit_declared(declared_content_type)?;
        if bytes.is_empty() {
            return Err(CodecError::CorruptInput("empty payload".into()));
        }
        let detected = ImageFormat::sniff(bytes).ok_or_else(|| {
            CodecError::UnsupportedFormat(
                "payload does not start with a known image signature".into(),
            )
        })?;
        if !self.allowed.contains(detected) {
            return Err(CodecError::UnsupportedFormat(format!(
                "payload is {detected}, which is not accepted (allowed: {})",
                self.allowed
            )));
        }
        if detected != declared {
            return Err(CodecError::UnsupportedFormat(format!(
                "declared {declared} but payload is {detected}"
            )));
        }

        let image = image::load_from_memory_with_format(bytes, detected.native())
            .map_err(|err| CodecError::CorruptInput(err.to_string()))?;
        from_dynamic(image)
    }

    fn encode(&self, buffer: &PixelBuffer, format: ImageFormat) -> Result<Vec<u8>, CodecError> {
        if buffer.is_empty() {
            return Err(CodecError::EncodeFailure(format!(
                "cannot encode a {}x{} image",
                buffer.width(),
                buffer.height()
            )));
        }

        let mut out = Vec::new();
        if format == ImageFormat::Jpeg {
            let (data, color) = match buffer.channels() {
                Channels::Gray => (buffer.data().to_vec(), ExtendedColorType::L8),
                Channels::Rgb => (buffer.data().to_vec(), ExtendedColorType::Rgb8),
                Channels::Rgba => (drop_alpha(buffer.data()), ExtendedColorType::Rgb8),
            };
            JpegEncoder::new_with_quality(&mut out, self.jpeg_quality)
                .write_image(&data, buffer.width(), buffer.height(), color)
                .map_err(|err| CodecError::EncodeFailure(err.to_string()))?;
            return Ok(out);
        }

        let image = to_dynamic(buffer)?;
        image
            .write_to(&mut Cursor::new(&mut out), format.native())
            .map_err(|err| CodecError::EncodeFailure(err.to_string()))?;
        Ok(out)
    }
}

fn from_dynamic(image: DynamicImage) -> Result<PixelBuffer, CodecError> {
    let color = image.color();
    let (width, height) = (image.width(), image.height());
    let (channels, data) = if !color.has_color() && !color.has_alpha() {
        (Channels::Gray, image.into_luma8().into_raw())
    } else if color.has_alpha() {
        (Channels::Rgba, image.into_rgba8().into_raw())
    } else {
        (Channels::Rgb, image.into_rgb8().into_raw())
    };
    PixelBuffer::new(width, height, channels, data)
        .map_err(|err| CodecError::CorruptInput(err.to_string()))
}

fn to_dynamic(buffer: &PixelBuffer) -> Result<DynamicImage, CodecError> {
    let (width, height) = (buffer.width(), buffer.height());
    let data = buffer.data().to_vec();
    let image = match buffer.channels() {
        Channels::Gray => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
        Channels::Rgb => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
        Channels::Rgba => RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
    };
    image.ok_or_else(|| CodecError::EncodeFailure("pixel buffer does not match its shape".into()))
}

fn drop_alpha(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect()
}

/// Convert a pixel buffer into an `image` crate value for stages that lean on
/// `image::imageops`.
pub(crate) fn buffer_to_dynamic(buffer: &PixelBuffer) -> Result<DynamicImage, CodecError> {
    to_dynamic(buffer)
}

pub(crate) fn dynamic_to_buffer(image: DynamicImage) -> Result<PixelBuffer, CodecError> {
    from_dynamic(image)
}
