//! Built-in stages available to the stage catalog.

use std::{thread, time::Duration};

use image::imageops::FilterType;

use crate::{
    buffer::{Channels, PixelBuffer, clamp_sample, luma_of},
    codec::{buffer_to_dynamic, dynamic_to_buffer},
    pipeline::{
        params::StageParams,
        stage::{Detection, Findings, Stage, StageError, StageOutput},
    },
};

/// Reason reported when `detect` finds nothing worth passing on.
pub const NO_OBJECT_DETECTED: &str = "no_object_detected";

fn buffer_fault(err: impl ToString) -> StageError {
    StageError::fault(err.to_string())
}

#[derive(Debug, Default)]
pub struct Grayscale;

impl Stage for Grayscale {
    fn kind(&self) -> &'static str {
        "grayscale"
    }

    fn run(&self, input: &PixelBuffer, _params: &StageParams) -> Result<StageOutput, StageError> {
        let buffer = PixelBuffer::new(input.width(), input.height(), Channels::Gray, input.luma())
            .map_err(buffer_fault)?;
        Ok(StageOutput::next(buffer))
    }
}

#[derive(Debug, Default)]
pub struct Invert;

impl Stage for Invert {
    fn kind(&self) -> &'static str {
        "invert"
    }

    fn run(&self, input: &PixelBuffer, _params: &StageParams) -> Result<StageOutput, StageError> {
        Ok(StageOutput::next(input.map_color(|v| 255 - v)))
    }
}

/// Adds `delta` to every colour sample.
#[derive(Debug, Default)]
pub struct Brightness;

impl Brightness {
    fn delta(params: &StageParams) -> Result<i32, StageError> {
        let delta = params.get_or::<i32>("delta", 0)?;
        if !(-255..=255).contains(&delta) {
            return Err(StageError::InvalidParameter {
                key: "delta".into(),
                reason: format!("{delta} is outside -255..=255"),
            });
        }
        Ok(delta)
    }
}

impl Stage for Brightness {
    fn kind(&self) -> &'static str {
        "brightness"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        Self::delta(params).map(|_| ())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        let delta = Self::delta(params)? as f32;
        Ok(StageOutput::next(
            input.map_color(|v| clamp_sample(v as f32 + delta)),
        ))
    }
}

/// Scales every colour sample's distance from mid-grey by `factor`.
#[derive(Debug, Default)]
pub struct Contrast;

impl Contrast {
    fn factor(params: &StageParams) -> Result<f32, StageError> {
        let factor = params.get_or::<f32>("factor", 1.0)?;
        if !factor.is_finite() || factor < 0.0 {
            return Err(StageError::InvalidParameter {
                key: "factor".into(),
                reason: format!("{factor} must be a finite, non-negative number"),
            });
        }
        Ok(factor)
    }
}

impl Stage for Contrast {
    fn kind(&self) -> &'static str {
        "contrast"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        Self::factor(params).map(|_| ())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        let factor = Self::factor(params)?;
        Ok(StageOutput::next(input.map_color(|v| {
            clamp_sample((v as f32 - 128.0) * factor + 128.0)
        })))
    }
}

/// Binarises luma at `level`: samples at or above become white.
#[derive(Debug, Default)]
pub struct Threshold;

impl Stage for Threshold {
    fn kind(&self) -> &'static str {
        "threshold"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        params.get::<u8>("level").map(|_| ())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        let level = params.get_or::<u8>("level", 128)?;
        let data = input
            .luma()
            .into_iter()
            .map(|v| if v >= level { 255 } else { 0 })
            .collect();
        let buffer = PixelBuffer::new(input.width(), input.height(), Channels::Gray, data)
            .map_err(buffer_fault)?;
        Ok(StageOutput::next(buffer))
    }
}

/// Gaussian blur with standard deviation `sigma`.
#[derive(Debug, Default)]
pub struct Blur;

impl Blur {
    fn sigma(params: &StageParams) -> Result<f32, StageError> {
        let sigma = params.get_or::<f32>("sigma", 1.0)?;
        if !sigma.is_finite() || sigma <= 0.0 || sigma > 100.0 {
            return Err(StageError::InvalidParameter {
                key: "sigma".into(),
                reason: format!("{sigma} must be in (0, 100]"),
            });
        }
        Ok(sigma)
    }
}

impl Stage for Blur {
    fn kind(&self) -> &'static str {
        "blur"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        Self::sigma(params).map(|_| ())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        let sigma = Self::sigma(params)?;
        if input.is_empty() {
            return Ok(StageOutput::next(input.clone()));
        }
        let image = buffer_to_dynamic(input).map_err(buffer_fault)?;
        let blurred = dynamic_to_buffer(image.blur(sigma)).map_err(buffer_fault)?;
        Ok(StageOutput::next(blurred))
    }
}

/// Longest side `resize` will produce.
pub const MAX_RESIZE_SIDE: u32 = 8192;
/// Largest pixel count `resize` will produce.
pub const MAX_RESIZE_PIXELS: u64 = 32 * 1024 * 1024;
/// Longest sleep `delay` accepts.
pub const MAX_DELAY_MS: u64 = 60_000;

/// Resize to exact `width`×`height`, or fit within `max_side` keeping the
/// aspect ratio. Output is capped at [`MAX_RESIZE_SIDE`] per side and
/// [`MAX_RESIZE_PIXELS`] in total.
#[derive(Debug, Default)]
pub struct Resize;

enum ResizeTarget {
    Exact(u32, u32),
    MaxSide(u32),
}

impl Resize {
    fn target(params: &StageParams) -> Result<ResizeTarget, StageError> {
        let side = |key: &str, value: u32| {
            if value == 0 || value > MAX_RESIZE_SIDE {
                Err(StageError::InvalidParameter {
                    key: key.into(),
                    reason: format!("{value} must be in 1..={MAX_RESIZE_SIDE}"),
                })
            } else {
                Ok(value)
            }
        };
        match (
            params.get::<u32>("width")?,
            params.get::<u32>("height")?,
            params.get::<u32>("max_side")?,
        ) {
            (Some(w), Some(h), None) => {
                let (w, h) = (side("width", w)?, side("height", h)?);
                check_pixels("width", w, h)?;
                Ok(ResizeTarget::Exact(w, h))
            }
            (None, None, Some(max)) => Ok(ResizeTarget::MaxSide(side("max_side", max)?)),
            _ => Err(StageError::InvalidParameter {
                key: "width".into(),
                reason: "set either width and height, or max_side".into(),
            }),
        }
    }
}

fn check_pixels(key: &str, width: u32, height: u32) -> Result<(), StageError> {
    let pixels = u64::from(width) * u64::from(height);
    if pixels > MAX_RESIZE_PIXELS {
        return Err(StageError::InvalidParameter {
            key: key.into(),
            reason: format!("output of {width}x{height} exceeds {MAX_RESIZE_PIXELS} pixels"),
        });
    }
    Ok(())
}

/// Largest size with the input's aspect ratio that fits in `max`×`max`.
fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    let scale = f64::from(max) / f64::from(width.max(height));
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, max);
    (scaled(width), scaled(height))
}

impl Stage for Resize {
    fn kind(&self) -> &'static str {
        "resize"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        Self::target(params).map(|_| ())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        let target = Self::target(params)?;
        if input.is_empty() {
            return Ok(StageOutput::next(input.clone()));
        }
        let (width, height) = match target {
            ResizeTarget::Exact(w, h) => (w, h),
            ResizeTarget::MaxSide(max) => {
                let (w, h) = fit_within(input.width(), input.height(), max);
                check_pixels("max_side", w, h)?;
                (w, h)
            }
        };
        let image = buffer_to_dynamic(input).map_err(buffer_fault)?;
        let resized = image.resize_exact(width, height, FilterType::Triangle);
        let buffer = dynamic_to_buffer(resized).map_err(buffer_fault)?;
        Ok(StageOutput::next(buffer))
    }
}

/// Cut out a rectangle, clipped to the image bounds.
#[derive(Debug, Default)]
pub struct Crop;

impl Stage for Crop {
    fn kind(&self) -> &'static str {
        "crop"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        params.get::<u32>("x")?;
        params.get::<u32>("y")?;
        params.require::<u32>("width")?;
        params.require::<u32>("height")?;
        Ok(())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        let x = params.get_or::<u32>("x", 0)?.min(input.width());
        let y = params.get_or::<u32>("y", 0)?.min(input.height());
        let width = params.require::<u32>("width")?.min(input.width() - x);
        let height = params.require::<u32>("height")?.min(input.height() - y);

        let stride = input.channels().count();
        let mut data = Vec::with_capacity(width as usize * height as usize * stride);
        for row in y..y + height {
            let start = (row as usize * input.width() as usize + x as usize) * stride;
            data.extend_from_slice(&input.data()[start..start + width as usize * stride]);
        }
        let buffer =
            PixelBuffer::new(width, height, input.channels(), data).map_err(buffer_fault)?;
        Ok(StageOutput::next(buffer))
    }
}

/// Intensity statistics; passes the buffer through untouched.
#[derive(Debug, Default)]
pub struct Measure;

impl Stage for Measure {
    fn kind(&self) -> &'static str {
        "measure"
    }

    fn run(&self, input: &PixelBuffer, _params: &StageParams) -> Result<StageOutput, StageError> {
        let mut findings = Findings::default()
            .measure("width", input.width() as f64)
            .measure("height", input.height() as f64);

        let count = input.pixel_count();
        if count > 0 {
            let luma = input.luma();
            let mean = luma.iter().map(|&v| v as f64).sum::<f64>() / count as f64;
            let variance = luma
                .iter()
                .map(|&v| (v as f64 - mean).powi(2))
                .sum::<f64>()
                / count as f64;
            let min = luma.iter().copied().min().unwrap_or(0);
            let max = luma.iter().copied().max().unwrap_or(0);
            findings = findings
                .measure("mean_luma", mean)
                .measure("stddev_luma", variance.sqrt())
                .measure("min_luma", min as f64)
                .measure("max_luma", max as f64);

            let names: &[&str] = match input.channels() {
                Channels::Gray => &["gray"],
                Channels::Rgb => &["red", "green", "blue"],
                Channels::Rgba => &["red", "green", "blue", "alpha"],
            };
            let mut sums = vec![0f64; names.len()];
            for px in input.pixels() {
                for (sum, &v) in sums.iter_mut().zip(px) {
                    *sum += v as f64;
                }
            }
            for (name, sum) in names.iter().zip(sums) {
                findings = findings.measure(format!("mean_{name}"), sum / count as f64);
            }
        }

        Ok(StageOutput::next_with(input.clone(), findings))
    }
}

/// Bounding box of foreground pixels.
///
/// With `polarity=bright` (default) pixels whose luma is at or above
/// `threshold` are foreground; `polarity=dark` flips the test. When fewer than
/// `min_area` pixels qualify the pipeline finishes with
/// [`NO_OBJECT_DETECTED`].
#[derive(Debug, Default)]
pub struct Detect;

impl Detect {
    fn dark(params: &StageParams) -> Result<bool, StageError> {
        match params.raw("polarity").unwrap_or("bright") {
            "bright" => Ok(false),
            "dark" => Ok(true),
            other => Err(StageError::InvalidParameter {
                key: "polarity".into(),
                reason: format!("{other:?} is neither \"bright\" nor \"dark\""),
            }),
        }
    }
}

impl Stage for Detect {
    fn kind(&self) -> &'static str {
        "detect"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        params.get::<u8>("threshold")?;
        params.get::<u64>("min_area")?;
        Self::dark(params).map(|_| ())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        let threshold = params.get_or::<u8>("threshold", 128)?;
        let min_area = params.get_or::<u64>("min_area", 1)?.max(1);
        let dark = Self::dark(params)?;

        let mut area: u64 = 0;
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        for y in 0..input.height() {
            for x in 0..input.width() {
                let luma = luma_of(input.pixel(x, y), input.channels());
                let hit = if dark {
                    luma < threshold
                } else {
                    luma >= threshold
                };
                if hit {
                    area += 1;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        let findings = Findings::default().measure("foreground_area", area as f64);
        if area < min_area {
            return Ok(StageOutput::finish(NO_OBJECT_DETECTED, None, findings));
        }

        let total = input.pixel_count().max(1) as f32;
        let detection = Detection {
            label: "foreground".into(),
            bbox: [min_x, min_y, max_x - min_x + 1, max_y - min_y + 1],
            area,
            score: area as f32 / total,
        };
        Ok(StageOutput::next_with(
            input.clone(),
            findings.detect(detection),
        ))
    }
}

/// Sleeps for `ms` milliseconds (at most [`MAX_DELAY_MS`]); used to rehearse
/// saturation and timeouts.
#[derive(Debug, Default)]
pub struct Delay;

impl Delay {
    fn ms(params: &StageParams) -> Result<u64, StageError> {
        let ms = params.get_or::<u64>("ms", 100)?;
        if ms > MAX_DELAY_MS {
            return Err(StageError::InvalidParameter {
                key: "ms".into(),
                reason: format!("{ms} exceeds {MAX_DELAY_MS}"),
            });
        }
        Ok(ms)
    }
}

impl Stage for Delay {
    fn kind(&self) -> &'static str {
        "delay"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        Self::ms(params).map(|_| ())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        let ms = Self::ms(params)?;
        thread::sleep(Duration::from_millis(ms));
        Ok(StageOutput::next(input.clone()))
    }
}

/// Fails with `message` while `enabled` (default true); used for
/// fault-injection drills.
#[derive(Debug, Default)]
pub struct Fail;

impl Stage for Fail {
    fn kind(&self) -> &'static str {
        "fail"
    }

    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        params.get::<bool>("enabled").map(|_| ())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError> {
        if !params.get_or("enabled", true)? {
            return Ok(StageOutput::next(input.clone()));
        }
        let message = params.raw("message").unwrap_or("injected fault");
        Err(StageError::fault(message))
    }
}
