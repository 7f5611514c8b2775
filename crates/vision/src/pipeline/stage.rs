use std::{collections::BTreeMap, fmt};

use serde::Serialize;
use thiserror::Error;

use crate::{buffer::PixelBuffer, pipeline::params::StageParams};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("invalid parameter {key:?}: {reason}")]
    InvalidParameter { key: String, reason: String },
    #[error("{0}")]
    Fault(String),
}

impl StageError {
    pub fn fault(message: impl Into<String>) -> Self {
        StageError::Fault(message.into())
    }
}

/// One region reported by a detection stage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    /// `[x, y, width, height]` in pixels of the buffer the stage received.
    pub bbox: [u32; 4],
    pub area: u64,
    pub score: f32,
}

/// Measurements and detections emitted alongside a stage's buffer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Findings {
    pub measurements: BTreeMap<String, f64>,
    pub detections: Vec<Detection>,
}

impl Findings {
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty() && self.detections.is_empty()
    }

    pub fn measure(mut self, key: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(key.into(), value);
        self
    }

    pub fn detect(mut self, detection: Detection) -> Self {
        self.detections.push(detection);
        self
    }

    /// Fold `other` in, prefixing its measurement keys with `stage`.
    pub(crate) fn absorb(&mut self, stage: &str, other: Findings) {
        for (key, value) in other.measurements {
            self.measurements.insert(format!("{stage}.{key}"), value);
        }
        self.detections.extend(other.detections);
    }
}

/// What a stage hands back to the pipeline.
#[derive(Debug)]
pub enum StageOutput {
    /// Feed `buffer` to the next stage.
    Continue { buffer: PixelBuffer, findings: Findings },
    /// Stop here; the remaining stages are moot.
    Finish {
        reason: String,
        buffer: Option<PixelBuffer>,
        findings: Findings,
    },
}

impl StageOutput {
    pub fn next(buffer: PixelBuffer) -> Self {
        StageOutput::Continue {
            buffer,
            findings: Findings::default(),
        }
    }

    pub fn next_with(buffer: PixelBuffer, findings: Findings) -> Self {
        StageOutput::Continue { buffer, findings }
    }

    pub fn finish(
        reason: impl Into<String>,
        buffer: Option<PixelBuffer>,
        findings: Findings,
    ) -> Self {
        StageOutput::Finish {
            reason: reason.into(),
            buffer,
            findings,
        }
    }
}

/// A pure transformation from one pixel buffer to the next.
///
/// Implementations must not mutate shared state; the same instance runs for
/// every request on every worker thread.
pub trait Stage: Send + Sync + fmt::Debug {
    /// Catalog name of the stage kind, e.g. `blur`.
    fn kind(&self) -> &'static str;

    /// Reject bad parameters before any request work is queued.
    fn validate(&self, params: &StageParams) -> Result<(), StageError> {
        let _ = params;
        Ok(())
    }

    fn run(&self, input: &PixelBuffer, params: &StageParams) -> Result<StageOutput, StageError>;
}
