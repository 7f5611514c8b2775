use std::collections::BTreeMap;

use serde::Serialize;
use vision::{Detection, StageParams, StageReport, Termination};

use crate::pool::PoolStatus;

/// Wall-clock split of one request, in milliseconds.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct PhaseTimings {
    pub queue_ms: f64,
    pub decode_ms: f64,
    pub process_ms: f64,
    pub encode_ms: f64,
    pub total_ms: f64,
}

/// Body of a successful `POST /process` in JSON mode.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessResponse {
    pub request_id: String,
    pub received_at: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub channels: Option<usize>,
    /// Format of `image`; `None` when the pipeline produced no image.
    pub format: Option<&'static str>,
    /// Base64 encoded output image.
    pub image: Option<String>,
    pub measurements: BTreeMap<String, f64>,
    pub detections: Vec<Detection>,
    pub stages: Vec<StageReport>,
    pub terminated_by: Option<Termination>,
    pub timings: PhaseTimings,
}

#[derive(Serialize)]
pub(crate) struct HealthResponse<'a> {
    pub(crate) status: &'static str,
    pub(crate) pool: &'a PoolStatus,
}

#[derive(Clone, Debug, Serialize)]
pub struct StageInfo {
    pub name: String,
    pub kind: &'static str,
    pub defaults: StageParams,
}

#[derive(Serialize)]
pub(crate) struct StagesResponse<'a> {
    pub(crate) stages: &'a [StageInfo],
}
