//! Request dispatcher: admission checks, worker offload, deadlines.
//!
//! Flow per request:
//! 1. Reject oversized bodies and undeclared or disallowed content types
//!    before the codec sees a byte.
//! 2. Resolve per-request stage overrides against the configured pipeline.
//! 3. Submit decode, pipeline and encode as one job to the [`WorkerPool`];
//!    the pool answers `Overloaded` when it is full.
//! 4. Await the job under the request deadline. On expiry the job handle is
//!    dropped, which cancels queued work; running native work finishes on its
//!    worker and is discarded.
//!
//! Every lower-layer failure comes back as a [`DispatchError`]; nothing from
//! the codec, the stages or the pool reaches the HTTP layer unclassified.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use actix_web::web::Bytes;
use anyhow::Context;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, info_span, warn};
use vision::{
    Findings, FormatAllowList, ImageCodec, ImageFormat, NativeCodec, ParamOverrides, Pipeline,
    ResolvedParams, StageReport, Termination,
};

use crate::{
    config::ApiConfig,
    context::{PhaseCell, RequestContext, RequestPhase},
    data::{PhaseTimings, ProcessResponse, StageInfo},
    error::{DispatchError, ErrorKind},
    pool::{JobOutput, WorkerPool},
};

/// Raw upload as received from the client.
#[derive(Clone, Debug)]
pub struct UploadedImage {
    pub bytes: Bytes,
    /// Declared `Content-Type`, parameters included.
    pub content_type: String,
    pub file_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// JSON document with the image embedded as base64.
    #[default]
    Json,
    /// Encoded image bytes as the response body.
    Image,
}

/// Per-request options taken from the query string.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub overrides: ParamOverrides,
    pub output: OutputMode,
    /// Output image format; the configured default when `None`.
    pub format: Option<ImageFormat>,
}

impl RequestOptions {
    /// Parse `output=`, `format=` and `<stage>.<key>=` pairs. Other
    /// undotted keys are ignored.
    pub fn from_query(pairs: &[(String, String)]) -> Result<Self, DispatchError> {
        let mut options = RequestOptions {
            overrides: ParamOverrides::from_query_pairs(
                pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            ),
            ..RequestOptions::default()
        };
        for (key, value) in pairs {
            match key.as_str() {
                "output" => {
                    options.output = match value.to_ascii_lowercase().as_str() {
                        "json" => OutputMode::Json,
                        "image" => OutputMode::Image,
                        other => {
                            return Err(DispatchError::new(
                                ErrorKind::InvalidParameters,
                                format!("output must be json or image, got {other:?}"),
                            ));
                        }
                    }
                }
                "format" => {
                    let format = value.parse::<ImageFormat>().map_err(|err| {
                        DispatchError::new(ErrorKind::InvalidParameters, format!("format: {err}"))
                    })?;
                    options.format = Some(format);
                }
                _ => {}
            }
        }
        Ok(options)
    }
}

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub max_upload_bytes: usize,
    pub request_timeout: Duration,
    pub allowed_formats: FormatAllowList,
    pub output_format: ImageFormat,
}

impl From<&ApiConfig> for DispatchSettings {
    fn from(config: &ApiConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            request_timeout: config.request_timeout,
            allowed_formats: config.allowed_formats.clone(),
            output_format: config.output_format,
        }
    }
}

/// Output image after encoding.
#[derive(Clone, Debug)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub channels: usize,
}

/// Successful result of one request.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub request_id: String,
    pub received_at: DateTime<Utc>,
    pub image: Option<EncodedImage>,
    pub findings: Findings,
    pub stages: Vec<StageReport>,
    pub terminated_by: Option<Termination>,
    pub timings: PhaseTimings,
}

impl DispatchOutcome {
    pub fn into_response_body(self) -> ProcessResponse {
        let (width, height, channels, format, image) = match self.image {
            Some(image) => (
                Some(image.width),
                Some(image.height),
                Some(image.channels),
                Some(image.format.name()),
                Some(STANDARD.encode(&image.bytes)),
            ),
            None => (None, None, None, None, None),
        };
        ProcessResponse {
            request_id: self.request_id,
            received_at: self.received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            width,
            height,
            channels,
            format,
            image,
            measurements: self.findings.measurements,
            detections: self.findings.detections,
            stages: self.stages,
            terminated_by: self.terminated_by,
            timings: self.timings,
        }
    }
}

/// What the worker hands back.
struct WorkOutput {
    image: Option<EncodedImage>,
    findings: Findings,
    stages: Vec<StageReport>,
    terminated_by: Option<Termination>,
    decode_ms: f64,
    process_ms: f64,
    encode_ms: f64,
}

pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    codec: Arc<dyn ImageCodec>,
    pool: Arc<WorkerPool>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        pipeline: Pipeline,
        codec: Arc<dyn ImageCodec>,
        pool: Arc<WorkerPool>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            codec,
            pool,
            settings,
        }
    }

    /// Production wiring: configured pipeline, native codec, fresh pool.
    pub fn from_config(config: &ApiConfig) -> anyhow::Result<Self> {
        let pipeline = config.build_pipeline()?;
        let codec = NativeCodec::new(config.allowed_formats.clone(), config.jpeg_quality);
        let pool = WorkerPool::new(config.pool.clone()).context("failed to start worker pool")?;
        Ok(Self::new(
            pipeline,
            Arc::new(codec),
            Arc::new(pool),
            DispatchSettings::from(config),
        ))
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn stage_info(&self) -> Vec<StageInfo> {
        self.pipeline
            .stages()
            .iter()
            .map(|stage| StageInfo {
                name: stage.name().to_string(),
                kind: stage.kind(),
                defaults: stage.defaults().clone(),
            })
            .collect()
    }

    /// Cheap pre-read check on the declared body length.
    pub fn check_declared_length(&self, declared: Option<usize>) -> Result<(), DispatchError> {
        match declared {
            Some(length) if length > self.settings.max_upload_bytes => {
                Err(self.too_large(Some(length)))
            }
            _ => Ok(()),
        }
    }

    pub fn too_large(&self, length: Option<usize>) -> DispatchError {
        let message = match length {
            Some(length) => format!(
                "upload of {length} bytes exceeds the {} byte limit",
                self.settings.max_upload_bytes
            ),
            None => format!(
                "upload exceeds the {} byte limit",
                self.settings.max_upload_bytes
            ),
        };
        DispatchError::new(ErrorKind::PayloadTooLarge, message)
    }

    /// Process one upload end to end.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        upload: UploadedImage,
        options: RequestOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        match self.process(ctx, upload, options).await {
            Ok(outcome) => {
                metrics::counter!("vision_api_requests_total", "outcome" => "ok").increment(1);
                metrics::histogram!("vision_api_request_seconds")
                    .record(ctx.started.elapsed().as_secs_f64());
                debug!(total_ms = outcome.timings.total_ms, "request completed");
                Ok(outcome)
            }
            Err(err) => Err(self.reject(ctx, err)),
        }
    }

    /// Close out a failed request: mark it failed, attach its id, count and
    /// log it.
    pub fn reject(&self, ctx: &RequestContext, err: DispatchError) -> DispatchError {
        ctx.phase.fail();
        let err = err.for_request(ctx.request_id.clone());
        metrics::counter!("vision_api_requests_total", "outcome" => err.kind.code()).increment(1);
        metrics::histogram!("vision_api_request_seconds")
            .record(ctx.started.elapsed().as_secs_f64());
        if err.kind.is_client_error() {
            info!(code = err.kind.code(), phase = %err.phase, "request rejected: {}", err.message);
        } else {
            warn!(code = err.kind.code(), phase = %err.phase, "request failed: {}", err.message);
        }
        err
    }

    async fn process(
        &self,
        ctx: &RequestContext,
        upload: UploadedImage,
        options: RequestOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        let phase = ctx.phase.clone();

        if upload.bytes.len() > self.settings.max_upload_bytes {
            return Err(fail(&phase, self.too_large(Some(upload.bytes.len()))));
        }
        self.settings
            .allowed_formats
            .admit_declared(&upload.content_type)
            .map_err(|err| fail(&phase, DispatchError::from_codec(err)))?;
        let resolved = self
            .pipeline
            .resolve(&options.overrides)
            .map_err(|err| fail(&phase, DispatchError::from_pipeline(err)))?;
        let format = options.format.unwrap_or(self.settings.output_format);

        debug!(
            bytes = upload.bytes.len(),
            content_type = %upload.content_type,
            file_name = upload.file_name.as_deref().unwrap_or(""),
            %format,
            "upload admitted"
        );

        let job = {
            let pipeline = self.pipeline.clone();
            let codec = self.codec.clone();
            let phase = phase.clone();
            move || run_job(&pipeline, codec.as_ref(), &phase, upload, &resolved, format)
        };
        let handle = self
            .pool
            .submit(job)
            .map_err(|err| fail(&phase, DispatchError::from_pool(err)))?;

        let remaining = self
            .settings
            .request_timeout
            .saturating_sub(ctx.started.elapsed());
        let output = match tokio::time::timeout(remaining, handle.wait()).await {
            Err(_) => {
                let interrupted = phase.fail();
                return Err(DispatchError::new(
                    ErrorKind::Timeout,
                    format!(
                        "request exceeded the {} ms deadline",
                        self.settings.request_timeout.as_millis()
                    ),
                )
                .in_phase(interrupted));
            }
            Ok(Err(err)) => return Err(fail(&phase, DispatchError::from_pool(err))),
            Ok(Ok(JobOutput { value, queue_wait })) => (value?, queue_wait),
        };
        let (work, queue_wait) = output;

        let queue_ms = queue_wait.as_secs_f64() * 1_000.0;
        metrics::histogram!("vision_api_phase_seconds", "phase" => "queue")
            .record(queue_wait.as_secs_f64());
        metrics::histogram!("vision_api_phase_seconds", "phase" => "decode")
            .record(work.decode_ms / 1_000.0);
        metrics::histogram!("vision_api_phase_seconds", "phase" => "process")
            .record(work.process_ms / 1_000.0);
        metrics::histogram!("vision_api_phase_seconds", "phase" => "encode")
            .record(work.encode_ms / 1_000.0);
        for report in &work.stages {
            metrics::histogram!("vision_api_stage_seconds", "stage" => report.name.clone())
                .record(report.elapsed_ms / 1_000.0);
        }

        Ok(DispatchOutcome {
            request_id: ctx.request_id.clone(),
            received_at: ctx.received_at,
            image: work.image,
            findings: work.findings,
            stages: work.stages,
            terminated_by: work.terminated_by,
            timings: PhaseTimings {
                queue_ms,
                decode_ms: work.decode_ms,
                process_ms: work.process_ms,
                encode_ms: work.encode_ms,
                total_ms: ctx.elapsed_ms(),
            },
        })
    }
}

/// Mark the request failed and tag the error with the interrupted phase.
fn fail(phase: &PhaseCell, err: DispatchError) -> DispatchError {
    let interrupted = phase.fail();
    err.in_phase(interrupted)
}

fn abandoned(phase: &PhaseCell) -> DispatchError {
    DispatchError::new(ErrorKind::InternalError, "request was abandoned").in_phase(phase.get())
}

/// Decode, run the pipeline and encode; runs on a pool worker.
fn run_job(
    pipeline: &Pipeline,
    codec: &dyn ImageCodec,
    phase: &PhaseCell,
    upload: UploadedImage,
    resolved: &ResolvedParams,
    format: ImageFormat,
) -> Result<WorkOutput, DispatchError> {
    if !phase.advance(RequestPhase::Decoding) {
        return Err(abandoned(phase));
    }
    let started = Instant::now();
    let buffer = info_span!("decode", bytes = upload.bytes.len())
        .in_scope(|| codec.decode(&upload.bytes, &upload.content_type))
        .map_err(|err| fail(phase, DispatchError::from_codec(err)))?;
    drop(upload);
    let decode_ms = started.elapsed().as_secs_f64() * 1_000.0;

    if !phase.advance(RequestPhase::Processing) {
        return Err(abandoned(phase));
    }
    let started = Instant::now();
    let result = info_span!("pipeline", stages = pipeline.stages().len())
        .in_scope(|| pipeline.run_resolved(buffer, resolved))
        .map_err(|err| fail(phase, DispatchError::from_pipeline(err)))?;
    let process_ms = started.elapsed().as_secs_f64() * 1_000.0;

    let mut encode_ms = 0.0;
    let image = match result.image {
        Some(buffer) => {
            if !phase.advance(RequestPhase::Encoding) {
                return Err(abandoned(phase));
            }
            let started = Instant::now();
            let bytes = info_span!("encode", format = %format)
                .in_scope(|| codec.encode(&buffer, format))
                .map_err(|err| fail(phase, DispatchError::from_codec(err)))?;
            encode_ms = started.elapsed().as_secs_f64() * 1_000.0;
            Some(EncodedImage {
                bytes,
                format,
                width: buffer.width(),
                height: buffer.height(),
                channels: buffer.channels().count(),
            })
        }
        None => None,
    };

    if !phase.advance(RequestPhase::Responded) {
        return Err(abandoned(phase));
    }
    Ok(WorkOutput {
        image,
        findings: result.findings,
        stages: result.stages,
        terminated_by: result.terminated_by,
        decode_ms,
        process_ms,
        encode_ms,
    })
}
