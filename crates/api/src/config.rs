//! Configuration parsing for the API service.
//!
//! Translates CLI flags and environment variables into an `ApiConfig` that the
//! server, dispatcher, and worker pool consume without re-parsing anything.

use std::{str::FromStr, thread, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use vision::{FormatAllowList, ImageFormat, Pipeline, StageCatalog};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_JPEG_QUALITY: i32 = 85;

#[derive(Clone, Debug)]
/// Sizing of the blocking worker pool.
pub struct PoolConfig {
    /// Worker threads executing decode/pipeline/encode jobs.
    pub workers: usize,
    /// Jobs allowed to wait for a free worker.
    pub queue_capacity: usize,
    /// Longest a queued job may wait before it is answered `Overloaded`.
    pub queue_timeout: Duration,
    /// Busy time after which the watchdog reports a worker as stalled.
    pub stall_threshold: Duration,
}

impl PoolConfig {
    pub fn capacity(&self) -> usize {
        self.workers.saturating_add(self.queue_capacity)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = default_workers();
        Self {
            workers,
            queue_capacity: workers.saturating_mul(2),
            queue_timeout: Duration::from_millis(DEFAULT_QUEUE_TIMEOUT_MS),
            stall_threshold: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS * 4),
        }
    }
}

#[derive(Clone, Debug)]
/// Canonical configuration for one API process.
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body in bytes.
    pub max_upload_bytes: usize,
    /// Deadline covering queueing plus all processing phases.
    pub request_timeout: Duration,
    /// Upload formats accepted by the codec.
    pub allowed_formats: FormatAllowList,
    /// Stage list in catalog syntax; empty means identity.
    pub pipeline: String,
    /// Format used for output images unless the request asks otherwise.
    pub output_format: ImageFormat,
    pub jpeg_quality: u8,
    pub pool: PoolConfig,
    /// Actix worker threads; `None` lets Actix pick.
    pub http_workers: Option<usize>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            allowed_formats: FormatAllowList::default(),
            pipeline: String::new(),
            output_format: ImageFormat::Png,
            jpeg_quality: DEFAULT_JPEG_QUALITY as u8,
            pool: PoolConfig::default(),
            http_workers: None,
        }
    }
}

impl ApiConfig {
    /// Build the configured pipeline against the built-in stage catalog.
    pub fn build_pipeline(&self) -> Result<Pipeline> {
        Pipeline::from_stage_list(&StageCatalog::builtin(), &self.pipeline)
            .with_context(|| format!("invalid pipeline {:?}", self.pipeline))
    }
}

/// CLI arguments accepted by the `api` subcommand.
#[derive(Debug, Args)]
pub struct ApiArgs {
    /// Interface to bind.
    #[arg(long, env = "VISION_API_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port to bind.
    #[arg(long, env = "VISION_API_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Largest accepted upload in bytes.
    #[arg(long = "max-upload-bytes", env = "VISION_MAX_UPLOAD_BYTES", value_name = "BYTES",
          default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,
    /// Per-request deadline in milliseconds.
    #[arg(long = "request-timeout-ms", env = "VISION_REQUEST_TIMEOUT_MS", value_name = "MS",
          default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,
    /// Worker threads for blocking image work (defaults to available cores).
    #[arg(long = "workers", env = "VISION_WORKER_POOL_SIZE", value_name = "N")]
    pub workers: Option<usize>,
    /// Requests allowed to queue for a worker (defaults to twice the workers).
    #[arg(long = "queue-capacity", env = "VISION_QUEUE_CAPACITY", value_name = "N")]
    pub queue_capacity: Option<usize>,
    /// Longest a request may wait in the queue, in milliseconds.
    #[arg(long = "queue-timeout-ms", env = "VISION_QUEUE_TIMEOUT_MS", value_name = "MS",
          default_value_t = DEFAULT_QUEUE_TIMEOUT_MS)]
    pub queue_timeout_ms: u64,
    /// Comma separated upload formats (png, jpeg, bmp, tiff).
    #[arg(long = "allowed-formats", env = "VISION_ALLOWED_FORMATS", value_name = "LIST",
          default_value = "png,jpeg,bmp,tiff")]
    pub allowed_formats: String,
    /// Stage list, e.g. `grayscale;blur:sigma=1.5`.
    #[arg(long = "pipeline", env = "VISION_PIPELINE", value_name = "STAGES", default_value = "")]
    pub pipeline: String,
    /// Default output image format.
    #[arg(long = "output-format", env = "VISION_OUTPUT_FORMAT", value_name = "FORMAT",
          default_value = "png")]
    pub output_format: String,
    /// JPEG quality used when encoding JPEG output (1-100).
    #[arg(long = "jpeg-quality", env = "VISION_JPEG_QUALITY", value_name = "QUALITY",
          default_value_t = DEFAULT_JPEG_QUALITY)]
    pub jpeg_quality: i32,
    /// Busy time before a worker is reported stalled (defaults to 4x the request timeout).
    #[arg(long = "stall-threshold-ms", env = "VISION_STALL_THRESHOLD_MS", value_name = "MS")]
    pub stall_threshold_ms: Option<u64>,
    /// Actix HTTP worker threads.
    #[arg(long = "http-workers", env = "VISION_HTTP_WORKERS", value_name = "N")]
    pub http_workers: Option<usize>,
}

impl TryFrom<ApiArgs> for ApiConfig {
    type Error = anyhow::Error;

    fn try_from(args: ApiArgs) -> Result<Self> {
        if args.max_upload_bytes == 0 {
            bail!("--max-upload-bytes must be at least 1");
        }
        if args.request_timeout_ms == 0 {
            bail!("--request-timeout-ms must be at least 1");
        }
        if args.queue_timeout_ms == 0 {
            bail!("--queue-timeout-ms must be at least 1");
        }

        let workers = args.workers.unwrap_or_else(default_workers);
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        let queue_capacity = args.queue_capacity.unwrap_or(workers.saturating_mul(2));

        let stall_threshold_ms = args
            .stall_threshold_ms
            .unwrap_or(args.request_timeout_ms.saturating_mul(4));
        if stall_threshold_ms == 0 {
            bail!("--stall-threshold-ms must be at least 1");
        }

        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let allowed_formats = FormatAllowList::parse(&args.allowed_formats)
            .map_err(|err| anyhow!("--allowed-formats: {err}"))?;
        if allowed_formats.is_empty() {
            bail!("--allowed-formats must name at least one format");
        }

        let output_format = ImageFormat::from_str(&args.output_format)
            .map_err(|err| anyhow!("--output-format: {err}"))?;

        if matches!(args.http_workers, Some(0)) {
            bail!("--http-workers must be at least 1");
        }

        let config = Self {
            host: args.host,
            port: args.port,
            max_upload_bytes: args.max_upload_bytes,
            request_timeout: Duration::from_millis(args.request_timeout_ms),
            allowed_formats,
            pipeline: args.pipeline,
            output_format,
            jpeg_quality: args.jpeg_quality as u8,
            pool: PoolConfig {
                workers,
                queue_capacity,
                queue_timeout: Duration::from_millis(args.queue_timeout_ms),
                stall_threshold: Duration::from_millis(stall_threshold_ms),
            },
            http_workers: args.http_workers,
        };

        // Stage-list mistakes fail startup.
        config.build_pipeline()?;
        Ok(config)
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
