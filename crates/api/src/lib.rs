//! Request dispatcher for the image processing API.
//!
//! The crate is split into focused modules:
//! - `config`: CLI/env configuration parsing.
//! - `context`: per-request phase tracking.
//! - `pool`: bounded worker pool that runs blocking codec/pipeline work.
//! - `watchdog`: stall detection for pool workers.
//! - `dispatcher`: validation, admission, timeout, and result assembly.
//! - `error`: error taxonomy and its HTTP mapping.
//! - `data`: response bodies.
//! - `server`: Actix Web routes.
//! - `telemetry`: tracing subscriber and Prometheus recorder setup.

pub mod config;
pub mod context;
pub mod data;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod server;
pub mod telemetry;
pub mod watchdog;

pub use config::{ApiArgs, ApiConfig, PoolConfig};
pub use dispatcher::{
    DispatchOutcome, DispatchSettings, Dispatcher, OutputMode, RequestOptions, UploadedImage,
};
pub use error::{DispatchError, ErrorKind};
pub use pool::{PoolError, PoolStatus, WorkerPool};
pub use server::{AppState, configure, run, serve};
