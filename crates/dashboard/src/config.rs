//! Dashboard configuration from CLI flags and environment variables.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;

pub const DEFAULT_DASHBOARD_PORT: u16 = 8501;
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_API_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_MAX_SESSIONS: usize = 256;
/// Larger than the API default so the API, not the dashboard, usually
/// decides what is too large.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct DashboardConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the processing API, without a trailing slash.
    pub api_base_url: String,
    /// Client-side deadline for one API call.
    pub api_timeout: Duration,
    /// Idle time after which a session is forgotten.
    pub session_ttl: Duration,
    /// Sessions kept at once; the least recently seen is evicted beyond this.
    pub max_sessions: usize,
    pub max_upload_bytes: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_DASHBOARD_PORT,
            api_base_url: DEFAULT_API_BASE_URL.into(),
            api_timeout: Duration::from_millis(DEFAULT_API_TIMEOUT_MS),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

/// CLI arguments accepted by the `dashboard` subcommand.
#[derive(Debug, Args)]
pub struct DashboardArgs {
    /// Interface to bind.
    #[arg(long, env = "DASHBOARD_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port to bind.
    #[arg(long, env = "DASHBOARD_PORT", default_value_t = DEFAULT_DASHBOARD_PORT)]
    pub port: u16,
    /// Where the processing API listens.
    #[arg(long = "api-base-url", env = "API_BASE_URL", value_name = "URL",
          default_value = DEFAULT_API_BASE_URL)]
    pub api_base_url: String,
    /// Client timeout for API calls in milliseconds.
    #[arg(long = "api-timeout-ms", env = "DASHBOARD_API_TIMEOUT_MS", value_name = "MS",
          default_value_t = DEFAULT_API_TIMEOUT_MS)]
    pub api_timeout_ms: u64,
    /// Idle seconds before a session is dropped.
    #[arg(long = "session-ttl-secs", env = "DASHBOARD_SESSION_TTL_SECS", value_name = "SECS",
          default_value_t = DEFAULT_SESSION_TTL_SECS)]
    pub session_ttl_secs: u64,
    /// Most sessions held in memory at once.
    #[arg(long = "max-sessions", env = "DASHBOARD_MAX_SESSIONS", value_name = "N",
          default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,
    /// Largest file the dashboard accepts before forwarding.
    #[arg(long = "max-upload-bytes", env = "DASHBOARD_MAX_UPLOAD_BYTES", value_name = "BYTES",
          default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,
}

impl TryFrom<DashboardArgs> for DashboardConfig {
    type Error = anyhow::Error;

    fn try_from(args: DashboardArgs) -> Result<Self> {
        let api_base_url = args.api_base_url.trim().trim_end_matches('/').to_string();
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            bail!("--api-base-url must be an http(s) URL, got {:?}", args.api_base_url);
        }
        if args.api_timeout_ms == 0 {
            bail!("--api-timeout-ms must be at least 1");
        }
        if args.session_ttl_secs == 0 {
            bail!("--session-ttl-secs must be at least 1");
        }
        if args.max_sessions == 0 {
            bail!("--max-sessions must be at least 1");
        }
        if args.max_upload_bytes == 0 {
            bail!("--max-upload-bytes must be at least 1");
        }
        Ok(Self {
            host: args.host,
            port: args.port,
            api_base_url,
            api_timeout: Duration::from_millis(args.api_timeout_ms),
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            max_sessions: args.max_sessions,
            max_upload_bytes: args.max_upload_bytes,
        })
    }
}
