//! Browser dashboard for the vision API.
//!
//! Serves a single page that uploads an image, forwards it to the API with an
//! async HTTP client, and renders either the processed image with its
//! measurements or an explanation of what went wrong. Session state lives in
//! memory only.

pub mod client;
pub mod config;
pub mod html;
pub mod messages;
pub mod server;
pub mod session;

pub use client::{ApiClient, ClientError, ProcessResult};
pub use config::{DashboardArgs, DashboardConfig};
pub use messages::{Category, UserMessage};
pub use server::{DashboardState, configure, run, serve};
pub use session::{LastOutcome, SESSION_COOKIE, SessionStore};
