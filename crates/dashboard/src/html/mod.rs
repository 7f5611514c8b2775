//! Embedded static HTML served by the dashboard.
//!
//! The page is a `&'static str` so it ships inside the binary without
//! filesystem lookups.

pub mod index;
