//! rslicense - DRM license acquisition client and playback source resolution.
//!
//! This crate provides:
//! - A license/provisioning callback that shapes key requests, attaches the
//!   `custom-data` authorization header and decodes license responses.
//! - A blocking HTTP transport that follows 307/308 redirects manually while
//!   preserving method, headers and body.
//! - Asset resolution for HTTP (DASH/HLS/Smooth/progressive), RTSP and test
//!   sources, wiring a DRM session factory only where one is needed.
//!
//! Feature flags:
//! - `cli`: enable the CLI binary.
//! - `chrono`: use chrono for date handling in CLI.
//! - `tracing`: route library logging to `tracing` instead of `log`.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Playback source resolution and DRM session factories.
pub mod asset;
/// License and provisioning request execution.
pub mod callback;
/// YAML client configuration.
pub mod config;
/// `custom-data` header construction.
pub mod custom_data;
/// Common error types and Result alias.
pub mod error;
/// Thread-safe key request header store.
pub mod properties;
/// HTTP transport with manual redirect handling.
pub mod transport;
/// Shared helper utilities.
pub mod utils;

pub use error::{Error, Result};
