//! HTTP server and image transform for [`imagequeue`].
//!
//! The binary wires an in-memory backend, the [`processor::ImageProcessor`] and the
//! [`api::router`] together using the settings in [`config::Config`].
pub mod api;
pub mod config;
pub mod processor;
pub mod telemetry;
