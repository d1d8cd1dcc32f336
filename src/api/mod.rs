//! HTTP API Module
//!
//! Provides a REST API for node health and operator control.

mod http;

pub use http::{AppState, HttpServer};
