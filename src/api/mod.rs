//! HTTP API Module
//!
//! Local management API: engine status, counters, and the operator actions
//! (request a bulk update, clear peer states).

mod http;

pub use http::{ClearRequest, ErrorResponse, HealthResponse, HttpServer, StatusResponse};
