//! regbridge server.
//!
//! Accepts telemetry values over HTTP, validates them into per-device
//! register banks, and serves those banks to a Modbus RTU master on a serial
//! line.
//!
//! # HTTP Endpoints
//!
//! ```text
//! POST /api/receive-data   {"slave_id": 1, "index": 0, "value": 10.0}
//! GET  /api/snapshot       current display values per device
//! GET  /health
//! ```

pub mod config;
pub mod http;

pub use config::{BridgeConfig, ConfigError, HttpConfig};
pub use http::{BoundHttpServer, HttpServer};
