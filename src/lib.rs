//! Telemetry ingestion for manufacturing device agents: framed JSON over
//! TCP/TLS, API-key authentication, and batched writes into a storage backend.

pub mod auth;
pub mod config;
pub mod ingest;
pub mod logging;
pub mod records;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod utils;
pub mod wire;
