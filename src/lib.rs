pub mod app;
pub mod config;
pub mod consumer;
pub mod error;
pub mod idempotency;
pub mod limiter;
pub mod metrics;
pub mod models;
pub mod request_headers;
pub mod signature;
pub mod tracker;
