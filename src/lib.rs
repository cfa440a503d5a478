//! Telemetry hub for a single smart waste bin.
//!
//! The sensor node posts its fill count, distance and lid state; the hub keeps
//! the latest values as one record and serves it back to dashboards.

pub mod api;
pub mod config;
pub mod domain;
pub mod error;
pub mod store;

pub use api::{router, AppState};
pub use config::HubConfig;
pub use domain::Reading;
pub use error::ApiError;
pub use store::{open_store, MemoryStore, ReadingStore, SqliteStore};
