//! Offline warehouse for collaborative loop-jam archives
//!
//! Mirrors the upstream service's riff/stem metadata into a local SQLite
//! store, repairs known upstream data damage as it ingests, and serves the
//! analytical queries (contents reports, jam slices, exports) the rest of
//! the suite builds on. One background worker thread owns all writes; reads
//! go through a connection pool and are safe from any thread.

pub mod api;
pub mod config;
pub mod db;
pub mod resolver;
pub mod tasks;
pub mod warehouse;

pub use config::{ApiConfig, Auth, StoragePaths};
pub use tasks::{ContentsReport, JamSlice};
pub use warehouse::{Warehouse, WarehouseEvent};
