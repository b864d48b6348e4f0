//! DepotSync - incremental content tracking for a single app
//!
//! This library watches one app for upstream version changes, downloads only
//! the bytes that changed since the last synchronized version, and publishes
//! the verified content tree.
//!
//! # Architecture
//!
//! ```text
//! ChangeFeed ──► ChangeDetector ──► VersionStore (version rows + cursors)
//!                      │
//!                      ▼ trigger
//!                Synchronizer ──► DeltaEngine ──► Fetcher ──► EndpointPool
//!                      │                              │
//!                      ▼                              ▼
//!             PostProcessor, Publisher          ContentSession
//! ```

pub mod config;
pub mod delta;
pub mod detect;
pub mod fetch;
pub mod gateway;
pub mod logging;
pub mod model;
pub mod pool;
pub mod process;
pub mod publish;
pub mod session;
pub mod store;
pub mod sync;
pub mod tracker;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
