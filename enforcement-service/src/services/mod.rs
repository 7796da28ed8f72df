//! Services module for enforcement-service.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::{Database, RadiusDatabase};
pub use memory::{MemoryRadius, MemoryStore};
pub use metrics::{get_metrics, init_metrics};
pub use store::{AccountingSource, SessionDirectory, Store};
