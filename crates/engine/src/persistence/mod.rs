//! Persistence layer for workflow instances
//!
//! This module provides:
//! - [`InstanceStore`] trait for snapshot persistence with optimistic concurrency
//! - [`InMemoryInstanceStore`] for tests and single-process use
//! - [`PostgresInstanceStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryInstanceStore;
pub use postgres::PostgresInstanceStore;
pub use store::{InstanceFilter, InstanceStore, Page, Pagination, StoreError};
