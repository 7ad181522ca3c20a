//! `db` crate: persistence for workflow definitions and run records.
//!
//! Provides the record types with their status machines, the
//! [`WorkflowStore`]/[`ExecutionStore`] seams, an in-memory store and a
//! Postgres store built on a connection pool and repository functions.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use models::{ExecutionRecord, ExecutionStatus, NodeExecutionRecord, NodeStatus, WorkflowRow};
pub use pool::{create_pool, run_migrations, DbPool};
pub use postgres::PgStore;
pub use store::{ExecutionStore, WorkflowStore};
