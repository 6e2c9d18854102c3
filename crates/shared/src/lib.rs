//! Shared infrastructure for the dunning services
//!
//! Database pool construction and schema migrations used by both the API
//! server and the background worker.

pub mod db;

pub use db::{create_pool, create_pool_with, run_migrations, DbError, PoolSettings};
