//! Persistence layer for the workflow orchestration engine: connection
//! management, row models, and per-table query modules.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use sqlx::PgPool;
