//! Persistence layer for the meal planning core.
//!
//! Row models, embedded migrations and per-table query functions. Every
//! query function is generic over [`sqlx::PgExecutor`] so the same call can
//! run against the pool or inside a caller-owned transaction.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
