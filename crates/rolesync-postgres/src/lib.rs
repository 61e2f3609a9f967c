//! # PostgreSQL collaborator for rolesync
//!
//! Implements [`rolesync_core::PgClient`] over `sqlx`. Statements passed to
//! `execute` run in a single transaction on the selected database.

pub mod client;
pub mod config;

pub use client::PostgresClient;
pub use config::PgSettings;
