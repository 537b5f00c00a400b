//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite pool, write serialisation and settings
//! - Row models shared by the services

mod database;
mod models;

pub use database::{Database, IntegrityReport, SEARCH_INDEX_STALE_KEY, WriteTx, put_setting};
pub use models::*;

#[cfg(test)]
mod database_test;
