// ABOUTME: Library root for tablesync
// ABOUTME: Row-level table synchronization between MySQL, PostgreSQL and SQLite databases

pub mod commands;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod filters;
pub mod utils;
pub mod watch;

pub use config::{BisyncOptions, LockScope, SignatureType, SyncOptions};
pub use db::{open_database, Connection, Database};
pub use engine::{has_changes, sync, RunStatus, StateStore, SyncReport, TableResult};
pub use error::{Result, SyncError};
