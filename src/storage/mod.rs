//! Persistence: the SQLite pool and the per-video download tracking table

pub mod db;

pub use db::{create_pool, get_connection, DbConnection, DbPool, VideoDownloadTrackingRow};
