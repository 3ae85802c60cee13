use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::core::error::AppResult;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// A persisted record of a video currently being written to disk.
///
/// Created when a destination line is observed for the video, deleted either
/// individually by crash-recovery cleanup or in bulk when the job concludes.
/// At job end, zero rows with the job's id remain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDownloadTrackingRow {
    pub job_id: String,
    pub youtube_id: String,
    pub file_path: String,
    pub status: String,
}

/// Create a new database connection pool
///
/// Initializes a connection pool with up to 10 connections and ensures the
/// tracking table exists.
pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path);
    let pool = Pool::builder().max_size(10).build(manager)?;

    let conn = pool.get()?;
    if let Err(e) = migrate_schema(&conn) {
        log::warn!("Failed to migrate schema: {}", e);
    }

    Ok(pool)
}

/// In-memory pool for tests.
pub fn create_memory_pool() -> Result<DbPool, r2d2::Error> {
    // A single connection so every access sees the same in-memory database.
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    if let Err(e) = migrate_schema(&conn) {
        log::warn!("Failed to migrate schema: {}", e);
    }
    Ok(pool)
}

/// Get a connection from the pool
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

fn migrate_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS job_video_downloads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            youtube_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'in_progress',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(job_id, youtube_id)
        );
        CREATE INDEX IF NOT EXISTS idx_job_video_downloads_job_id
            ON job_video_downloads(job_id);
        CREATE INDEX IF NOT EXISTS idx_job_video_downloads_status
            ON job_video_downloads(status);",
    )
}

/// Record a video as in progress for a job. Re-observing the same
/// `(job_id, youtube_id)` pair is a no-op.
pub fn track_video_download(pool: &DbPool, job_id: &str, youtube_id: &str, file_path: &str) -> AppResult<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR IGNORE INTO job_video_downloads (job_id, youtube_id, file_path, status)
         VALUES (?1, ?2, ?3, 'in_progress')",
        params![job_id, youtube_id, file_path],
    )?;
    Ok(())
}

/// All rows still marked in progress for a job.
pub fn in_progress_rows(pool: &DbPool, job_id: &str) -> AppResult<Vec<VideoDownloadTrackingRow>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT job_id, youtube_id, file_path, status FROM job_video_downloads
         WHERE job_id = ?1 AND status = 'in_progress'",
    )?;
    let rows = stmt
        .query_map(params![job_id], |row| {
            Ok(VideoDownloadTrackingRow {
                job_id: row.get(0)?,
                youtube_id: row.get(1)?,
                file_path: row.get(2)?,
                status: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All in-progress rows regardless of job, for startup crash recovery.
pub fn all_in_progress_rows(pool: &DbPool) -> AppResult<Vec<VideoDownloadTrackingRow>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT job_id, youtube_id, file_path, status FROM job_video_downloads
         WHERE status = 'in_progress'",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(VideoDownloadTrackingRow {
                job_id: row.get(0)?,
                youtube_id: row.get(1)?,
                file_path: row.get(2)?,
                status: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Delete one tracking row.
pub fn delete_tracking_row(pool: &DbPool, job_id: &str, youtube_id: &str) -> AppResult<()> {
    let conn = pool.get()?;
    conn.execute(
        "DELETE FROM job_video_downloads WHERE job_id = ?1 AND youtube_id = ?2",
        params![job_id, youtube_id],
    )?;
    Ok(())
}

/// Delete every tracking row for a job. Returns the number removed.
pub fn delete_tracking_rows_for_job(pool: &DbPool, job_id: &str) -> AppResult<usize> {
    let conn = pool.get()?;
    let count = conn.execute("DELETE FROM job_video_downloads WHERE job_id = ?1", params![job_id])?;
    Ok(count)
}
