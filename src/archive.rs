//! The download archive ledger (yt-dlp --download-archive format).
//!
//! A flat text file with one `youtube <id>` line per downloaded video.
//! yt-dlp consults it for dedup and appends to it on success; this module
//! reads it to compute "what did this job add" and writes to it only when
//! the dedup was bypassed (allow-redownload) or an entry is explicitly
//! removed for an unignore workflow.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::error::AppResult;
use crate::core::utils::video_url_for_id;

/// Handle on the archive ledger file.
#[derive(Debug, Clone)]
pub struct ArchiveLedger {
    path: PathBuf,
}

impl ArchiveLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-empty lines of the ledger. A missing file reads as empty.
    pub fn read_lines(&self) -> AppResult<Vec<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Number of entries; recorded at job start as the "new since start"
    /// cursor.
    pub fn len(&self) -> AppResult<usize> {
        Ok(self.read_lines()?.len())
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Short-link URLs for every entry appended after `initial_count`.
    pub fn new_video_urls_since(&self, initial_count: usize) -> AppResult<Vec<String>> {
        let lines = self.read_lines()?;
        Ok(lines
            .iter()
            .skip(initial_count)
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(video_url_for_id)
            .collect())
    }

    pub fn contains(&self, video_id: &str) -> AppResult<bool> {
        let lines = self.read_lines()?;
        Ok(lines.iter().any(|line| {
            let mut parts = line.split_whitespace();
            parts.next() == Some("youtube") && parts.next() == Some(video_id)
        }))
    }

    /// Append a video to the ledger if not already present. Returns whether
    /// an entry was written.
    pub fn add(&self, video_id: &str) -> AppResult<bool> {
        if video_id.is_empty() {
            log::debug!("add called with empty video id, skipping");
            return Ok(false);
        }
        if self.contains(video_id)? {
            log::debug!("Video {} already in archive, skipping", video_id);
            return Ok(false);
        }

        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "youtube {}", video_id)?;
        log::debug!("Added video {} to archive", video_id);
        Ok(true)
    }

    /// Remove a video from the ledger by rewriting it without the matching
    /// line. Returns whether an entry was removed.
    pub fn remove(&self, video_id: &str) -> AppResult<bool> {
        let lines = self.read_lines()?;
        let kept: Vec<&String> = lines
            .iter()
            .filter(|line| {
                let mut parts = line.split_whitespace();
                !(parts.next() == Some("youtube") && parts.next() == Some(video_id))
            })
            .collect();

        if kept.len() == lines.len() {
            return Ok(false);
        }

        let mut content = kept.iter().map(|l| l.as_str()).collect::<Vec<_>>().join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&self.path, content)?;
        log::debug!("Removed video {} from archive", video_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn ledger_in(dir: &TempDir) -> ArchiveLedger {
        ArchiveLedger::new(dir.path().join("complete.list"))
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        assert_eq!(ledger.read_lines().unwrap(), Vec::<String>::new());
        assert_eq!(ledger.len().unwrap(), 0);
    }

    #[test]
    fn test_add_and_contains() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);

        assert!(ledger.add("dQw4w9WgXcQ").unwrap());
        assert!(ledger.contains("dQw4w9WgXcQ").unwrap());
        // Second add is a dedup no-op.
        assert!(!ledger.add("dQw4w9WgXcQ").unwrap());
        assert_eq!(ledger.len().unwrap(), 1);
    }

    #[test]
    fn test_new_video_urls_since_cursor() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);

        ledger.add("aaaaaaaaaaa").unwrap();
        let cursor = ledger.len().unwrap();
        ledger.add("bbbbbbbbbbb").unwrap();
        ledger.add("ccccccccccc").unwrap();

        assert_eq!(
            ledger.new_video_urls_since(cursor).unwrap(),
            vec!["https://youtu.be/bbbbbbbbbbb", "https://youtu.be/ccccccccccc"]
        );
    }

    #[test]
    fn test_new_video_urls_handles_extra_whitespace() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        fs::write(ledger.path(), "youtube   aaaaaaaaaaa\n\nyoutube bbbbbbbbbbb\n").unwrap();

        assert_eq!(
            ledger.new_video_urls_since(0).unwrap(),
            vec!["https://youtu.be/aaaaaaaaaaa", "https://youtu.be/bbbbbbbbbbb"]
        );
    }

    #[test]
    fn test_remove_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);

        ledger.add("aaaaaaaaaaa").unwrap();
        ledger.add("bbbbbbbbbbb").unwrap();

        assert!(ledger.remove("aaaaaaaaaaa").unwrap());
        assert!(!ledger.contains("aaaaaaaaaaa").unwrap());
        assert!(ledger.contains("bbbbbbbbbbb").unwrap());
        assert!(!ledger.remove("aaaaaaaaaaa").unwrap());
    }
}
