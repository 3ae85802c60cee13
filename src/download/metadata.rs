//! Resolution of downloaded-video metadata from info.json sidecars.
//!
//! Each download writes an `<id>.info.json` next to the job data. After a
//! job exits, the executor resolves every new video URL through a
//! [`VideoMetadataResolver`] to produce the per-video records attached to
//! the job outcome.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::ratings;

/// Metadata for one video a job produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedVideo {
    pub youtube_id: String,
    pub channel_name: String,
    pub title: String,
    pub duration: Option<f64>,
    pub description: Option<String>,
    pub original_date: Option<String>,
    pub channel_id: Option<String>,
    pub media_type: String,
    /// Display rating implied by the video's age limit, when reported.
    pub content_rating: Option<&'static str>,
    /// Expected location on disk. Set even when the file was not found.
    pub file_path: PathBuf,
    /// Present only when the file was actually observed on disk.
    pub file_size: Option<u64>,
}

impl DownloadedVideo {
    pub fn is_on_disk(&self) -> bool {
        self.file_size.is_some()
    }
}

/// Looks up metadata for freshly downloaded video URLs.
#[async_trait]
pub trait VideoMetadataResolver: Send + Sync {
    async fn resolve(&self, video_urls: &[String]) -> Vec<DownloadedVideo>;
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    id: String,
    title: String,
    uploader: Option<String>,
    channel: Option<String>,
    uploader_id: Option<String>,
    channel_id: Option<String>,
    duration: Option<f64>,
    description: Option<String>,
    upload_date: Option<String>,
    media_type: Option<String>,
    age_limit: Option<u32>,
    #[serde(rename = "_actual_filepath")]
    actual_filepath: Option<String>,
}

fn normalize_channel_field(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("NA") || trimmed.eq_ignore_ascii_case("N/A") {
        return None;
    }
    Some(trimmed.to_string())
}

/// Replicate yt-dlp's filename sanitization: reserved characters become
/// their full-width Unicode equivalents. Needed to predict on-disk paths
/// from raw metadata.
pub fn sanitize_ytdlp_filename(name: &str) -> String {
    name.chars()
        .map(|ch| match ch {
            '|' => '｜',
            '<' => '＜',
            '>' => '＞',
            ':' => '：',
            '"' => '＂',
            '/' => '／',
            '\\' => '＼',
            '?' => '？',
            '*' => '＊',
            other => other,
        })
        .collect()
}

/// Resolver reading `<id>.info.json` sidecars from a fixed directory.
pub struct InfoJsonResolver {
    info_dir: PathBuf,
    library_base: PathBuf,
    file_wait_retries: u32,
    file_wait_initial_delay: Duration,
}

impl InfoJsonResolver {
    pub fn new(info_dir: impl Into<PathBuf>, library_base: impl Into<PathBuf>) -> Self {
        Self {
            info_dir: info_dir.into(),
            library_base: library_base.into(),
            file_wait_retries: 4,
            file_wait_initial_delay: Duration::from_millis(100),
        }
    }

    /// Tune the on-disk wait loop (tests use near-zero delays).
    pub fn with_file_wait(mut self, retries: u32, initial_delay: Duration) -> Self {
        self.file_wait_retries = retries;
        self.file_wait_initial_delay = initial_delay;
        self
    }

    /// Wait for a file to appear with a non-zero size. The post-processing
    /// move can lag the process exit, so retry with exponential backoff.
    async fn wait_for_file(&self, path: &Path) -> Option<u64> {
        let mut delay = self.file_wait_initial_delay;

        for attempt in 0..self.file_wait_retries {
            match tokio::fs::metadata(path).await {
                Ok(stats) if stats.len() > 0 => return Some(stats.len()),
                Ok(_) => log::debug!(
                    "File {} present but empty, attempt {}/{}",
                    path.display(),
                    attempt + 1,
                    self.file_wait_retries
                ),
                Err(_) => log::debug!(
                    "Waiting for file {}, attempt {}/{}",
                    path.display(),
                    attempt + 1,
                    self.file_wait_retries
                ),
            }
            if attempt + 1 < self.file_wait_retries {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        None
    }

    fn expected_path(&self, info: &InfoJson, channel_name: &str, video_id: &str) -> PathBuf {
        if let Some(actual) = info.actual_filepath.as_deref() {
            return PathBuf::from(actual);
        }
        let channel = sanitize_ytdlp_filename(channel_name);
        let title = sanitize_ytdlp_filename(&info.title);
        let folder = format!("{} - {} - {}", channel, title, video_id);
        let file = format!("{} - {}  [{}].mp4", channel, title, video_id);
        self.library_base.join(channel).join(folder).join(file)
    }

    async fn resolve_one(&self, url: &str) -> Option<DownloadedVideo> {
        let video_id = url.rsplit("youtu.be/").next()?.trim();
        if video_id.is_empty() {
            return None;
        }

        let info_path = self.info_dir.join(format!("{}.info.json", video_id));
        let raw = match tokio::fs::read_to_string(&info_path).await {
            Ok(raw) => raw,
            Err(_) => {
                log::debug!("No info.json at {}", info_path.display());
                return None;
            }
        };
        let info: InfoJson = match serde_json::from_str(&raw) {
            Ok(info) => info,
            Err(err) => {
                log::warn!("Malformed info.json at {}: {}", info_path.display(), err);
                return None;
            }
        };

        let channel_name = normalize_channel_field(info.uploader.as_deref())
            .or_else(|| normalize_channel_field(info.channel.as_deref()))
            .or_else(|| normalize_channel_field(info.uploader_id.as_deref()))
            .or_else(|| normalize_channel_field(info.channel_id.as_deref()))
            .unwrap_or_else(|| "Unknown Channel".to_string());

        let file_path = self.expected_path(&info, &channel_name, video_id);
        let file_size = self.wait_for_file(&file_path).await;
        if file_size.is_none() {
            log::warn!("Video file not found for {} at {}", video_id, file_path.display());
        }

        Some(DownloadedVideo {
            youtube_id: info.id,
            channel_name,
            title: info.title,
            duration: info.duration,
            description: info.description,
            original_date: info.upload_date,
            channel_id: info.channel_id,
            media_type: info.media_type.unwrap_or_else(|| "video".to_string()),
            content_rating: info.age_limit.map(ratings::rating_for_age_limit),
            file_path,
            file_size,
        })
    }
}

#[async_trait]
impl VideoMetadataResolver for InfoJsonResolver {
    async fn resolve(&self, video_urls: &[String]) -> Vec<DownloadedVideo> {
        let mut videos = Vec::with_capacity(video_urls.len());
        for url in video_urls {
            if let Some(video) = self.resolve_one(url).await {
                videos.push(video);
            }
        }
        videos
    }
}
