//! Per-job progress monitoring: converts yt-dlp's line-oriented output into
//! typed progress snapshots.
//!
//! yt-dlp's log format is not a stable contract, so all pattern matching
//! lives here in one classification layer. The executor feeds every line
//! through [`ProgressMonitor::process_progress`] and publishes whatever
//! snapshots come out; nothing else in the crate inspects raw lines for
//! state.

use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::core::config;

/// EMA weight for new speed samples.
const SPEED_SMOOTHING_WEIGHT: f64 = 0.15;

/// EMA weight for new eta samples. Much heavier smoothing than speed
/// because instantaneous eta swings wildly between fragments.
const ETA_SMOOTHING_WEIGHT: f64 = 0.05;

/// Max display title length before ellipsis truncation.
const DISPLAY_TITLE_MAX: usize = 60;

static PLAYLIST_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\] Downloading playlist:\s*(.+?)\s*-\s*Videos").unwrap());
static PLAYLIST_INIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[youtube:tab\] Playlist (.+): Downloading (\d+) items").unwrap());
static PLAYLIST_CHANNEL_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(.+?)\s*-\s*Videos?$").unwrap());
static ITEM_POSITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\] Downloading item (\d+) of (\d+)").unwrap());
static FRAGMENT_VIDEO_EXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.f\d+\.mp4$").unwrap());
static FRAGMENT_AUDIO_EXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.f\d+\.m4a$").unwrap());
static SUBTITLE_EXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.(vtt|srt)$").unwrap());
static FRAGMENT_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.f\d+\.[^.]+$").unwrap());
static FILE_EXTENSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.[^.]+$").unwrap());
static ID_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+\[[^\]]+\]$").unwrap());
static BYTE_RATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\d+(?:\.\d+)?)([KMG]?i?B?)$").unwrap());

/// Kind of job the monitor is tracking. Controls channel-reset and
/// manual-URL counting behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    ChannelDownloads,
    ManuallyAddedUrls,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ChannelDownloads => "Channel Downloads",
            JobKind::ManuallyAddedUrls => "Manually Added Urls",
        }
    }
}

/// Lifecycle states of one download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Initiating,
    Preparing,
    PreparingSubtitles,
    DownloadingVideo,
    DownloadingAudio,
    DownloadingThumbnail,
    DownloadingSubtitles,
    ProcessingMetadata,
    Merging,
    Metadata,
    Processing,
    Complete,
    Stalled,
    Error,
    Failed,
    Terminated,
    BotDetected,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Complete | DownloadState::Error | DownloadState::Failed | DownloadState::Terminated
        )
    }
}

/// Byte/percent/speed/eta metrics from the structured progress token.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMetrics {
    pub percent: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_second: f64,
    pub eta_seconds: u64,
}

/// What is currently downloading, extracted from destination lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub channel: String,
    pub title: String,
    pub display_title: String,
}

/// Per-job video counters.
///
/// `completed` and `skipped` are whole-job totals and never decrease;
/// `current` and `skipped_this_channel` reset when a new channel begins
/// within a multi-channel job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCount {
    pub current: u64,
    pub total: u64,
    pub completed: u64,
    pub skipped: u64,
    pub skipped_this_channel: u64,
}

impl Default for VideoCount {
    fn default() -> Self {
        Self {
            // The first video is #1.
            current: 1,
            total: 0,
            completed: 0,
            skipped: 0,
            skipped_this_channel: 0,
        }
    }
}

/// Immutable progress value published on every state-relevant line. The
/// latest snapshot is the externally visible "current progress" of the job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub progress: ProgressMetrics,
    pub stalled: bool,
    pub state: DownloadState,
    pub video_info: VideoInfo,
    pub video_count: VideoCount,
    pub download_type: String,
    pub current_channel_name: String,
}

/// Stall detection and rate settings for one monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enable_stall_detection: bool,
    pub stall_detection_window_secs: u64,
    pub stall_detection_rate_threshold: String,
    pub download_throttled_rate: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable_stall_detection: config::stall::ENABLED,
            stall_detection_window_secs: config::stall::WINDOW_SECS,
            stall_detection_rate_threshold: config::stall::RATE_THRESHOLD.to_string(),
            download_throttled_rate: config::download::THROTTLED_RATE.to_string(),
        }
    }
}

/// One parsed structured progress token.
#[derive(Debug, Clone)]
pub struct ParsedProgress {
    pub percent: f64,
    pub downloaded: f64,
    pub total: f64,
    pub speed: f64,
    pub eta_seconds: f64,
    pub timestamp: Instant,
}

/// Parse a byte-rate configuration string like "100K", "1.5MiB" or "2048"
/// into bytes per second. Decimal units multiply by 1000, binary units by
/// 1024. An unparseable string falls back to its bare numeric value or 0.
pub fn parse_byte_rate(rate: &str) -> f64 {
    let trimmed = rate.trim();
    let Some(caps) = BYTE_RATE.captures(trimmed) else {
        return trimmed.parse().unwrap_or(0.0);
    };
    let value: f64 = caps[1].parse().unwrap_or(0.0);
    let multiplier = match caps[2].to_uppercase().as_str() {
        "B" | "" => 1.0,
        "K" | "KB" => 1000.0,
        "KIB" => 1024.0,
        "M" | "MB" => 1_000_000.0,
        "MIB" => 1024.0 * 1024.0,
        "G" | "GB" => 1_000_000_000.0,
        "GIB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    value * multiplier
}

/// Channel tokens equal to "NA"/"N/A" normalize to empty: yt-dlp emits
/// those when the uploader field is missing.
fn normalize_channel_name(name: &str) -> String {
    let trimmed = name.trim();
    let upper = trimmed.to_uppercase();
    if upper == "NA" || upper == "N/A" {
        return String::new();
    }
    trimmed.to_string()
}

fn truncate_display_title(title: &str) -> String {
    if title.chars().count() > DISPLAY_TITLE_MAX {
        let head: String = title.chars().take(DISPLAY_TITLE_MAX - 3).collect();
        format!("{}...", head)
    } else {
        title.to_string()
    }
}

/// Stateful per-job parser. One instance per executor invocation.
pub struct ProgressMonitor {
    job_id: String,
    job_kind: JobKind,
    monitor_config: MonitorConfig,
    last_useful_update: Instant,
    last_percent: f64,
    last_snapshot: Option<ProgressSnapshot>,
    current_state: DownloadState,
    last_video_info: Option<VideoInfo>,
    last_emitted_state: Option<DownloadState>,
    has_error: bool,
    video_count: VideoCount,
    current_channel_name: String,
    current_video_completed: bool,
    channel_name_just_set: bool,
    smoothed_speed: Option<f64>,
    smoothed_eta: Option<f64>,
}

impl ProgressMonitor {
    pub fn new(job_id: impl Into<String>, job_kind: JobKind, monitor_config: MonitorConfig) -> Self {
        Self {
            job_id: job_id.into(),
            job_kind,
            monitor_config,
            last_useful_update: Instant::now(),
            last_percent: 0.0,
            last_snapshot: None,
            current_state: DownloadState::Initiating,
            last_video_info: None,
            last_emitted_state: None,
            has_error: false,
            video_count: VideoCount::default(),
            current_channel_name: String::new(),
            current_video_completed: false,
            channel_name_just_set: false,
            smoothed_speed: None,
            smoothed_eta: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_kind(&self) -> JobKind {
        self.job_kind
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    pub fn set_has_error(&mut self) {
        self.has_error = true;
    }

    pub fn video_count(&self) -> &VideoCount {
        &self.video_count
    }

    pub fn current_channel_name(&self) -> &str {
        &self.current_channel_name
    }

    pub fn last_snapshot(&self) -> Option<&ProgressSnapshot> {
        self.last_snapshot.as_ref()
    }

    /// Pre-seed the expected total for a job whose URL count is known up
    /// front (multi-URL manual jobs).
    pub fn set_expected_total(&mut self, total: u64) {
        self.video_count.total = total;
    }

    /// Used by the final-outcome fixup when the archive delta found videos
    /// the line parser missed.
    pub fn force_completed_count(&mut self, completed: u64) {
        self.video_count.completed = completed;
    }

    /// Parse the structured progress token out of a JSON string. Returns
    /// None for anything that is not a token with a percent field.
    pub fn parse_progress_token(text: &str) -> Option<ParsedProgress> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let percent_raw = value.get("percent")?.as_str()?;
        let percent: f64 = percent_raw.trim().trim_end_matches('%').trim().parse().ok()?;

        let num = |key: &str| -> f64 {
            match value.get(key) {
                Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
                Some(v) => v.as_f64().unwrap_or(0.0),
                None => 0.0,
            }
        };

        Some(ParsedProgress {
            percent,
            downloaded: num("downloaded"),
            total: num("total"),
            speed: num("speed"),
            eta_seconds: num("eta"),
            timestamp: Instant::now(),
        })
    }

    /// Stall check. A sample is "useful" (resets the clock) when percent
    /// advanced by more than 0.1 or speed is exactly zero; otherwise the
    /// sample is stalled once the window has elapsed and speed sits below
    /// min(threshold, throttled rate).
    pub fn is_stalled(&mut self, progress: &ParsedProgress) -> bool {
        if !self.monitor_config.enable_stall_detection {
            return false;
        }

        let threshold = parse_byte_rate(&self.monitor_config.stall_detection_rate_threshold);
        let throttled = parse_byte_rate(&self.monitor_config.download_throttled_rate);
        let effective_threshold = threshold.min(throttled);

        let percent_advanced = progress.percent > self.last_percent + 0.1;
        if percent_advanced || progress.speed == 0.0 {
            self.last_useful_update = progress.timestamp;
            if percent_advanced {
                self.last_percent = progress.percent;
            }
            return false;
        }

        let elapsed = progress.timestamp.duration_since(self.last_useful_update).as_secs_f64();

        progress.speed > 0.0
            && progress.speed < effective_threshold
            && elapsed >= self.monitor_config.stall_detection_window_secs as f64
    }

    /// Reset the stall/activity clock and metric smoothing when a new item
    /// starts.
    fn reset_progress_tracking(&mut self) {
        self.last_percent = 0.0;
        self.last_useful_update = Instant::now();
        self.smoothed_speed = None;
        self.smoothed_eta = None;
    }

    /// Video info as it should appear for a given state: while preparing
    /// the next video, the previous title must not bleed through, so only
    /// the channel is retained.
    fn effective_video_info(&self, state: DownloadState, info: Option<VideoInfo>) -> VideoInfo {
        let base = info
            .or_else(|| self.last_snapshot.as_ref().map(|s| s.video_info.clone()))
            .or_else(|| self.last_video_info.clone())
            .unwrap_or_default();
        if matches!(state, DownloadState::Preparing | DownloadState::PreparingSubtitles) {
            VideoInfo {
                channel: base.channel,
                title: String::new(),
                display_title: String::new(),
            }
        } else {
            base
        }
    }

    /// Produce a snapshot for an explicit state (job start, termination,
    /// final outcome) and remember it as the current progress.
    pub fn snapshot(&mut self, state_override: Option<DownloadState>) -> ProgressSnapshot {
        let state = state_override.unwrap_or(self.current_state);

        let mut progress = self
            .last_snapshot
            .as_ref()
            .map(|s| s.progress.clone())
            .unwrap_or_else(|| ProgressMetrics {
                percent: if state == DownloadState::Complete { 100.0 } else { 0.0 },
                ..ProgressMetrics::default()
            });

        if state == DownloadState::Complete {
            if progress.percent < 100.0 {
                progress.percent = 100.0;
            }
            if progress.total_bytes > 0 && progress.downloaded_bytes < progress.total_bytes {
                progress.downloaded_bytes = progress.total_bytes;
            }
            progress.speed_bytes_per_second = 0.0;
            progress.eta_seconds = 0;
        }

        let video_info = self.effective_video_info(state, None);

        let payload = ProgressSnapshot {
            job_id: self.job_id.clone(),
            progress,
            stalled: state == DownloadState::Stalled,
            state,
            video_info: video_info.clone(),
            video_count: self.video_count.clone(),
            download_type: self.job_kind.as_str().to_string(),
            current_channel_name: self.current_channel_name.clone(),
        };

        self.current_state = state;
        self.last_emitted_state = Some(state);
        self.last_video_info = Some(video_info);
        if matches!(state, DownloadState::Error | DownloadState::Failed) {
            self.has_error = true;
        }
        self.last_snapshot = Some(payload.clone());

        payload
    }

    /// Parse destination lines of the form
    /// `<channel> - <title> [<id>]` (fragment and extension suffixes
    /// stripped) into the current video info.
    fn extract_video_info(&mut self, line: &str) -> Option<VideoInfo> {
        if !line.contains("[download] Destination:") {
            return self.last_video_info.clone();
        }

        let full_path = line.split("Destination:").nth(1)?.trim();
        let filename = full_path.rsplit(['/', '\\']).next().unwrap_or("");

        let without_fragment = FRAGMENT_SUFFIX.replace(filename, "");
        let without_ext = FILE_EXTENSION.replace(&without_fragment, "");
        let base_name = ID_SUFFIX.replace(&without_ext, "").trim().to_string();

        let (channel_part, raw_title) = match base_name.split_once(" - ") {
            Some((channel, title)) => (channel.trim().to_string(), title.trim().to_string()),
            None => (String::new(), base_name),
        };
        let normalized_channel = normalize_channel_name(&channel_part);

        let title = if raw_title.is_empty() {
            "Unknown Title".to_string()
        } else {
            raw_title
        };
        let display_title = truncate_display_title(&title);

        let channel = if normalized_channel.is_empty() {
            self.last_video_info
                .as_ref()
                .map(|v| v.channel.clone())
                .or_else(|| self.last_snapshot.as_ref().map(|s| s.video_info.channel.clone()))
                .unwrap_or_default()
        } else {
            normalized_channel
        };

        let info = VideoInfo {
            channel,
            title,
            display_title,
        };

        if !info.channel.is_empty() {
            self.current_channel_name = info.channel.clone();
        }
        self.last_video_info = Some(info.clone());
        Some(info)
    }

    /// The line-classification table. Adapting to a new yt-dlp log format
    /// means changing this function, not the state machine.
    fn determine_state(&mut self, line: &str) -> Option<DownloadState> {
        if line.contains("[download] Destination:") {
            let path = line.split("Destination:").nth(1).unwrap_or("").trim();
            if FRAGMENT_VIDEO_EXT.is_match(path) {
                return Some(DownloadState::DownloadingVideo);
            }
            if FRAGMENT_AUDIO_EXT.is_match(path) {
                return Some(DownloadState::DownloadingAudio);
            }
            if path.contains("poster") || path.contains("thumbnail") {
                return Some(DownloadState::DownloadingThumbnail);
            }
            if SUBTITLE_EXT.is_match(path) {
                return Some(DownloadState::DownloadingSubtitles);
            }
        }

        if line.contains("[Merger]") {
            return Some(DownloadState::Merging);
        }
        if line.contains("[Metadata]") {
            return Some(DownloadState::Metadata);
        }
        if line.contains("[MoveFiles]") {
            return Some(DownloadState::Processing);
        }
        if line.contains("[ExtractAudio]") || line.contains("[Fixup") {
            return Some(DownloadState::ProcessingMetadata);
        }
        if line.contains("Completed:") {
            return Some(DownloadState::Complete);
        }
        if line.contains("ERROR:") {
            self.has_error = true;
            return Some(DownloadState::Error);
        }
        if line.contains("[info]") && line.contains("Downloading subtitles") {
            return Some(DownloadState::PreparingSubtitles);
        }
        if line.contains("Downloading webpage")
            || line.contains("Downloading player")
            || line.contains("Downloading m3u8 information")
            || line.contains("Extracting URL:")
        {
            return Some(DownloadState::Preparing);
        }

        None
    }

    /// Video-count bookkeeping, applied to every raw line. Returns true if
    /// the line matched one of the counting rules.
    ///
    /// Counting rules are mutually exclusive per line and evaluated in
    /// order: playlist header, playlist init, skip markers, item position,
    /// single-video extraction, completion markers.
    fn parse_and_update_video_counts(&mut self, line: &str) -> bool {
        // Channel header: resets per-channel counters, but only channel
        // download jobs reset on a name change. Whole-job totals never
        // reset mid-job.
        if let Some(caps) = PLAYLIST_HEADER.captures(line) {
            let new_channel_name = caps[1].trim().to_string();
            if self.job_kind == JobKind::ChannelDownloads
                && !self.current_channel_name.is_empty()
                && self.current_channel_name != new_channel_name
            {
                log::info!("Starting new channel: {}, resetting counts", new_channel_name);
                self.video_count.current = 1;
                self.video_count.skipped_this_channel = 0;
                self.current_video_completed = false;
            }
            self.current_channel_name = new_channel_name;
            self.channel_name_just_set = true;
            return true;
        }

        // Playlist announcement with item count, e.g.
        // "[youtube:tab] Playlist Chan - Videos: Downloading 42 items".
        if let Some(caps) = PLAYLIST_INIT.captures(line) {
            let playlist_name = caps[1].to_string();
            let new_channel_name = PLAYLIST_CHANNEL_NAME
                .captures(&playlist_name)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_else(|| {
                    playlist_name
                        .split(" - ")
                        .next()
                        .unwrap_or(&playlist_name)
                        .trim()
                        .to_string()
                });

            if !self.current_channel_name.is_empty() && self.current_channel_name != new_channel_name {
                log::info!("Starting new channel: {}, resetting per-channel counts", new_channel_name);
                self.video_count.skipped_this_channel = 0;
                self.video_count.current = 1;
                self.current_video_completed = false;
            }

            self.current_channel_name = new_channel_name;
            self.video_count.total = caps[2].parse().unwrap_or(self.video_count.total);
            self.channel_name_just_set = true;
            return true;
        }

        // Skipped: already archived or filtered out.
        if line.contains("has already been recorded in the archive") || line.contains("does not pass filter") {
            if !self.current_video_completed {
                self.video_count.skipped += 1;
                self.video_count.skipped_this_channel += 1;
                if self.video_count.completed > 0 {
                    self.video_count.current += 1;
                }
                log::debug!(
                    "Video {} skipped, total skipped {}",
                    self.video_count.current,
                    self.video_count.skipped
                );
            }
            return true;
        }

        // "[download] Downloading item N of M" — yt-dlp already accounts
        // for skipped items in N, so use it directly.
        if let Some(caps) = ITEM_POSITION.captures(line) {
            let new_current: u64 = caps[1].parse().unwrap_or(self.video_count.current);
            self.video_count.total = caps[2].parse().unwrap_or(self.video_count.total);
            self.current_video_completed = false;
            self.video_count.current = new_current;
            self.reset_progress_tracking();
            return true;
        }

        // Single-video extraction start (manual URLs and plain one-off
        // downloads).
        if line.contains("[youtube] Extracting URL:") && !line.contains("[youtube:tab]") {
            if self.job_kind == JobKind::ManuallyAddedUrls {
                self.current_video_completed = false;
                if self.video_count.total == 0 {
                    self.video_count.total = 1;
                }
                if self.video_count.completed > 0 {
                    self.video_count.current += 1;
                }
                self.reset_progress_tracking();
            } else if self.video_count.total == 0 {
                self.video_count.current = 1;
                self.video_count.total = 1;
                self.current_video_completed = false;
                self.reset_progress_tracking();
            }
            return true;
        }

        // "Deleting original file" also fires when yt-dlp cleans up a
        // converted thumbnail; that must not count as a video completion.
        if line.contains("Deleting original file") {
            let lower = line.to_lowercase();
            let is_thumbnail_cleanup =
                [".webp", ".jpg", ".jpeg", ".png"].iter().any(|ext| lower.contains(ext));
            if is_thumbnail_cleanup {
                return true;
            }
        }

        let completion_indicators = [
            "[download] 100%",
            "[Merger] Merging formats into",
            "[MoveFiles] Moving file",
            "[Metadata] Adding metadata to",
            "Deleting original file",
            "Completed:",
        ];
        if completion_indicators.iter().any(|marker| line.contains(marker)) {
            // Each video increments completed at most once, however many
            // completion markers it produces.
            if !self.current_video_completed {
                self.video_count.completed += 1;
                self.current_video_completed = true;
                log::debug!(
                    "Video {} downloaded, total completed {}",
                    self.video_count.current,
                    self.video_count.completed
                );
            }
            return true;
        }

        false
    }

    fn smooth_metrics(&mut self, parsed: &ParsedProgress) -> ProgressMetrics {
        let speed = match self.smoothed_speed {
            Some(prev) => prev + SPEED_SMOOTHING_WEIGHT * (parsed.speed - prev),
            None => parsed.speed,
        };
        self.smoothed_speed = Some(speed);

        let raw_eta = if parsed.eta_seconds > 0.0 {
            parsed.eta_seconds
        } else if speed > 0.0 && parsed.total > parsed.downloaded {
            (parsed.total - parsed.downloaded) / speed
        } else {
            0.0
        };
        let eta = match self.smoothed_eta {
            Some(prev) => prev + ETA_SMOOTHING_WEIGHT * (raw_eta - prev),
            None => raw_eta,
        };
        self.smoothed_eta = Some(eta);

        ProgressMetrics {
            percent: parsed.percent,
            downloaded_bytes: parsed.downloaded.max(0.0) as u64,
            total_bytes: parsed.total.max(0.0) as u64,
            speed_bytes_per_second: speed,
            eta_seconds: eta.max(0.0).round() as u64,
        }
    }

    /// Process one line. `token_source` is the candidate JSON portion of
    /// the line ("{}" when the caller only wants state updates), `raw_line`
    /// the full line. Returns a snapshot when something worth publishing
    /// changed.
    pub fn process_progress(&mut self, token_source: &str, raw_line: &str) -> Option<ProgressSnapshot> {
        let parsed = Self::parse_progress_token(token_source);

        let new_state = self.determine_state(raw_line);
        if let Some(state) = new_state {
            self.current_state = state;
        }

        self.parse_and_update_video_counts(raw_line);

        let video_info = self.extract_video_info(raw_line);

        let video_info_changed = match (&video_info, &self.last_snapshot) {
            (Some(info), Some(snapshot)) => info.display_title != snapshot.video_info.display_title,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let should_emit_initial = self.last_snapshot.is_none();
        let state_changed = new_state.is_some() && new_state != self.last_emitted_state;
        let channel_name_just_set = std::mem::take(&mut self.channel_name_just_set);

        let Some(parsed) = parsed else {
            if should_emit_initial || state_changed || video_info_changed || channel_name_just_set {
                return Some(self.snapshot(Some(self.current_state)));
            }
            return None;
        };

        // Some tool versions emit progress tokens before the destination
        // line; percent moving while still initiating means the video
        // download has in fact started.
        if new_state.is_none() && parsed.percent > 0.0 && self.current_state == DownloadState::Initiating {
            self.current_state = DownloadState::DownloadingVideo;
        }

        let stalled = self.is_stalled(&parsed);
        let progress = self.smooth_metrics(&parsed);
        let state = if stalled { DownloadState::Stalled } else { self.current_state };
        let video_info = self.effective_video_info(state, video_info);

        let payload = ProgressSnapshot {
            job_id: self.job_id.clone(),
            progress,
            stalled,
            state,
            video_info: video_info.clone(),
            video_count: self.video_count.clone(),
            download_type: self.job_kind.as_str().to_string(),
            current_channel_name: self.current_channel_name.clone(),
        };

        self.last_emitted_state = Some(state);
        self.last_video_info = Some(video_info);
        self.last_snapshot = Some(payload.clone());

        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn monitor(kind: JobKind) -> ProgressMonitor {
        ProgressMonitor::new("job-1", kind, MonitorConfig::default())
    }

    fn stall_monitor(window_secs: u64) -> ProgressMonitor {
        ProgressMonitor::new(
            "job-1",
            JobKind::ChannelDownloads,
            MonitorConfig {
                enable_stall_detection: true,
                stall_detection_window_secs: window_secs,
                stall_detection_rate_threshold: "100K".to_string(),
                download_throttled_rate: "100K".to_string(),
            },
        )
    }

    fn sample(percent: f64, speed: f64, at: Instant) -> ParsedProgress {
        ParsedProgress {
            percent,
            downloaded: 0.0,
            total: 0.0,
            speed,
            eta_seconds: 0.0,
            timestamp: at,
        }
    }

    #[test]
    fn test_parse_byte_rate_units() {
        assert_eq!(parse_byte_rate("100"), 100.0);
        assert_eq!(parse_byte_rate("100B"), 100.0);
        assert_eq!(parse_byte_rate("100K"), 100_000.0);
        assert_eq!(parse_byte_rate("100KB"), 100_000.0);
        assert_eq!(parse_byte_rate("100KiB"), 102_400.0);
        assert_eq!(parse_byte_rate("1.5M"), 1_500_000.0);
        assert_eq!(parse_byte_rate("1.5MB"), 1_500_000.0);
        assert_eq!(parse_byte_rate("1MiB"), 1_048_576.0);
        assert_eq!(parse_byte_rate("2G"), 2_000_000_000.0);
        assert_eq!(parse_byte_rate("2GB"), 2_000_000_000.0);
        assert_eq!(parse_byte_rate("1GiB"), 1_073_741_824.0);
        assert_eq!(parse_byte_rate(" 100K "), 100_000.0);
    }

    #[test]
    fn test_parse_byte_rate_fallbacks() {
        assert_eq!(parse_byte_rate("garbage"), 0.0);
        assert_eq!(parse_byte_rate("12.5"), 12.5);
        assert_eq!(parse_byte_rate(""), 0.0);
    }

    #[test]
    fn test_stall_never_fires_before_window() {
        let mut m = stall_monitor(60);
        let start = Instant::now();

        assert!(!m.is_stalled(&sample(10.0, 50_000.0, start)));
        // Still inside the window.
        assert!(!m.is_stalled(&sample(10.0, 50_000.0, start + Duration::from_secs(30))));
    }

    #[test]
    fn test_stall_fires_after_window_at_low_speed() {
        let mut m = stall_monitor(60);
        let start = Instant::now();

        // Useful sample resets the clock to `start`.
        assert!(!m.is_stalled(&sample(10.0, 50_000.0, start)));
        assert!(m.is_stalled(&sample(10.05, 50_000.0, start + Duration::from_secs(61))));
    }

    #[test]
    fn test_stall_does_not_fire_while_percent_advances() {
        let mut m = stall_monitor(60);
        let start = Instant::now();

        assert!(!m.is_stalled(&sample(10.0, 50_000.0, start)));
        assert!(!m.is_stalled(&sample(20.0, 50_000.0, start + Duration::from_secs(120))));
    }

    #[test]
    fn test_stall_zero_speed_is_a_reset_not_a_stall() {
        let mut m = stall_monitor(60);
        let start = Instant::now();

        assert!(!m.is_stalled(&sample(10.0, 50_000.0, start)));
        assert!(!m.is_stalled(&sample(10.0, 0.0, start + Duration::from_secs(120))));
        // Zero-speed sample reset the clock, so the next slow sample is
        // back inside the window.
        assert!(!m.is_stalled(&sample(10.0, 50_000.0, start + Duration::from_secs(150))));
    }

    #[test]
    fn test_stall_does_not_fire_at_healthy_speed() {
        let mut m = stall_monitor(60);
        let start = Instant::now();

        assert!(!m.is_stalled(&sample(10.0, 50_000.0, start)));
        // 200 KB/s is above min(threshold, throttled) = 100 KB/s.
        assert!(!m.is_stalled(&sample(10.0, 200_000.0, start + Duration::from_secs(120))));
    }

    #[test]
    fn test_parse_progress_token() {
        let parsed =
            ProgressMonitor::parse_progress_token(r#"{"percent":" 42.5%","downloaded":"1000","total":"2000","speed":"512","eta":"30"}"#)
                .unwrap();
        assert_eq!(parsed.percent, 42.5);
        assert_eq!(parsed.downloaded, 1000.0);
        assert_eq!(parsed.total, 2000.0);
        assert_eq!(parsed.speed, 512.0);
        assert_eq!(parsed.eta_seconds, 30.0);
    }

    #[test]
    fn test_parse_progress_token_rejects_non_tokens() {
        assert!(ProgressMonitor::parse_progress_token("{}").is_none());
        assert!(ProgressMonitor::parse_progress_token("not json").is_none());
        assert!(ProgressMonitor::parse_progress_token(r#"{"other":"field"}"#).is_none());
    }

    #[test]
    fn test_two_item_playlist_scenario() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let token = r#"{"percent":"100.0%","downloaded":"100","total":"100","speed":"0","eta":"0"}"#;

        let lines = [
            "[youtube:tab] Playlist Chan - Videos: Downloading 2 items",
            "[download] Downloading item 1 of 2",
        ];
        for line in lines {
            m.process_progress("{}", line);
        }
        m.process_progress(token, token);
        m.process_progress("{}", "[Merger] Merging formats into \"x\"");
        m.process_progress("{}", "[download] Downloading item 2 of 2");
        m.process_progress(token, token);
        let last = m.process_progress("{}", "Completed: x").unwrap();

        assert_eq!(m.video_count().current, 2);
        assert_eq!(m.video_count().total, 2);
        assert_eq!(m.video_count().completed, 2);
        assert_eq!(m.video_count().skipped, 0);
        assert_eq!(last.state, DownloadState::Complete);
    }

    #[test]
    fn test_completed_increments_once_per_video() {
        let mut m = monitor(JobKind::ChannelDownloads);
        m.process_progress("{}", "[download] Downloading item 1 of 3");
        m.process_progress("{}", "[download] 100% of 10MiB");
        m.process_progress("{}", "[Merger] Merging formats into \"x\"");
        m.process_progress("{}", "[MoveFiles] Moving file x");
        m.process_progress("{}", "[Metadata] Adding metadata to x");
        assert_eq!(m.video_count().completed, 1);

        m.process_progress("{}", "[download] Downloading item 2 of 3");
        m.process_progress("{}", "[download] 100% of 10MiB");
        assert_eq!(m.video_count().completed, 2);
    }

    #[test]
    fn test_thumbnail_cleanup_is_not_a_completion() {
        let mut m = monitor(JobKind::ChannelDownloads);
        m.process_progress("{}", "[download] Downloading item 1 of 1");
        m.process_progress("{}", "Deleting original file /out/poster.webp (pass -k to keep)");
        assert_eq!(m.video_count().completed, 0);

        m.process_progress("{}", "Deleting original file /out/x.f137.mp4 (pass -k to keep)");
        assert_eq!(m.video_count().completed, 1);
    }

    #[test]
    fn test_new_channel_resets_per_channel_counts_only() {
        let mut m = monitor(JobKind::ChannelDownloads);
        m.process_progress("{}", "[youtube:tab] Playlist Alpha - Videos: Downloading 3 items");
        m.process_progress("{}", "[download] Downloading item 2 of 3");
        m.process_progress("{}", "[download] 100% of 10MiB");
        m.process_progress("{}", "[download] Downloading item 3 of 3");
        m.process_progress("{}", "has already been recorded in the archive");
        assert_eq!(m.video_count().completed, 1);
        assert_eq!(m.video_count().skipped, 1);

        m.process_progress("{}", "[youtube:tab] Playlist Beta - Videos: Downloading 5 items");
        assert_eq!(m.video_count().current, 1);
        assert_eq!(m.video_count().skipped_this_channel, 0);
        // Whole-job totals untouched.
        assert_eq!(m.video_count().completed, 1);
        assert_eq!(m.video_count().skipped, 1);
        assert_eq!(m.current_channel_name(), "Beta");
        assert_eq!(m.video_count().total, 5);
    }

    #[test]
    fn test_skip_counting_follows_item_boundaries() {
        let mut m = monitor(JobKind::ChannelDownloads);
        // A skip before any completion counts but does not advance current.
        m.process_progress("{}", "xyz has already been recorded in the archive");
        assert_eq!(m.video_count().current, 1);
        assert_eq!(m.video_count().skipped, 1);

        m.process_progress("{}", "[download] Downloading item 1 of 3");
        m.process_progress("{}", "[download] 100% of 10MiB");
        // Skip lines between a completion and the next item marker belong
        // to the item that already completed and are suppressed.
        m.process_progress("{}", "abc has already been recorded in the archive");
        assert_eq!(m.video_count().skipped, 1);
        assert_eq!(m.video_count().current, 1);

        // After the next item marker, skips count again and advance
        // current because a completion exists.
        m.process_progress("{}", "[download] Downloading item 2 of 3");
        m.process_progress("{}", "def has already been recorded in the archive");
        assert_eq!(m.video_count().skipped, 2);
        assert_eq!(m.video_count().current, 3);
    }

    #[test]
    fn test_manual_url_counting() {
        let mut m = monitor(JobKind::ManuallyAddedUrls);
        m.set_expected_total(2);

        m.process_progress("{}", "[youtube] Extracting URL: https://youtu.be/aaaaaaaaaaa");
        assert_eq!(m.video_count().current, 1);
        assert_eq!(m.video_count().total, 2);

        m.process_progress("{}", "[download] 100% of 10MiB");
        m.process_progress("{}", "[youtube] Extracting URL: https://youtu.be/bbbbbbbbbbb");
        assert_eq!(m.video_count().current, 2);
    }

    #[test]
    fn test_extract_video_info_from_destination() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let info = m
            .extract_video_info("[download] Destination: /out/Chan - Title [dQw4w9WgXcQ].f137.mp4")
            .unwrap();
        assert_eq!(info.channel, "Chan");
        assert_eq!(info.title, "Title");
        assert_eq!(info.display_title, "Title");
    }

    #[test]
    fn test_extract_video_info_na_channel_normalizes_empty() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let info = m
            .extract_video_info("[download] Destination: /out/NA - Some Video [dQw4w9WgXcQ].mp4")
            .unwrap();
        assert_eq!(info.channel, "");
        assert_eq!(info.title, "Some Video");
    }

    #[test]
    fn test_extract_video_info_truncates_long_titles() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let long_title = "t".repeat(80);
        let line = format!("[download] Destination: /out/Chan - {} [dQw4w9WgXcQ].mp4", long_title);
        let info = m.extract_video_info(&line).unwrap();
        assert_eq!(info.title.len(), 80);
        assert_eq!(info.display_title.len(), 60);
        assert!(info.display_title.ends_with("..."));
    }

    #[test]
    fn test_destination_then_error_sets_error_flag() {
        let mut m = monitor(JobKind::ChannelDownloads);
        m.process_progress("{}", "[download] Destination: /out/Chan - Title [abc1234567].mp4");
        let info = m.last_snapshot().unwrap().video_info.clone();
        assert_eq!(info.channel, "Chan");
        assert_eq!(info.title, "Title");

        let snap = m.process_progress("{}", "ERROR: boom").unwrap();
        assert_eq!(snap.state, DownloadState::Error);
        assert!(m.has_error());
    }

    #[test]
    fn test_determine_state_table() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let cases = [
            ("[download] Destination: /o/x [abc1234567].f137.mp4", DownloadState::DownloadingVideo),
            ("[download] Destination: /o/x [abc1234567].f140.m4a", DownloadState::DownloadingAudio),
            ("[download] Destination: /o/x [abc1234567]/poster", DownloadState::DownloadingThumbnail),
            ("[download] Destination: /o/x [abc1234567].en.vtt", DownloadState::DownloadingSubtitles),
            ("[Merger] Merging formats into \"x\"", DownloadState::Merging),
            ("[Metadata] Adding metadata to x", DownloadState::Metadata),
            ("[MoveFiles] Moving file x", DownloadState::Processing),
            ("[FixupM3u8] Fixing MPEG-TS in MP4 container", DownloadState::ProcessingMetadata),
            ("Completed: x", DownloadState::Complete),
            ("[youtube] abc: Downloading webpage", DownloadState::Preparing),
            ("[info] x: Downloading subtitles: en", DownloadState::PreparingSubtitles),
        ];
        for (line, expected) in cases {
            assert_eq!(m.determine_state(line), Some(expected), "line: {}", line);
        }
        assert_eq!(m.determine_state("random noise"), None);
    }

    #[test]
    fn test_progress_token_while_initiating_switches_to_downloading() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let token = r#"{"percent":"5.0%","downloaded":"50","total":"1000","speed":"100","eta":"9"}"#;
        let snap = m.process_progress(token, token).unwrap();
        assert_eq!(snap.state, DownloadState::DownloadingVideo);
    }

    #[test]
    fn test_preparing_blanks_title_but_keeps_channel() {
        let mut m = monitor(JobKind::ChannelDownloads);
        m.process_progress("{}", "[download] Destination: /out/Chan - Title [dQw4w9WgXcQ].f137.mp4");
        let snap = m
            .process_progress("{}", "[youtube] bbbbbbbbbbb: Downloading webpage")
            .unwrap();
        assert_eq!(snap.state, DownloadState::Preparing);
        assert_eq!(snap.video_info.channel, "Chan");
        assert_eq!(snap.video_info.title, "");
        assert_eq!(snap.video_info.display_title, "");
    }

    #[test]
    fn test_speed_smoothing_dampens_jumps() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let t1 = r#"{"percent":"10.0%","downloaded":"100","total":"1000","speed":"1000","eta":"10"}"#;
        let t2 = r#"{"percent":"20.0%","downloaded":"200","total":"1000","speed":"2000","eta":"10"}"#;
        m.process_progress(t1, t1);
        let snap = m.process_progress(t2, t2).unwrap();
        // 1000 + 0.15 * (2000 - 1000)
        assert_eq!(snap.progress.speed_bytes_per_second, 1150.0);
    }

    #[test]
    fn test_eta_recomputed_when_absent() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let t = r#"{"percent":"50.0%","downloaded":"500","total":"1000","speed":"100","eta":"0"}"#;
        let snap = m.process_progress(t, t).unwrap();
        // (1000 - 500) / 100
        assert_eq!(snap.progress.eta_seconds, 5);
    }

    #[test]
    fn test_complete_snapshot_forces_final_metrics() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let t = r#"{"percent":"80.0%","downloaded":"800","total":"1000","speed":"100","eta":"2"}"#;
        m.process_progress(t, t);
        let snap = m.snapshot(Some(DownloadState::Complete));
        assert_eq!(snap.progress.percent, 100.0);
        assert_eq!(snap.progress.downloaded_bytes, 1000);
        assert_eq!(snap.progress.speed_bytes_per_second, 0.0);
        assert_eq!(snap.progress.eta_seconds, 0);
    }

    #[test]
    fn test_malformed_token_still_applies_raw_line() {
        let mut m = monitor(JobKind::ChannelDownloads);
        let snap = m.process_progress("{not json", "[Merger] Merging formats into \"x\"");
        assert_eq!(snap.unwrap().state, DownloadState::Merging);
    }

    #[test]
    fn test_snapshot_failed_sets_error_flag() {
        let mut m = monitor(JobKind::ChannelDownloads);
        m.snapshot(Some(DownloadState::Failed));
        assert!(m.has_error());
    }
}
