//! Argument-vector assembly for yt-dlp invocations.
//!
//! Pure functions only: declarative intent (resolution, codec preference,
//! audio mode, content filters, output routing) goes in, a `Vec<String>`
//! argv comes out. The caller appends URLs or a batch file and spawns.

use std::path::Path;

use crate::core::config;

/// Uploader with fallback to channel, then uploader_id. The `@` prefix of
/// uploader_id is stripped by `--replace-in-metadata`.
pub const CHANNEL_TEMPLATE: &str = "%(uploader,channel,uploader_id)s";

/// Per-video directory: `<channel> - <title> - <id>`.
pub const VIDEO_FOLDER_TEMPLATE: &str = "%(uploader,channel,uploader_id)s - %(title)s - %(id)s";

/// Video filename: `<channel> - <title>  [<id>].<ext>`. The double space
/// before the bracketed id is intentional and matched by the monitor's
/// destination parser.
pub const VIDEO_FILE_TEMPLATE: &str = "%(uploader,channel,uploader_id)s - %(title)s  [%(id)s].%(ext)s";

/// Structured progress token printed by yt-dlp on every progress line.
/// Field names are part of the monitor's parsing contract.
const PROGRESS_TEMPLATE: &str = concat!(
    r#"{"percent":"%(progress._percent_str)s","#,
    r#""downloaded":"%(progress.downloaded_bytes|0)s","#,
    r#""total":"%(progress.total_bytes|0)s","#,
    r#""speed":"%(progress.speed|0)s","#,
    r#""eta":"%(progress.eta|0)s"}"#
);

/// Preferred video codec for the format fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    H264,
    H265,
    #[default]
    Default,
}

impl VideoCodec {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "h264" | "avc" | "avc1" => VideoCodec::H264,
            "h265" | "hevc" | "hev" => VideoCodec::H265,
            _ => VideoCodec::Default,
        }
    }
}

/// Content filter criteria ANDed into the match filter.
#[derive(Debug, Clone, Default)]
pub struct MatchFilterOptions {
    pub min_duration_secs: Option<u64>,
    pub max_duration_secs: Option<u64>,
    /// Plain-text title substring requirement; escaped into a
    /// case-insensitive regex.
    pub title_filter: Option<String>,
    /// Age-limit ceiling derived from the configured maximum content
    /// rating. Videos with no age limit pass.
    pub max_age_limit: Option<u32>,
}

/// Declarative description of one download invocation.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub resolution: String,
    pub video_codec: VideoCodec,
    pub audio_only: bool,
    pub write_subtitles: bool,
    /// Bypass the archive ledger for this run. The executor backfills the
    /// ledger afterwards for videos that actually landed on disk.
    pub allow_redownload: bool,
    pub filter: MatchFilterOptions,
    /// Destination subfolder under the output base, applied to both
    /// output templates.
    pub subfolder: Option<String>,
    /// Grouper-provided template overriding the default video output path.
    pub output_template: Option<String>,
    /// Grouper-provided template overriding the default thumbnail path.
    pub thumbnail_template: Option<String>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            resolution: config::download::DEFAULT_RESOLUTION.to_string(),
            video_codec: VideoCodec::Default,
            audio_only: false,
            write_subtitles: false,
            allow_redownload: false,
            filter: MatchFilterOptions::default(),
            subfolder: None,
            output_template: None,
            thumbnail_template: None,
        }
    }
}

/// Format fallback chain: preferred-codec-at-resolution, then any mp4 at
/// resolution, then best mp4, then best. Audio-only short-circuits.
pub fn build_format_selector(resolution: &str, codec: VideoCodec, audio_only: bool) -> String {
    if audio_only {
        return "bestaudio[ext=m4a]/bestaudio/best".to_string();
    }

    let codec_preference = match codec {
        VideoCodec::H264 => Some("avc1"),
        VideoCodec::H265 => Some("hev"),
        VideoCodec::Default => None,
    };

    let mut chain = Vec::new();
    if let Some(vcodec) = codec_preference {
        chain.push(format!(
            "bestvideo[height<={res}][vcodec^={vcodec}][ext=mp4]+bestaudio[ext=m4a]",
            res = resolution,
            vcodec = vcodec
        ));
    }
    chain.push(format!(
        "bestvideo[height<={res}][ext=mp4]+bestaudio[ext=m4a]",
        res = resolution
    ));
    chain.push("best[ext=mp4]".to_string());
    chain.push("best".to_string());
    chain.join("/")
}

/// Escape a plain-text filter so it matches literally inside the match
/// filter's regular-expression operator.
pub fn escape_title_regex(title: &str) -> String {
    let mut escaped = String::with_capacity(title.len());
    for ch in title.chars() {
        if matches!(ch, '\\' | '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Assemble the match filter. The baseline always excludes subscriber-only
/// content, live streams and upcoming premieres; age/duration/title clauses
/// are ANDed in when configured. `<=?` lets videos with an unknown field
/// pass.
pub fn build_match_filter(filter: &MatchFilterOptions) -> String {
    let mut clauses = vec!["availability!=subscriber_only & !is_live & live_status!=is_upcoming".to_string()];

    if let Some(age_limit) = filter.max_age_limit {
        clauses.push(format!("age_limit<=?{}", age_limit));
    }
    if let Some(min) = filter.min_duration_secs {
        clauses.push(format!("duration>={}", min));
    }
    if let Some(max) = filter.max_duration_secs {
        // Inclusive of the final minute.
        clauses.push(format!("duration<={}", max + 59));
    }
    if let Some(title) = filter.title_filter.as_deref().filter(|t| !t.trim().is_empty()) {
        clauses.push(format!("title~=(?i){}", escape_title_regex(title.trim())));
    }

    clauses.join(" & ")
}

fn join_base(staging_base: &Path, subfolder: Option<&str>) -> String {
    let base = staging_base.to_string_lossy();
    match subfolder.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sub) => format!("{}/{}", base.trim_end_matches('/'), sub.trim_matches('/')),
        None => base.trim_end_matches('/').to_string(),
    }
}

/// Default per-video output template rooted at the staging base.
pub fn default_output_template(staging_base: &Path, subfolder: Option<&str>) -> String {
    format!(
        "{}/{}/{}/{}",
        join_base(staging_base, subfolder),
        CHANNEL_TEMPLATE,
        VIDEO_FOLDER_TEMPLATE,
        VIDEO_FILE_TEMPLATE
    )
}

/// Default thumbnail template. Same directory stem as the video file so
/// companion assets are locatable without a lookup.
pub fn default_thumbnail_template(staging_base: &Path, subfolder: Option<&str>) -> String {
    format!(
        "{}/{}/{}/poster",
        join_base(staging_base, subfolder),
        CHANNEL_TEMPLATE,
        VIDEO_FOLDER_TEMPLATE
    )
}

/// Build the full argument vector for one invocation. URLs (or a
/// `--batch-file`) are appended by the caller. All output paths route
/// through `staging_base`; routing into the final library happens in a
/// separate post-processing step after the job completes.
pub fn build_download_args(staging_base: &Path, options: &CommandOptions) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    if let Some(cookies) = config::YTDLP_COOKIES_FILE.as_deref() {
        args.push("--cookies".into());
        args.push(cookies.into());
    }

    args.extend([
        "-4".into(),
        "--ffmpeg-location".into(),
        config::FFMPEG_PATH.clone(),
        "--socket-timeout".into(),
        config::download::SOCKET_TIMEOUT_SECS.to_string(),
        "--throttled-rate".into(),
        config::download::THROTTLED_RATE.into(),
        "--retries".into(),
        config::download::RETRY_COUNT.to_string(),
        "--fragment-retries".into(),
        config::download::RETRY_COUNT.to_string(),
        "--newline".into(),
        "--progress".into(),
        "--progress-template".into(),
        PROGRESS_TEMPLATE.into(),
        "--output-na-placeholder".into(),
        "Unknown Channel".into(),
        "--replace-in-metadata".into(),
        "uploader_id".into(),
        "^@".into(),
        "".into(),
        "-f".into(),
        build_format_selector(&options.resolution, options.video_codec, options.audio_only),
        "--windows-filenames".into(),
        "--write-thumbnail".into(),
        "--convert-thumbnails".into(),
        "jpg".into(),
    ]);

    if !options.allow_redownload {
        args.push("--download-archive".into());
        args.push(config::ARCHIVE_PATH.clone());
    }

    args.extend([
        "--ignore-errors".into(),
        "--embed-metadata".into(),
        "--write-info-json".into(),
        "--no-write-playlist-metafiles".into(),
        "--extractor-args".into(),
        "youtubetab:tab=videos;sort=dd".into(),
    ]);

    if options.write_subtitles {
        args.extend(["--write-subs".into(), "--sub-langs".into(), "en.*,-live_chat".into()]);
    }

    args.push("--match-filter".into());
    args.push(build_match_filter(&options.filter));

    let subfolder = options.subfolder.as_deref();
    let output_template = options
        .output_template
        .clone()
        .unwrap_or_else(|| default_output_template(staging_base, subfolder));
    let thumbnail_template = options
        .thumbnail_template
        .clone()
        .unwrap_or_else(|| default_thumbnail_template(staging_base, subfolder));

    args.extend([
        "-o".into(),
        output_template,
        "--datebefore".into(),
        "now".into(),
        "-o".into(),
        format!("thumbnail:{}", thumbnail_template),
        // Playlist thumbnails are never wanted.
        "-o".into(),
        "pl_thumbnail:".into(),
    ]);

    args
}
