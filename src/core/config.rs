use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Cached yt-dlp binary path
/// Read once at startup from YTDLP_BIN environment variable or defaults to "yt-dlp"
pub static YTDLP_BIN: Lazy<String> = Lazy::new(|| env::var("YTDLP_BIN").unwrap_or_else(|_| "yt-dlp".to_string()));

/// ffmpeg binary location passed to yt-dlp via --ffmpeg-location
pub static FFMPEG_PATH: Lazy<String> =
    Lazy::new(|| env::var("FFMPEG_PATH").unwrap_or_else(|_| "/usr/bin/ffmpeg".to_string()));

/// Path to cookies file for YouTube authentication
/// Read from YTDLP_COOKIES_FILE environment variable
/// Example: youtube_cookies.txt
pub static YTDLP_COOKIES_FILE: Lazy<Option<String>> = Lazy::new(|| env::var("YTDLP_COOKIES_FILE").ok());

/// Final destination base directory for downloaded videos
/// Read from OUTPUT_DIR environment variable
/// Supports tilde (~) expansion for home directory
pub static OUTPUT_DIR: Lazy<String> = Lazy::new(|| {
    let raw = env::var("OUTPUT_DIR").unwrap_or_else(|_| "~/videos".to_string());
    shellexpand::tilde(&raw).to_string()
});

/// External staging directory for in-flight downloads (e.g. a local disk
/// when OUTPUT_DIR is a network mount)
/// Read from STAGING_DIR environment variable
pub static STAGING_DIR: Lazy<String> =
    Lazy::new(|| env::var("STAGING_DIR").unwrap_or_else(|_| "/tmp/grabarr-downloads".to_string()));

/// Whether to stage downloads in STAGING_DIR instead of a hidden directory
/// under OUTPUT_DIR
/// Read from USE_EXTERNAL_STAGING environment variable, default false
pub static USE_EXTERNAL_STAGING: Lazy<bool> = Lazy::new(|| {
    env::var("USE_EXTERNAL_STAGING")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
});

/// Archive ledger path (the yt-dlp --download-archive file)
/// Read from ARCHIVE_PATH environment variable
pub static ARCHIVE_PATH: Lazy<String> =
    Lazy::new(|| env::var("ARCHIVE_PATH").unwrap_or_else(|_| "complete.list".to_string()));

/// Database file path
/// Read from DATABASE_PATH environment variable
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "database.sqlite".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "grabarr.log".to_string()));

/// Environment variable set on the spawned yt-dlp process so external log
/// collectors can correlate its output with the owning job
pub const JOB_ID_ENV_VAR: &str = "GRABARR_JOB_ID";

/// Watchdog configuration
pub mod watchdog {
    use super::Duration;

    /// No qualifying output for this long aborts the job (in minutes)
    pub const ACTIVITY_TIMEOUT_MINUTES: u64 = 30;

    /// Total runtime past this aborts the job (in hours)
    pub const ABSOLUTE_TIMEOUT_HOURS: u64 = 4;

    /// Interval between watchdog checks (in seconds)
    pub const CHECK_INTERVAL_SECS: u64 = 60;

    /// Grace period between SIGTERM and SIGKILL (in seconds)
    pub const TERMINATION_GRACE_SECS: u64 = 60;

    /// Activity timeout duration
    pub fn activity_timeout() -> Duration {
        Duration::from_secs(ACTIVITY_TIMEOUT_MINUTES * 60)
    }

    /// Absolute timeout duration
    pub fn absolute_timeout() -> Duration {
        Duration::from_secs(ABSOLUTE_TIMEOUT_HOURS * 3600)
    }

    /// Watchdog check interval duration
    pub fn check_interval() -> Duration {
        Duration::from_secs(CHECK_INTERVAL_SECS)
    }

    /// Termination grace period duration
    pub fn termination_grace() -> Duration {
        Duration::from_secs(TERMINATION_GRACE_SECS)
    }
}

/// Download invocation configuration
pub mod download {
    /// Socket timeout passed to yt-dlp (in seconds)
    pub const SOCKET_TIMEOUT_SECS: u64 = 30;

    /// Rate below which yt-dlp re-extracts video data (--throttled-rate)
    pub const THROTTLED_RATE: &str = "100K";

    /// Retry count for both --retries and --fragment-retries
    pub const RETRY_COUNT: u32 = 2;

    /// Default resolution cap when none is configured
    pub const DEFAULT_RESOLUTION: &str = "1080";
}

/// Stall detection configuration
pub mod stall {
    /// Whether stall detection is on by default
    pub const ENABLED: bool = false;

    /// Seconds without a useful progress sample before a slow download is
    /// considered stalled
    pub const WINDOW_SECS: u64 = 180;

    /// Speed below this (and below the throttled rate) counts as stalled
    pub const RATE_THRESHOLD: &str = "100K";
}
