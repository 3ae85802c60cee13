//! Shared helpers: video id handling and URL normalization

use once_cell::sync::Lazy;
use regex::Regex;

/// Plausible YouTube video id: 10-12 chars of the id alphabet.
static VIDEO_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{10,12}$").unwrap());

/// Bracketed id suffix in generated file and directory names,
/// e.g. "Chan - Title [dQw4w9WgXcQ]".
static BRACKETED_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([A-Za-z0-9_-]{10,12})\]").unwrap());

/// Returns true if `id` looks like a YouTube video id.
pub fn is_plausible_video_id(id: &str) -> bool {
    VIDEO_ID.is_match(id)
}

/// Extract the bracketed video id from a generated file name or path,
/// e.g. "/out/Chan - Title [dQw4w9WgXcQ].f137.mp4" -> "dQw4w9WgXcQ".
pub fn extract_bracketed_id(name: &str) -> Option<String> {
    BRACKETED_ID.captures(name).map(|c| c[1].to_string())
}

/// Returns true if a directory name matches the generated
/// "<channel> - <title> - <id>" shape. Crash-recovery cleanup refuses to
/// delete anything that does not.
pub fn is_video_directory_name(name: &str) -> bool {
    if !name.contains(" - ") {
        return false;
    }
    name.rsplit(" - ").next().map(is_plausible_video_id).unwrap_or(false)
}

/// Normalize a watch URL to the canonical short-link form,
/// `https://youtu.be/<id>`. Anything that is not a YouTube watch URL
/// passes through unchanged.
pub fn normalize_video_url(raw: &str) -> String {
    if let Ok(parsed) = url::Url::parse(raw) {
        let is_watch = parsed.domain().is_some_and(|d| d.ends_with("youtube.com")) && parsed.path() == "/watch";
        if is_watch {
            if let Some((_, id)) = parsed.query_pairs().find(|(key, _)| key == "v") {
                return format!("https://youtu.be/{}", id);
            }
        }
    }
    raw.to_string()
}

/// Short-link URL for a video id.
pub fn video_url_for_id(id: &str) -> String {
    format!("https://youtu.be/{}", id)
}
