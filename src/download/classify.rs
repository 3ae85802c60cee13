//! Classification of yt-dlp failure output.
//!
//! Two kinds of checks live here: sticky per-line conditions the executor
//! watches for while the process runs (bot challenge, HTTP 403), and a
//! one-shot classifier applied to accumulated stderr after exit.

/// Conditions detected on live output and held sticky for the rest of the
/// job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCondition {
    /// "Sign in to confirm you're not a bot" challenge. Fatal; nothing
    /// downloads without operator-supplied cookies.
    BotChallenge,
    /// HTTP 403 responses. Often recoverable with cookies, so this is an
    /// advisory rather than an immediate failure.
    Forbidden,
}

/// Broad failure categories derived from accumulated stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    BotChallenge,
    Forbidden,
    ChannelNotFound,
    NetworkError,
    Unknown,
}

/// Whether a line carries the YouTube bot challenge. Both phrases must be
/// present; "Sign in to confirm your age" must not match.
pub fn is_bot_challenge(text: &str) -> bool {
    text.contains("Sign in to confirm") && text.contains("not a bot")
}

/// Whether a line indicates an HTTP 403 response.
pub fn is_forbidden(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("http error 403") || lower.contains("403: forbidden")
}

/// Detect a sticky stream condition on one output line. Bot challenges
/// take priority over 403s when a line somehow carries both.
pub fn stream_condition(line: &str) -> Option<StreamCondition> {
    if is_bot_challenge(line) {
        return Some(StreamCondition::BotChallenge);
    }
    if is_forbidden(line) {
        return Some(StreamCondition::Forbidden);
    }
    None
}

/// Classify accumulated stderr after the process exits.
pub fn classify_failure(stderr: &str) -> FailureKind {
    if is_bot_challenge(stderr) {
        return FailureKind::BotChallenge;
    }
    if is_forbidden(stderr) {
        return FailureKind::Forbidden;
    }

    let lower = stderr.to_lowercase();

    if lower.contains("this channel does not exist")
        || lower.contains("unable to find channel")
        || lower.contains("404: not found")
    {
        return FailureKind::ChannelNotFound;
    }

    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("unable to connect")
        || lower.contains("failed to connect")
        || lower.contains("connection reset")
        || lower.contains("temporary failure in name resolution")
        || lower.contains("getaddrinfo failed")
    {
        return FailureKind::NetworkError;
    }

    FailureKind::Unknown
}
