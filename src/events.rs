//! Outbound progress events.
//!
//! The executor publishes every progress update and the final job summary to
//! a broadcast bus. Consumers (a websocket layer, a TUI) subscribe and fan
//! the payloads out; this crate only writes.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::download::monitor::ProgressSnapshot;

/// Error codes surfaced to operators on the job-exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobErrorCode {
    /// Authentication/bot challenge; downloads cannot proceed without
    /// operator action.
    #[serde(rename = "COOKIES_REQUIRED")]
    CookiesRequired,
    /// HTTP 403 pattern; cookies would likely resolve it.
    #[serde(rename = "COOKIES_RECOMMENDED")]
    CookiesRecommended,
}

/// Totals attached to the last message of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalSummary {
    pub total_downloaded: u64,
    pub total_skipped: u64,
    pub job_type: String,
    pub completed_at: String,
}

/// One message on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSnapshot>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub warning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<JobErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_summary: Option<FinalSummary>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub clear_previous_summary: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
}

impl ProgressMessage {
    /// Plain progress update.
    pub fn update(text: impl Into<String>, progress: Option<ProgressSnapshot>) -> Self {
        Self {
            text: text.into(),
            progress,
            error: false,
            warning: false,
            error_code: None,
            final_summary: None,
            clear_previous_summary: false,
            termination_reason: None,
        }
    }

    /// Error-flagged update (advisories and hard failures).
    pub fn error(text: impl Into<String>, progress: Option<ProgressSnapshot>, code: Option<JobErrorCode>) -> Self {
        Self {
            error: true,
            error_code: code,
            ..Self::update(text, progress)
        }
    }
}

/// Broadcast fan-out of [`ProgressMessage`]s. Send failures mean no
/// subscriber is currently listening, which is fine; messages are
/// best-effort.
#[derive(Debug, Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<ProgressMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.sender.subscribe()
    }

    pub fn publish(&self, message: ProgressMessage) {
        if self.sender.send(message).is_err() {
            log::trace!("no progress subscribers, message dropped");
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = MessageBus::default();
        bus.publish(ProgressMessage::update("hello", None));
    }

    #[tokio::test]
    async fn test_subscriber_receives_messages() {
        let bus = MessageBus::default();
        let mut rx = bus.subscribe();
        bus.publish(ProgressMessage::update("line", None));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.text, "line");
        assert!(!msg.error);
    }

    #[test]
    fn test_error_message_serialization_includes_code() {
        let msg = ProgressMessage::error("boom", None, Some(JobErrorCode::CookiesRecommended));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("COOKIES_RECOMMENDED"));
        assert!(json.contains("\"error\":true"));
        // Unset flags stay off the wire.
        assert!(!json.contains("warning"));
    }
}
