//! End-to-end executor tests against fake downloader scripts.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use grabarr::core::error::AppResult;
use grabarr::download::executor::{Executor, JobRequest, JobStatus, JobStore, JobUpdate, WatchdogConfig};
use grabarr::download::monitor::DownloadState;
use grabarr::download::{DownloadedVideo, JobKind, PathStager, VideoMetadataResolver};
use grabarr::events::{JobErrorCode, MessageBus};
use grabarr::storage::db;
use grabarr::ArchiveLedger;

fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig {
        activity_timeout: Duration::from_millis(200),
        absolute_timeout: Duration::from_secs(60),
        check_interval: Duration::from_millis(50),
        termination_grace: Duration::from_secs(5),
    }
}

#[derive(Default)]
struct RecordingJobStore {
    updates: Mutex<Vec<(String, JobUpdate)>>,
    next_job_calls: Mutex<usize>,
}

#[async_trait]
impl JobStore for RecordingJobStore {
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> AppResult<()> {
        self.updates.lock().unwrap().push((job_id.to_string(), update));
        Ok(())
    }

    async fn start_next_job(&self) {
        *self.next_job_calls.lock().unwrap() += 1;
    }
}

/// Resolver pretending exactly one video landed on disk.
struct SingleVideoResolver;

#[async_trait]
impl VideoMetadataResolver for SingleVideoResolver {
    async fn resolve(&self, _video_urls: &[String]) -> Vec<DownloadedVideo> {
        vec![DownloadedVideo {
            youtube_id: "abc1234567".to_string(),
            channel_name: "Chan".to_string(),
            title: "Title".to_string(),
            duration: Some(120.0),
            description: None,
            original_date: None,
            channel_id: None,
            media_type: "video".to_string(),
            content_rating: None,
            file_path: PathBuf::from("/library/Chan/Chan - Title - abc1234567/Chan - Title  [abc1234567].mp4"),
            file_size: Some(1024),
        }]
    }
}

struct Harness {
    executor: Arc<Executor>,
    pool: db::DbPool,
    archive: ArchiveLedger,
    bus: MessageBus,
    store: Arc<RecordingJobStore>,
    _dir: TempDir,
}

fn harness(script: &Path) -> Harness {
    let dir = TempDir::new().unwrap();
    let pool = db::create_memory_pool().unwrap();
    let archive = ArchiveLedger::new(dir.path().join("complete.list"));
    let stager = PathStager::new(dir.path().join("library"), None, false);
    let bus = MessageBus::default();
    let store = Arc::new(RecordingJobStore::default());

    let executor = Executor::new(pool.clone(), archive.clone(), stager, bus.clone())
        .with_downloader_bin(script.to_string_lossy())
        .with_job_store(store.clone());

    Harness {
        executor: Arc::new(executor),
        pool,
        archive,
        bus,
        store,
        _dir: dir,
    }
}

#[tokio::test]
async fn clean_run_resolves_complete() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "fake-ytdlp",
        r#"echo "[youtube:tab] Playlist Chan - Videos: Downloading 1 items"
echo "[download] Downloading item 1 of 1"
echo "[download] 100% of 5MiB"
echo "youtube aaaaaaaaaaa" >> "$1""#,
    );
    let h = harness(&script);
    let mut rx = h.bus.subscribe();

    let outcome = h
        .executor
        .run(
            vec![h.archive.path().to_string_lossy().to_string()],
            JobRequest::new("job-1", JobKind::ChannelDownloads),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Complete);
    assert_eq!(outcome.final_state, DownloadState::Complete);
    assert_eq!(outcome.output, "1 videos.");
    assert!(outcome.final_text.starts_with("Download completed:"));

    // First message announces the job and clears prior summaries.
    let first = rx.recv().await.unwrap();
    assert_eq!(first.text, "Initiating download...");
    assert!(first.clear_previous_summary);

    // Exactly one message carries the final summary.
    let mut summaries = 0;
    while let Ok(msg) = rx.try_recv() {
        if msg.final_summary.is_some() {
            summaries += 1;
            assert_eq!(msg.final_summary.unwrap().total_downloaded, 1);
        }
    }
    assert_eq!(summaries, 1);

    let updates = h.store.updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].1.status, JobStatus::Complete);
    assert_eq!(*h.store.next_job_calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn stderr_warnings_downgrade_to_complete_with_warnings() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "fake-ytdlp",
        r#"echo "[download] Downloading item 1 of 1"
echo "[download] 100% of 5MiB"
echo "WARNING: some formats unavailable" >&2"#,
    );
    let h = harness(&script);

    let outcome = h
        .executor
        .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::CompleteWithWarnings);
    assert_eq!(outcome.final_state, DownloadState::Complete);
}

#[tokio::test]
async fn nonzero_exit_with_nothing_processed_is_an_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "fake-ytdlp", "exit 1");
    let h = harness(&script);

    let outcome = h
        .executor
        .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.final_state, DownloadState::Error);
    assert_eq!(outcome.output, "0 videos. Error: Command exited with code 1");
    assert_eq!(outcome.notes.as_deref(), Some("Download failed (exit 1)"));
    assert_eq!(outcome.error_code, None);
}

#[tokio::test]
async fn error_line_fails_job_despite_exit_code_zero() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "fake-ytdlp",
        r#"echo "[download] Destination: /out/Chan - Title [abc1234567].mp4"
echo "ERROR: boom"
exit 0"#,
    );
    let h = harness(&script);

    let outcome = h
        .executor
        .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
        .await
        .unwrap();

    assert_eq!(outcome.final_state, DownloadState::Error);
    assert_eq!(outcome.final_text, "Download failed");
}

#[tokio::test]
async fn http_403_resolves_cookies_recommended() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "fake-ytdlp",
        r#"echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2
exit 1"#,
    );
    let h = harness(&script);
    let mut rx = h.bus.subscribe();

    let outcome = h
        .executor
        .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.error_code, Some(JobErrorCode::CookiesRecommended));
    assert_eq!(outcome.final_state, DownloadState::Failed);
    assert!(outcome.output.contains("HTTP 403"));

    // An advisory error message was published before the final one.
    let mut advisory_seen = false;
    while let Ok(msg) = rx.try_recv() {
        if msg.error && msg.final_summary.is_none() {
            advisory_seen = true;
            assert_eq!(msg.error_code, Some(JobErrorCode::CookiesRecommended));
        }
    }
    assert!(advisory_seen);
}

#[tokio::test]
async fn stdout_403_error_line_publishes_the_advisory() {
    let dir = TempDir::new().unwrap();
    // The 403 arrives on stdout as an ERROR: line, the common shape.
    let script = write_script(
        &dir,
        "fake-ytdlp",
        r#"echo "ERROR: unable to download video data: HTTP Error 403: Forbidden"
exit 1"#,
    );
    let h = harness(&script);
    let mut rx = h.bus.subscribe();

    let outcome = h
        .executor
        .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.error_code, Some(JobErrorCode::CookiesRecommended));

    let mut advisory_seen = false;
    while let Ok(msg) = rx.try_recv() {
        if msg.error && msg.final_summary.is_none() {
            advisory_seen = true;
            assert_eq!(msg.error_code, Some(JobErrorCode::CookiesRecommended));
        }
    }
    assert!(advisory_seen);
}

#[tokio::test]
async fn bot_challenge_resolves_cookies_required() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "fake-ytdlp",
        r#"echo "ERROR: [youtube] abc: Sign in to confirm you're not a bot." >&2
exit 1"#,
    );
    let h = harness(&script);

    let outcome = h
        .executor
        .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Error);
    assert_eq!(outcome.error_code, Some(JobErrorCode::CookiesRequired));
    assert_eq!(outcome.final_state, DownloadState::Failed);
}

#[tokio::test]
async fn terminate_with_no_active_process_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "fake-ytdlp", "exit 0");
    let h = harness(&script);

    assert!(!h.executor.terminate("Cancelled by user").await);
    // No messages, no job updates.
    assert!(h.store.updates.lock().unwrap().is_empty());
    assert!(db::all_in_progress_rows(&h.pool).unwrap().is_empty());
}

#[tokio::test]
async fn explicit_terminate_resolves_terminated_and_clears_tracking_rows() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        &dir,
        "fake-ytdlp",
        r#"echo "[download] Destination: /out/Chan - Title [abc1234567].mp4"
sleep 30"#,
    );
    let h = harness(&script);
    let executor = h.executor.clone();

    let run = tokio::spawn({
        let executor = executor.clone();
        async move {
            executor
                .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(executor.terminate("Cancelled by user").await);

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Terminated);
    assert_eq!(outcome.final_state, DownloadState::Terminated);
    assert_eq!(outcome.notes.as_deref(), Some("Cancelled by user"));
    assert!(outcome.output.ends_with("completed before termination"));

    // Destination line created a tracking row; nothing survives the job.
    assert!(db::all_in_progress_rows(&h.pool).unwrap().is_empty());
}

#[tokio::test]
async fn terminated_job_reports_completed_video_count() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "fake-ytdlp", "sleep 30");
    let h = harness(&script);
    let executor = Arc::new(
        Executor::new(
            h.pool.clone(),
            h.archive.clone(),
            PathStager::new(dir.path().join("library"), None, false),
            h.bus.clone(),
        )
        .with_downloader_bin(script.to_string_lossy())
        .with_metadata_resolver(Arc::new(SingleVideoResolver)),
    );

    let run = tokio::spawn({
        let executor = executor.clone();
        async move {
            executor
                .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(executor.terminate("Cancelled by user").await);

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status, JobStatus::Terminated);
    assert_eq!(outcome.output, "1 video completed before termination");
    assert_eq!(
        outcome.final_text,
        "Download terminated: Cancelled by user. 1 video completed successfully."
    );
    assert_eq!(outcome.videos.len(), 1);
}

#[tokio::test]
async fn watchdog_inactivity_terminates_the_job() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "fake-ytdlp", "sleep 30");
    let h = harness(&script);
    let executor = Arc::new(
        Executor::new(
            h.pool.clone(),
            h.archive.clone(),
            PathStager::new(dir.path().join("library"), None, false),
            h.bus.clone(),
        )
        .with_downloader_bin(script.to_string_lossy())
        .with_watchdog(fast_watchdog()),
    );

    let outcome = executor
        .run(vec![], JobRequest::new("job-1", JobKind::ChannelDownloads))
        .await
        .unwrap();

    assert_eq!(outcome.status, JobStatus::Terminated);
    assert!(outcome.notes.unwrap().starts_with("No download activity"));
}

#[tokio::test]
async fn manual_urls_resolve_from_original_list_not_archive() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "fake-ytdlp", r#"echo "[download] 100% of 5MiB""#);
    let h = harness(&script);

    let mut request = JobRequest::new("job-1", JobKind::ManuallyAddedUrls);
    request.url_count = 2;
    request.original_urls = Some(vec![
        "https://www.youtube.com/watch?v=aaaaaaaaaaa&t=5".to_string(),
        "https://youtu.be/bbbbbbbbbbb".to_string(),
    ]);

    let outcome = h.executor.run(vec![], request).await.unwrap();

    // Two URLs counted even though the archive never changed.
    assert_eq!(outcome.output, "2 videos.");
    assert_eq!(outcome.status, JobStatus::Complete);
}

#[tokio::test]
async fn temp_batch_file_is_deleted_after_the_job() {
    let dir = TempDir::new().unwrap();
    let script = write_script(&dir, "fake-ytdlp", "exit 0");
    let h = harness(&script);

    let batch = dir.path().join("channels.txt");
    std::fs::write(&batch, "https://www.youtube.com/@chan\n").unwrap();

    let mut request = JobRequest::new("job-1", JobKind::ChannelDownloads);
    request.temp_batch_file = Some(batch.clone());

    h.executor.run(vec![], request).await.unwrap();
    assert!(!batch.exists());
}
