//! Supervision of one yt-dlp invocation: spawn, stream, watchdog,
//! termination, and outcome resolution.
//!
//! The executor owns exactly one child process per [`Executor::run`] call.
//! A higher-level queue serializes submissions; `start_next_job` fires at
//! the end of every run regardless of outcome.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::archive::ArchiveLedger;
use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::core::utils::{extract_bracketed_id, is_video_directory_name, normalize_video_url};
use crate::download::classify::{is_bot_challenge, is_forbidden};
use crate::download::metadata::{DownloadedVideo, VideoMetadataResolver};
use crate::download::monitor::{DownloadState, JobKind, MonitorConfig, ProgressMonitor};
use crate::download::staging::PathStager;
use crate::events::{FinalSummary, JobErrorCode, MessageBus, ProgressMessage};
use crate::storage::db::{self, DbPool, VideoDownloadTrackingRow};

const COOKIES_RECOMMENDED_TEXT: &str = "Download failed: YouTube returned HTTP 403 (Forbidden). \
    Please set cookies in your Configuration or try different cookies to resolve this issue.";

const BOT_DETECTED_TEXT: &str = "Bot detection encountered. Please set cookies in your \
    Configuration or try different cookies to resolve this issue.";

/// Terminal status of a job as recorded in the job store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Complete,
    CompleteWithWarnings,
    Terminated,
    Killed,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Complete => "Complete",
            JobStatus::CompleteWithWarnings => "Complete with Warnings",
            JobStatus::Terminated => "Terminated",
            JobStatus::Killed => "Killed",
            JobStatus::Error => "Error",
        }
    }
}

/// Fields written back to the job store when a job concludes.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub output: String,
    pub notes: Option<String>,
    pub error_code: Option<JobErrorCode>,
    pub videos: Vec<DownloadedVideo>,
}

/// Resolved result of one invocation, also returned to the caller.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub output: String,
    pub notes: Option<String>,
    pub error_code: Option<JobErrorCode>,
    pub final_state: DownloadState,
    pub final_text: String,
    pub videos: Vec<DownloadedVideo>,
}

/// One download job submission.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: String,
    pub job_kind: JobKind,
    /// Known URL count for multi-URL manual jobs; pre-seeds the monitor's
    /// expected total.
    pub url_count: u64,
    /// Original URLs for manual jobs; used instead of the archive delta
    /// when resolving what the job produced.
    pub original_urls: Option<Vec<String>>,
    /// Ledger dedup was bypassed for this run; the executor backfills the
    /// archive for videos that landed on disk.
    pub allow_redownload: bool,
    /// Temporary batch file passed via `--batch-file`, deleted at job end.
    pub temp_batch_file: Option<PathBuf>,
    pub monitor_config: MonitorConfig,
}

impl JobRequest {
    pub fn new(job_id: impl Into<String>, job_kind: JobKind) -> Self {
        Self {
            job_id: job_id.into(),
            job_kind,
            url_count: 0,
            original_urls: None,
            allow_redownload: false,
            temp_batch_file: None,
            monitor_config: MonitorConfig::default(),
        }
    }
}

/// Persists job status updates and drives the job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> AppResult<()>;
    async fn start_next_job(&self);
}

/// Triggers a media-library rescan after a job. Best effort.
#[async_trait]
pub trait LibraryRefresher: Send + Sync {
    async fn refresh_library(&self) -> AppResult<()>;
}

/// Sends the completion notification for clean downloads.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_download_notification(
        &self,
        summary: &FinalSummary,
        videos: &[DownloadedVideo],
        channel_name: &str,
    ) -> AppResult<()>;
}

pub struct NoopJobStore;

#[async_trait]
impl JobStore for NoopJobStore {
    async fn update_job(&self, _job_id: &str, _update: JobUpdate) -> AppResult<()> {
        Ok(())
    }
    async fn start_next_job(&self) {}
}

pub struct NoopLibraryRefresher;

#[async_trait]
impl LibraryRefresher for NoopLibraryRefresher {
    async fn refresh_library(&self) -> AppResult<()> {
        Ok(())
    }
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send_download_notification(
        &self,
        _summary: &FinalSummary,
        _videos: &[DownloadedVideo],
        _channel_name: &str,
    ) -> AppResult<()> {
        Ok(())
    }
}

/// A resolver returning nothing, for callers that do not keep sidecars.
pub struct NoopMetadataResolver;

#[async_trait]
impl VideoMetadataResolver for NoopMetadataResolver {
    async fn resolve(&self, _video_urls: &[String]) -> Vec<DownloadedVideo> {
        Vec::new()
    }
}

/// Handle on the in-flight invocation. Shared between the run loop, the
/// watchdog and external termination requests.
struct JobContext {
    job_id: String,
    pid: u32,
    shutdown_reason: Mutex<Option<String>>,
}

/// Watchdog thresholds for one executor.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub activity_timeout: Duration,
    pub absolute_timeout: Duration,
    pub check_interval: Duration,
    pub termination_grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            activity_timeout: config::watchdog::activity_timeout(),
            absolute_timeout: config::watchdog::absolute_timeout(),
            check_interval: config::watchdog::check_interval(),
            termination_grace: config::watchdog::termination_grace(),
        }
    }
}

pub struct Executor {
    pool: DbPool,
    archive: ArchiveLedger,
    stager: PathStager,
    bus: MessageBus,
    metadata: Arc<dyn VideoMetadataResolver>,
    library: Arc<dyn LibraryRefresher>,
    notifier: Arc<dyn Notifier>,
    jobs: Arc<dyn JobStore>,
    ytdlp_bin: String,
    watchdog: WatchdogConfig,
    active: Arc<Mutex<Option<Arc<JobContext>>>>,
}

impl Executor {
    pub fn new(pool: DbPool, archive: ArchiveLedger, stager: PathStager, bus: MessageBus) -> Self {
        Self {
            pool,
            archive,
            stager,
            bus,
            metadata: Arc::new(NoopMetadataResolver),
            library: Arc::new(NoopLibraryRefresher),
            notifier: Arc::new(NoopNotifier),
            jobs: Arc::new(NoopJobStore),
            ytdlp_bin: config::YTDLP_BIN.clone(),
            watchdog: WatchdogConfig::default(),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_metadata_resolver(mut self, metadata: Arc<dyn VideoMetadataResolver>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_library_refresher(mut self, library: Arc<dyn LibraryRefresher>) -> Self {
        self.library = library;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn with_downloader_bin(mut self, bin: impl Into<String>) -> Self {
        self.ytdlp_bin = bin.into();
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Request graceful termination of the active job. Returns false (and
    /// does nothing) when no process is tracked.
    pub async fn terminate(&self, reason: &str) -> bool {
        let context = { self.active.lock().await.clone() };
        let Some(context) = context else {
            log::info!("Termination requested but no active download process, nothing to terminate");
            return false;
        };
        self.initiate_graceful_shutdown(&context, reason.to_string()).await;
        true
    }

    /// Graceful stop: record the reason, send SIGTERM, arm a force-kill
    /// timer. Only the first call per job takes effect.
    async fn initiate_graceful_shutdown(self: &Executor, context: &Arc<JobContext>, reason: String) {
        {
            let mut shutdown_reason = context.shutdown_reason.lock().await;
            if shutdown_reason.is_some() {
                return;
            }
            *shutdown_reason = Some(reason.clone());
        }

        log::info!("Initiating graceful shutdown of job {}: {}", context.job_id, reason);
        let pid = Pid::from_raw(context.pid as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            log::warn!("Error sending SIGTERM to {}: {}", context.pid, err);
        }

        // Force kill after the grace period, but only if the same job is
        // still the active one.
        let grace = self.watchdog.termination_grace;
        let armed_for = Arc::clone(context);
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_active = {
                let guard = active.lock().await;
                guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, &armed_for))
            };
            if still_active {
                log::warn!("Grace period expired for job {}, sending SIGKILL", armed_for.job_id);
                if let Err(err) = kill(Pid::from_raw(armed_for.pid as i32), Signal::SIGKILL) {
                    log::warn!("Error sending SIGKILL to {}: {}", armed_for.pid, err);
                }
            }
        });
    }

    /// Run one invocation to completion and resolve its outcome.
    pub async fn run(&self, args: Vec<String>, request: JobRequest) -> AppResult<JobOutcome> {
        let initial_count = self.archive.len()?;
        let mut monitor = ProgressMonitor::new(request.job_id.as_str(), request.job_kind, request.monitor_config.clone());
        if request.job_kind == JobKind::ManuallyAddedUrls && request.url_count > 0 {
            monitor.set_expected_total(request.url_count);
        }

        self.stager.reset_staging_directory().await?;

        log::info!("Running {} for {}", self.ytdlp_bin, request.job_kind.as_str());
        log::debug!("Command args: {:?}", args);

        let mut child = match Command::new(&self.ytdlp_bin)
            .args(&args)
            .env(config::JOB_ID_ENV_VAR, &request.job_id)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                log::error!("Failed to spawn downloader process: {}", err);
                return Err(err.into());
            }
        };

        let context = match child.id() {
            Some(pid) => Arc::new(JobContext {
                job_id: request.job_id.clone(),
                pid,
                shutdown_reason: Mutex::new(None),
            }),
            None => {
                return Err(AppError::Download("downloader process exited before supervision began".into()));
            }
        };
        {
            *self.active.lock().await = Some(Arc::clone(&context));
        }

        let mut initial = ProgressMessage::update(
            "Initiating download...",
            Some(monitor.snapshot(Some(DownloadState::Initiating))),
        );
        initial.clear_previous_summary = true;
        self.bus.publish(initial);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Download("downloader stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Download("downloader stderr not captured".into()))?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let start_time = Instant::now();
        let mut last_activity = Instant::now();
        let mut interval = tokio::time::interval(self.watchdog.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick fires immediately

        let mut partial_destinations: HashSet<PathBuf> = HashSet::new();
        let mut stderr_buffer = String::new();
        let mut bot_detected = false;
        let mut forbidden_detected = false;
        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut exit_status: Option<std::process::ExitStatus> = None;

        loop {
            tokio::select! {
                status = child.wait(), if exit_status.is_none() => {
                    exit_status = Some(status?);
                }
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                self.handle_stdout_line(
                                    line,
                                    &mut monitor,
                                    &mut partial_destinations,
                                    &mut forbidden_detected,
                                    &mut last_activity,
                                    &request.job_id,
                                );
                            }
                        }
                        Ok(None) => stdout_done = true,
                        Err(err) => {
                            log::warn!("Error reading downloader stdout: {}", err);
                            stdout_done = true;
                        }
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            self.handle_stderr_line(
                                &line,
                                &mut monitor,
                                &mut stderr_buffer,
                                &mut bot_detected,
                                &mut forbidden_detected,
                            );
                        }
                        Ok(None) => stderr_done = true,
                        Err(err) => {
                            log::warn!("Error reading downloader stderr: {}", err);
                            stderr_done = true;
                        }
                    }
                }
                _ = interval.tick() => {
                    let inactive = last_activity.elapsed();
                    if inactive > self.watchdog.activity_timeout {
                        self.initiate_graceful_shutdown(
                            &context,
                            format!("No download activity for {} minutes", inactive.as_secs() / 60),
                        )
                        .await;
                    } else if start_time.elapsed() > self.watchdog.absolute_timeout {
                        self.initiate_graceful_shutdown(
                            &context,
                            format!(
                                "Maximum runtime limit of {} hours reached",
                                self.watchdog.absolute_timeout.as_secs() / 3600
                            ),
                        )
                        .await;
                    }
                }
            }

            if exit_status.is_some() && stdout_done && stderr_done {
                break;
            }
        }

        let status = match exit_status {
            Some(status) => status,
            None => child.wait().await?,
        };

        // Clear the active handle before any async cleanup so a late
        // termination request becomes a no-op.
        let shutdown_reason = {
            *self.active.lock().await = None;
            context.shutdown_reason.lock().await.clone()
        };

        // The line readers can miss patterns split across chunks; re-check
        // the accumulated stderr.
        if !bot_detected && is_bot_challenge(&stderr_buffer) {
            bot_detected = true;
            log::info!("Bot challenge found in stderr buffer");
        }
        if !forbidden_detected && is_forbidden(&stderr_buffer) {
            forbidden_detected = true;
            log::info!("HTTP 403 detected in stderr buffer");
            self.emit_cookies_advisory(&mut monitor);
        }

        self.resolve_outcome(
            status,
            &request,
            &mut monitor,
            initial_count,
            partial_destinations,
            &stderr_buffer,
            bot_detected,
            forbidden_detected,
            shutdown_reason,
        )
        .await
    }

    fn handle_stdout_line(
        &self,
        line: &str,
        monitor: &mut ProgressMonitor,
        partial_destinations: &mut HashSet<PathBuf>,
        forbidden_detected: &mut bool,
        last_activity: &mut Instant,
        job_id: &str,
    ) {
        log::info!("{}", line);

        if line.contains("[download]")
            || line.contains("[Merger]")
            || line.contains("[MoveFiles]")
            || line.contains("[Metadata]")
            || line.contains("Downloading item")
        {
            *last_activity = Instant::now();
        }

        if let Some(dest) = line.strip_prefix("[download] Destination:") {
            let dest = dest.trim();
            if !dest.is_empty() {
                partial_destinations.insert(PathBuf::from(dest));
                if let Some(youtube_id) = extract_bracketed_id(dest) {
                    if let Err(err) = db::track_video_download(&self.pool, job_id, &youtube_id, dest) {
                        log::warn!("Failed to track download of {}: {}", youtube_id, err);
                    }
                }
            }
        }

        // State-only pass first, then the embedded token if the line
        // carries one.
        let mut structured = monitor.process_progress("{}", line);
        if let Some(json_start) = line.find('{') {
            if let Some(snapshot) = monitor.process_progress(&line[json_start..], line) {
                structured = Some(snapshot);
                *last_activity = Instant::now();
            }
        }

        let progress = structured.or_else(|| monitor.last_snapshot().cloned());
        self.bus.publish(ProgressMessage::update(line, progress));

        if !*forbidden_detected && is_forbidden(line) {
            *forbidden_detected = true;
            self.emit_cookies_advisory(monitor);
        }
    }

    fn handle_stderr_line(
        &self,
        line: &str,
        monitor: &mut ProgressMonitor,
        stderr_buffer: &mut String,
        bot_detected: &mut bool,
        forbidden_detected: &mut bool,
    ) {
        stderr_buffer.push_str(line);
        stderr_buffer.push('\n');
        log::warn!("{}", line);

        if !*forbidden_detected && is_forbidden(line) {
            *forbidden_detected = true;
            self.emit_cookies_advisory(monitor);
        }

        if !*bot_detected && is_bot_challenge(line) {
            *bot_detected = true;
            self.bus.publish(ProgressMessage::error(
                BOT_DETECTED_TEXT,
                Some(monitor.snapshot(Some(DownloadState::BotDetected))),
                None,
            ));
        }
    }

    /// Advisory published the moment a 403 is seen, distinct from the final
    /// outcome. Callers guard with the sticky forbidden flag so it fires at
    /// most once per job. Marks the monitor errored so exit code 0 cannot
    /// report success afterwards.
    fn emit_cookies_advisory(&self, monitor: &mut ProgressMonitor) {
        monitor.set_has_error();
        self.bus.publish(ProgressMessage::error(
            COOKIES_RECOMMENDED_TEXT,
            Some(monitor.snapshot(Some(DownloadState::Failed))),
            Some(JobErrorCode::CookiesRecommended),
        ));
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_outcome(
        &self,
        status: std::process::ExitStatus,
        request: &JobRequest,
        monitor: &mut ProgressMonitor,
        initial_count: usize,
        partial_destinations: HashSet<PathBuf>,
        stderr_buffer: &str,
        bot_detected: bool,
        forbidden_detected: bool,
        shutdown_reason: Option<String>,
    ) -> AppResult<JobOutcome> {
        use std::os::unix::process::ExitStatusExt;

        let urls_to_process: Vec<String> = match (&request.original_urls, request.job_kind) {
            (Some(urls), JobKind::ManuallyAddedUrls) => urls.iter().map(|u| normalize_video_url(u)).collect(),
            _ => self.archive.new_video_urls_since(initial_count)?,
        };
        let video_count = urls_to_process.len();
        let videos = self.metadata.resolve(&urls_to_process).await;

        // yt-dlp skipped its own archive writes for this run, so record
        // every video that actually landed on disk.
        if request.allow_redownload {
            for video in videos.iter().filter(|v| v.is_on_disk()) {
                if let Err(err) = self.archive.add(&video.youtube_id) {
                    log::warn!("Failed to record {} in archive: {}", video.youtube_id, err);
                }
            }
        }

        log::info!(
            "{} finished for job {} (code {:?}, signal {:?})",
            request.job_kind.as_str(),
            request.job_id,
            status.code(),
            status.signal()
        );

        let mut cleanup_performed = false;
        let stalled_snapshot = monitor.last_snapshot().filter(|s| s.stalled).cloned();

        let (job_status, output, notes, error_code, final_state, final_text) = if bot_detected {
            (
                JobStatus::Error,
                "Bot detection encountered. Please set cookies in your Configuration.".to_string(),
                Some("YouTube requires authentication. Enable cookies in Configuration to resolve this issue.".to_string()),
                Some(JobErrorCode::CookiesRequired),
                DownloadState::Failed,
                format!("Download failed: {}", BOT_DETECTED_TEXT),
            )
        } else if let Some(reason) = shutdown_reason.clone() {
            cleanup_partial_files(&partial_destinations).await;
            cleanup_tracked_downloads(&self.pool, db::in_progress_rows(&self.pool, &request.job_id)?).await;
            cleanup_performed = true;

            let completed = videos.len();
            log::info!("Job terminated: {}. Saved {} completed videos.", reason, completed);
            (
                JobStatus::Terminated,
                format!("{} video{} completed before termination", completed, plural(completed)),
                Some(reason.clone()),
                None,
                DownloadState::Terminated,
                format!(
                    "Download terminated: {}. {} video{} completed successfully.",
                    reason,
                    completed,
                    plural(completed)
                ),
            )
        } else if forbidden_detected {
            cleanup_partial_files(&partial_destinations).await;
            cleanup_performed = true;
            (
                JobStatus::Error,
                format!("{} videos. Error: YouTube returned HTTP 403 (Forbidden)", video_count),
                Some("YouTube denied access (HTTP 403). Configure cookies in Settings to resolve this issue.".to_string()),
                Some(JobErrorCode::CookiesRecommended),
                DownloadState::Failed,
                COOKIES_RECOMMENDED_TEXT.to_string(),
            )
        } else if !status.success() {
            cleanup_partial_files(&partial_destinations).await;
            cleanup_performed = true;

            let code_text = match status.code() {
                Some(code) => code.to_string(),
                None => "null".to_string(),
            };
            let job_status = if status.signal() == Some(libc_sigkill()) {
                JobStatus::Killed
            } else {
                JobStatus::Error
            };
            let notes = match &stalled_snapshot {
                Some(snapshot) => format!(
                    "Stall detected at {:.1}% ({} KiB/s)",
                    snapshot.progress.percent,
                    (snapshot.progress.speed_bytes_per_second / 1024.0).round() as i64
                ),
                None => match status.signal() {
                    Some(signal) => format!("Download failed (signal {})", signal_name(signal)),
                    None => format!("Download failed (exit {})", code_text),
                },
            };
            (
                job_status,
                format!("{} videos. Error: Command exited with code {}", video_count, code_text),
                Some(notes),
                None,
                DownloadState::Error,
                "Download failed".to_string(),
            )
        } else if monitor.has_error() {
            // Exit code 0 after an ERROR: line still fails the job.
            (
                JobStatus::Error,
                format!("{} videos.", video_count),
                None,
                None,
                DownloadState::Error,
                "Download failed".to_string(),
            )
        } else if !stderr_buffer.is_empty() {
            (
                JobStatus::CompleteWithWarnings,
                format!("{} videos.", video_count),
                None,
                None,
                DownloadState::Complete,
                String::new(),
            )
        } else {
            (
                JobStatus::Complete,
                format!("{} videos.", video_count),
                None,
                None,
                DownloadState::Complete,
                String::new(),
            )
        };

        if monitor.video_count().completed == 0 && video_count > 0 && final_state == DownloadState::Complete {
            monitor.force_completed_count(video_count as u64);
        }

        let final_text = if final_state == DownloadState::Complete {
            completion_text(monitor.video_count().completed, monitor.video_count().skipped, video_count)
        } else {
            final_text
        };

        let total_downloaded = if monitor.video_count().completed > 0 {
            monitor.video_count().completed
        } else {
            video_count as u64
        };
        let final_summary = FinalSummary {
            total_downloaded,
            total_skipped: monitor.video_count().skipped,
            job_type: request.job_kind.as_str().to_string(),
            completed_at: Utc::now().to_rfc3339(),
        };

        let final_snapshot = monitor.snapshot(Some(final_state));
        let mut final_message = ProgressMessage::update(final_text.clone(), Some(final_snapshot));
        final_message.final_summary = Some(final_summary.clone());
        if final_state == DownloadState::Terminated {
            // Terminated jobs are warnings, not full errors.
            final_message.warning = true;
            final_message.termination_reason = shutdown_reason.clone();
        } else if final_state != DownloadState::Complete {
            final_message.error = true;
            final_message.error_code = error_code;
        }
        self.bus.publish(final_message);

        if final_state == DownloadState::Complete && job_status == JobStatus::Complete {
            if let Err(err) = self
                .notifier
                .send_download_notification(&final_summary, &videos, monitor.current_channel_name())
                .await
            {
                log::error!("Failed to send notification: {}", err);
            }
        }

        if !cleanup_performed && !partial_destinations.is_empty() {
            cleanup_partial_files(&partial_destinations).await;
        }

        if let Some(batch_file) = &request.temp_batch_file {
            match tokio::fs::remove_file(batch_file).await {
                Ok(()) => log::info!("Cleaned up temporary batch file"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!("Failed to clean up temp batch file: {}", err),
            }
        }

        match db::delete_tracking_rows_for_job(&self.pool, &request.job_id) {
            Ok(removed) if removed > 0 => log::debug!("Removed {} tracking rows for job {}", removed, request.job_id),
            Ok(_) => {}
            Err(err) => log::warn!("Failed to remove tracking rows for job {}: {}", request.job_id, err),
        }

        let update = JobUpdate {
            status: job_status,
            output: output.clone(),
            notes: notes.clone(),
            error_code,
            videos: videos.clone(),
        };
        if let Err(err) = self.jobs.update_job(&request.job_id, update).await {
            log::warn!("Failed to update job {}: {}", request.job_id, err);
        }

        if let Err(err) = self.library.refresh_library().await {
            log::warn!("Failed to refresh library: {}", err);
        }
        self.jobs.start_next_job().await;

        Ok(JobOutcome {
            status: job_status,
            output,
            notes,
            error_code,
            final_state,
            final_text,
            videos,
        })
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

fn libc_sigkill() -> i32 {
    Signal::SIGKILL as i32
}

fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.to_string(),
        Err(_) => signal.to_string(),
    }
}

fn completion_text(completed: u64, skipped: u64, video_count: usize) -> String {
    let actual = if completed > 0 { completed } else { video_count as u64 };
    if actual > 0 && skipped > 0 {
        format!(
            "Download completed: {} new video{} downloaded, {} already existed",
            actual,
            plural(actual as usize),
            skipped
        )
    } else if actual > 0 {
        format!("Download completed: {} new video{} downloaded", actual, plural(actual as usize))
    } else if skipped > 0 {
        format!(
            "Download completed: All {} video{} already existed",
            skipped,
            plural(skipped as usize)
        )
    } else {
        "Download completed: No new videos to download".to_string()
    }
}

/// Remove `.part` and fragment siblings for every tracked destination.
/// Narrower than crash recovery: touches only files the failed run wrote.
pub async fn cleanup_partial_files(files: &HashSet<PathBuf>) {
    for file in files {
        let part_file = PathBuf::from(format!("{}.part", file.display()));
        match tokio::fs::remove_file(&part_file).await {
            Ok(()) => log::info!("Cleaned up partial file: {}", part_file.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("Error cleaning up {}: {}", part_file.display(), err),
        }

        let Some(dir) = file.parent() else { continue };
        let Some(stem) = file.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        let fragment_prefix = format!("{}.f", stem);

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("Error scanning {} for fragments: {}", dir.display(), err);
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&fragment_prefix) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => log::info!("Cleaned up fragment: {}", name),
                    Err(err) => log::warn!("Error cleaning up fragment {}: {}", name, err),
                }
            }
        }
    }
}

/// Remove the on-disk directories for tracked in-progress downloads, then
/// their rows. Directory names are verified against the expected
/// `source - title - externalId` shape before anything is deleted.
pub async fn cleanup_tracked_downloads(pool: &DbPool, rows: Vec<VideoDownloadTrackingRow>) {
    for row in rows {
        let dir = match Path::new(&row.file_path).parent() {
            Some(dir) => dir.to_path_buf(),
            None => {
                delete_row(pool, &row);
                continue;
            }
        };

        if !dir.exists() {
            delete_row(pool, &row);
            continue;
        }

        let name_matches = dir
            .file_name()
            .map(|name| is_video_directory_name(&name.to_string_lossy()))
            .unwrap_or(false);
        if !name_matches {
            log::warn!(
                "Skipping cleanup of {}: name does not look like a video directory",
                dir.display()
            );
            delete_row(pool, &row);
            continue;
        }

        match tokio::fs::read_dir(&dir).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    let result = if path.is_dir() {
                        tokio::fs::remove_dir_all(&path).await
                    } else {
                        tokio::fs::remove_file(&path).await
                    };
                    if let Err(err) = result {
                        log::warn!("Error removing {}: {}", path.display(), err);
                    }
                }
            }
            Err(err) => log::warn!("Error reading {}: {}", dir.display(), err),
        }
        if let Err(err) = tokio::fs::remove_dir(&dir).await {
            log::warn!("Error removing directory {}: {}", dir.display(), err);
        } else {
            log::info!("Removed in-progress download directory {}", dir.display());
        }

        delete_row(pool, &row);
    }
}

fn delete_row(pool: &DbPool, row: &VideoDownloadTrackingRow) {
    if let Err(err) = db::delete_tracking_row(pool, &row.job_id, &row.youtube_id) {
        log::warn!("Failed to delete tracking row for {}: {}", row.youtube_id, err);
    }
}

/// Startup crash recovery: clean up every in-progress download left behind
/// by a previous run. Returns the number of rows processed.
pub async fn recover_in_progress_downloads(pool: &DbPool) -> AppResult<usize> {
    let rows = db::all_in_progress_rows(pool)?;
    let count = rows.len();
    if count > 0 {
        log::info!("Recovering {} in-progress downloads from a previous run", count);
        cleanup_tracked_downloads(pool, rows).await;
    }
    Ok(count)
}
