//! Download job execution: command assembly, staging, progress
//! supervision and outcome resolution.

pub mod classify;
pub mod command_builder;
pub mod executor;
pub mod grouper;
pub mod metadata;
pub mod monitor;
pub mod staging;

pub use command_builder::{build_download_args, CommandOptions, MatchFilterOptions, VideoCodec};
pub use executor::{Executor, JobOutcome, JobRequest, JobStatus, JobStore, LibraryRefresher, Notifier};
pub use grouper::{ChannelFilterConfig, ChannelSource, DownloadGroup, Grouper};
pub use metadata::{DownloadedVideo, InfoJsonResolver, VideoMetadataResolver};
pub use monitor::{DownloadState, JobKind, MonitorConfig, ProgressMonitor, ProgressSnapshot};
pub use staging::PathStager;
