//! grabarr: supervised execution of yt-dlp download jobs.
//!
//! The crate turns declarative download intent (channels, manual URLs,
//! quality and filter settings) into supervised yt-dlp invocations:
//! argument assembly, staging-directory routing, line-by-line progress
//! monitoring with stall detection, watchdog timeouts with graceful
//! termination, archive-ledger bookkeeping and crash recovery of
//! half-written downloads.

pub mod archive;
pub mod core;
pub mod download;
pub mod events;
pub mod storage;

pub use crate::archive::ArchiveLedger;
pub use crate::core::error::{AppError, AppResult};
pub use crate::download::{Executor, JobKind, JobOutcome, JobRequest, PathStager, ProgressMonitor};
pub use crate::events::{FinalSummary, JobErrorCode, MessageBus, ProgressMessage};
