use crate::errors::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Observer polled by long-running operations (pack ingest, fetch
/// negotiation, pack writing). Implementations decide how to render
/// progress; returning `true` from `is_cancelled` makes the operation
/// raise [`Error::Cancelled`] and roll back.
pub trait ProgressMonitor {
    fn begin_task(&mut self, _title: &str, _total: Option<u64>) {}
    fn update(&mut self, _completed: u64) {}
    fn end_task(&mut self) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Raise [`Error::Cancelled`] if the monitor asked us to stop.
pub fn check_cancelled(monitor: &dyn ProgressMonitor) -> Result<()> {
    if monitor.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Discards all progress and never cancels.
#[derive(Default)]
pub struct NullProgress;

impl ProgressMonitor for NullProgress {}

/// Monitor backed by a shared flag, for callers that cancel from
/// another thread.
pub struct CancelFlagProgress {
    flag: Arc<AtomicBool>,
}

impl CancelFlagProgress {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }
}

impl ProgressMonitor for CancelFlagProgress {
    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
