use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::InstallerError;

/// Shared cancellation flag for one installation run.
///
/// Every suspension point in the pipeline (download chunks, extraction
/// entries, the certificate poll, the deployment await) checks the flag and
/// bails out with [`InstallerError::Cancelled`], so a cancel request is
/// honored cooperatively within one yield.
#[derive(Clone, Default)]
pub struct TaskControl {
    cancelled: Arc<AtomicBool>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the same control can drive a retry.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Bail out of `stage` if cancellation was requested.
pub fn ensure_not_cancelled(control: &TaskControl, stage: &str) -> Result<(), InstallerError> {
    if control.is_cancelled() {
        info!(stage, "cancellation requested, aborting stage");
        return Err(InstallerError::Cancelled);
    }
    Ok(())
}
