use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag aborting a download.
///
/// Clones observe the same flag. Sessions check it before every read, so a
/// cancelled session stops within one read timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
