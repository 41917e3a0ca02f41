use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Check whether a shared cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: &Arc<AtomicBool>) -> bool {
    cancel.load(Ordering::SeqCst)
}

/// Worker count for per-file loops: available parallelism, capped so very
/// large file sets do not exhaust sockets or open handles.
#[must_use]
pub fn max_workers() -> usize {
    const WORKER_CAP: usize = 64;
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
        .min(WORKER_CAP)
}
