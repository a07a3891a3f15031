use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide request id counter.
///
/// Shared by every client instance in the process, monotonically increasing,
/// never reset and never persisted. Ids are therefore unique within the
/// process lifetime only; they are not globally unique across processes.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh request id.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}
