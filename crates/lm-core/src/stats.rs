//! Process-wide traffic statistics, surfaced by the admin API.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

pub static ACTIVE_CONNECTIONS: AtomicI32 = AtomicI32::new(0);

fn download_total() -> &'static Arc<AtomicU64> {
    static T: OnceLock<Arc<AtomicU64>> = OnceLock::new();
    T.get_or_init(|| Arc::new(AtomicU64::new(0)))
}

fn upload_total() -> &'static Arc<AtomicU64> {
    static T: OnceLock<Arc<AtomicU64>> = OnceLock::new();
    T.get_or_init(|| Arc::new(AtomicU64::new(0)))
}

/// Shared download counter handed to relays.
pub fn download_counter() -> Arc<AtomicU64> {
    download_total().clone()
}

/// Shared upload counter handed to relays.
pub fn upload_counter() -> Arc<AtomicU64> {
    upload_total().clone()
}

/// Snapshot for reporting.
pub fn snapshot() -> (i32, u64, u64) {
    (
        ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
        download_total().load(Ordering::Relaxed),
        upload_total().load(Ordering::Relaxed),
    )
}
