use std::sync::atomic::{AtomicU64, Ordering};

/// Byte counter fed by the transfer engines. Implementations must not block;
/// rendering belongs to whoever owns the sink.
pub trait ProgressSink: Send + Sync {
    fn add(&self, bytes: u64);
    fn set_total(&self, total: u64);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn add(&self, _bytes: u64) {}
    fn set_total(&self, _total: u64) {}
}

/// Monotonic counter, mostly useful to assert transferred byte counts.
#[derive(Default)]
pub struct CountingProgress {
    transferred: AtomicU64,
    total: AtomicU64,
}

impl CountingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl ProgressSink for CountingProgress {
    fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }
}
