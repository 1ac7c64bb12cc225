use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Minimal counters for operational visibility into the allocator.
#[derive(Clone, Default)]
pub struct Counters {
    pub activations: Arc<AtomicU64>,
    pub preemptions: Arc<AtomicU64>,
    pub releases: Arc<AtomicU64>,
    pub expirations: Arc<AtomicU64>,
    pub clears: Arc<AtomicU64>,

    pub rejected_already_active: Arc<AtomicU64>,
    pub rejected_no_tokens: Arc<AtomicU64>,
}
