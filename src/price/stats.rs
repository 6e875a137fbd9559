//! Request/error statistics (spec supplement "request/error statistics
//! split"), tracked as atomics so they can be read without locking the
//! price engine's other state.

use std::sync::atomic::AtomicU64;

#[derive(Default)]
pub struct RequestStats {
    pub total_requests: AtomicU64,
    pub batch_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub rate_limit_hits: AtomicU64,
    pub network_errors: AtomicU64,
    pub successful_requests: AtomicU64,
}

#[derive(Default)]
pub struct ErrorStats {
    pub network_errors: AtomicU64,
    pub timeout_errors: AtomicU64,
    pub json_errors: AtomicU64,
}
