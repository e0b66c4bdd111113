//! # Application State Management
//!
//! State shared by every request handler and every streaming connection.
//!
//! ## Key Rust Concepts Used:
//! - **Arc<T>**: shared ownership across actix worker threads
//! - **Atomics**: lock-free counters; nothing here needs a mutex
//! - **RAII guards**: a [`SessionSlot`] frees its slot when dropped, so every
//!   exit path of a stream gives its slot back
//!
//! ## What's Shared:
//! - **Configuration**: read-only after startup
//! - **ASR client**: one HTTP connection pool and the recognition counters
//! - **Active streams**: how many client streams currently hold an upstream session

use crate::config::AppConfig;
use crate::transcription::AsrClient;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared application state, cloned into every actix worker.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    pub asr: Arc<AsrClient>,

    active_streams: Arc<AtomicUsize>,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, asr: AsrClient) -> Self {
        Self {
            config: Arc::new(config),
            asr: Arc::new(asr),
            active_streams: Arc::new(AtomicUsize::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Reserve a streaming slot, or `None` when the configured limit is reached.
    pub fn try_acquire_stream(&self) -> Option<SessionSlot> {
        let limit = self.config.performance.max_concurrent_sessions;
        self.active_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .ok()
            .map(|_| SessionSlot {
                counter: self.active_streams.clone(),
            })
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::Acquire)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// One reserved streaming slot. Released on drop.
#[derive(Debug)]
pub struct SessionSlot {
    counter: Arc<AtomicUsize>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
