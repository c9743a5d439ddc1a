//! Consumer health signal feeding the batch-size policy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Batches kept in the rolling error-rate window.
const ERROR_WINDOW_BATCHES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HealthSignal {
    /// Flushed windows waiting for a consumer.
    pub lag: usize,
    /// Failed items over processed items across recent batches.
    pub error_rate: f64,
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    lag: AtomicUsize,
    recent: Mutex<VecDeque<(usize, usize)>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window_queued(&self) {
        self.lag.fetch_add(1, Ordering::SeqCst);
    }

    pub fn window_dequeued(&self) {
        let _ = self
            .lag
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |lag| lag.checked_sub(1));
    }

    /// Record the outcome of one processed batch.
    pub fn record_batch(&self, succeeded: usize, failed: usize) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == ERROR_WINDOW_BATCHES {
                recent.pop_front();
            }
            recent.push_back((succeeded, failed));
        }
    }

    pub fn signal(&self) -> HealthSignal {
        let error_rate = self
            .recent
            .lock()
            .map(|recent| {
                let (ok, failed) = recent
                    .iter()
                    .fold((0usize, 0usize), |(a, b), (s, f)| (a + s, b + f));
                let total = ok + failed;
                if total == 0 {
                    0.0
                } else {
                    failed as f64 / total as f64
                }
            })
            .unwrap_or(0.0);

        HealthSignal {
            lag: self.lag.load(Ordering::SeqCst),
            error_rate,
        }
    }
}
