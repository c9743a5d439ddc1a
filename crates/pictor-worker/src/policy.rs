//! Batch sizing.
//!
//! The accumulator asks a [`BatchSizePolicy`] for the flush threshold on every
//! `add`, so the heuristic can change without touching the accumulator.

use pictor_core::models::ArtifactKind;

use crate::config::AccumulatorConfig;
use crate::health::HealthSignal;

pub trait BatchSizePolicy: Send + Sync {
    fn batch_size(&self, kind: ArtifactKind, signal: &HealthSignal) -> usize;
}

/// Per-kind constant sizes.
#[derive(Debug, Clone, Copy)]
pub struct FixedBatchSize {
    pub thumbnail: usize,
    pub cache: usize,
}

impl FixedBatchSize {
    pub fn from_config(config: &AccumulatorConfig) -> Self {
        Self {
            thumbnail: config.thumbnail_batch_size,
            cache: config.cache_batch_size,
        }
    }
}

impl BatchSizePolicy for FixedBatchSize {
    fn batch_size(&self, kind: ArtifactKind, _signal: &HealthSignal) -> usize {
        match kind {
            ArtifactKind::Thumbnail => self.thumbnail.max(1),
            ArtifactKind::Cache => self.cache.max(1),
        }
    }
}

/// Halves the per-kind size while consumers lag or fail too often.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveBatchSizePolicy {
    base: FixedBatchSize,
    unhealthy_lag: usize,
    unhealthy_error_rate: f64,
}

impl AdaptiveBatchSizePolicy {
    pub fn new(base: FixedBatchSize, unhealthy_lag: usize, unhealthy_error_rate: f64) -> Self {
        Self {
            base,
            unhealthy_lag,
            unhealthy_error_rate,
        }
    }

    pub fn is_unhealthy(&self, signal: &HealthSignal) -> bool {
        signal.lag >= self.unhealthy_lag || signal.error_rate >= self.unhealthy_error_rate
    }
}

impl BatchSizePolicy for AdaptiveBatchSizePolicy {
    fn batch_size(&self, kind: ArtifactKind, signal: &HealthSignal) -> usize {
        let base = self.base.batch_size(kind, signal);
        if self.is_unhealthy(signal) {
            (base / 2).max(1)
        } else {
            base
        }
    }
}
