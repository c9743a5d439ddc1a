//! Process-wide budget for in-flight artifact buffers.
//!
//! A counting semaphore in KiB units. Every consumer draws from the same pool;
//! a reservation is returned when it is dropped.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const UNIT_BYTES: u64 = 1024;

#[derive(Debug, Clone)]
pub struct MemoryBudget {
    semaphore: Arc<Semaphore>,
    total_units: u32,
}

/// Held while a buffer is alive.
#[derive(Debug)]
pub struct MemoryReservation {
    _permit: OwnedSemaphorePermit,
    units: u32,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        u64::from(self.units) * UNIT_BYTES
    }
}

impl MemoryBudget {
    pub fn new(total_bytes: u64) -> Self {
        let units = (total_bytes / UNIT_BYTES).clamp(1, u64::from(u32::MAX));
        let total_units = u32::try_from(units).unwrap_or(u32::MAX);
        Self {
            semaphore: Arc::new(Semaphore::new(total_units as usize)),
            total_units,
        }
    }

    /// Units needed for `bytes`. Requests larger than the whole budget are
    /// capped to it so they can still run, alone.
    fn units_for(&self, bytes: u64) -> u32 {
        let units = bytes.div_ceil(UNIT_BYTES).max(1);
        u32::try_from(units)
            .unwrap_or(u32::MAX)
            .min(self.total_units)
    }

    /// Wait until `bytes` fit in the budget.
    pub async fn reserve(&self, bytes: u64) -> Result<MemoryReservation> {
        let units = self.units_for(bytes);
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(units)
            .await
            .map_err(|_| anyhow!("Memory budget closed"))?;
        Ok(MemoryReservation {
            _permit: permit,
            units,
        })
    }

    /// Reserve without waiting.
    pub fn try_reserve(&self, bytes: u64) -> Option<MemoryReservation> {
        let units = self.units_for(bytes);
        let permit = self.semaphore.clone().try_acquire_many_owned(units).ok()?;
        Some(MemoryReservation {
            _permit: permit,
            units,
        })
    }

    pub fn available_bytes(&self) -> u64 {
        self.semaphore.available_permits() as u64 * UNIT_BYTES
    }

    pub fn total_bytes(&self) -> u64 {
        u64::from(self.total_units) * UNIT_BYTES
    }
}
