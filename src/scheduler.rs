//! Admission control over concurrent script runs.
//!
//! A single semaphore sized to `max_concurrent_executions`. Admission is
//! `try_acquire_owned`: the check and the increment are one operation, and
//! a full scheduler rejects instead of queueing. The returned permit is
//! the slot; dropping it is the release, so every exit path gives the slot
//! back exactly once.
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// One admitted execution slot. Released on drop.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct ExecutionScheduler {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl ExecutionScheduler {
    /// `max_concurrent` below 1 is raised to 1.
    pub fn new(max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    /// Grants a slot iff fewer than `max` runs are in flight.
    pub fn admit(&self) -> Option<Admission> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                debug!("Admitted execution ({}/{} active)", self.active(), self.max);
                Some(Admission { _permit: permit })
            }
            Err(_) => {
                warn!("Execution rejected: {} already running", self.max);
                None
            }
        }
    }

    /// Number of admitted runs not yet released.
    pub fn active(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}
