//! Process-wide bound on simultaneous language-model calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{CallError, CallResult, ConfigError};

/// Counting semaphore shared by every worker that talks to the model.
///
/// Cloning yields another handle to the same pool. Construct one per process
/// and pass it to each call site.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent_calls: usize,
}

/// Capability to run one model call. The slot goes back to the pool when this
/// value is dropped, whichever way the guarded call exits.
#[derive(Debug)]
pub struct CallSlot {
    _permit: OwnedSemaphorePermit,
}

impl CallSlot {
    /// Return the slot now rather than at end of scope.
    pub fn release(self) {}
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent_calls: usize) -> Result<Self, ConfigError> {
        if max_concurrent_calls == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_calls must be greater than zero",
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_calls)),
            max_concurrent_calls,
        })
    }

    /// Wait up to `timeout` for a slot. `None` means none freed up in time.
    pub async fn acquire(&self, timeout: Duration) -> Option<CallSlot> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => {
                debug!(
                    active = self.active_calls(),
                    max = self.max_concurrent_calls,
                    "Acquired model call slot"
                );
                Some(CallSlot { _permit: permit })
            }
            // Closed semaphore: never happens, we never call close().
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(?timeout, "Timed out waiting for model call slot");
                None
            }
        }
    }

    pub fn try_acquire(&self) -> Option<CallSlot> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| CallSlot { _permit: permit })
    }

    /// Run `call` while holding a slot, failing with `SlotUnavailable` if none
    /// can be had within `timeout`.
    pub async fn run<F, Fut, T>(&self, timeout: Duration, call: F) -> CallResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        let _slot = self
            .acquire(timeout)
            .await
            .ok_or(CallError::SlotUnavailable { waited: timeout })?;
        call().await
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn active_calls(&self) -> usize {
        self.max_concurrent_calls - self.available_slots()
    }
}
