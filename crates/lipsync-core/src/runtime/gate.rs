use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::runtime::types::RuntimeError;

/// RAII guard for one execution slot.
///
/// Dropping it returns the slot to the gate, so a pipeline run that fails,
/// times out or panics still releases its slot.
pub struct GatePermit {
    /// Owned permit; dropping this struct releases it back to the semaphore.
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit").finish()
    }
}

/// Admission control for the scarce inference resource.
///
/// A counting semaphore of fixed `capacity`. Waiters are admitted in FIFO
/// order (tokio's semaphore is fair); there is no priority policy, so under
/// sustained load with a small capacity late arrivals simply wait longer.
///
/// Cloning is cheap and every clone shares the same counter.
#[derive(Debug, Clone)]
pub struct ExecutionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ExecutionGate {
    /// Create a gate with `capacity` slots. Callers validate `capacity >= 1`
    /// through [`crate::Config::validate`]; a zero-capacity gate never admits.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait until a slot is free and take it.
    ///
    /// Returns [`RuntimeError::Shutdown`] once the gate has been closed.
    pub async fn acquire(&self) -> Result<GatePermit, RuntimeError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| GatePermit { permit })
            .map_err(|_| RuntimeError::Shutdown)
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Result<GatePermit, RuntimeError> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map(|permit| GatePermit { permit })
            .map_err(|e| match e {
                tokio::sync::TryAcquireError::Closed => RuntimeError::Shutdown,
                tokio::sync::TryAcquireError::NoPermits => RuntimeError::GateBusy,
            })
    }

    /// Like [`Self::acquire`] but gives up after `limit`.
    pub async fn acquire_with_timeout(&self, limit: Duration) -> Result<GatePermit, RuntimeError> {
        tokio::time::timeout(limit, self.acquire())
            .await
            .map_err(|_| RuntimeError::GateTimeout)?
    }

    /// Stop admitting. Pending and future `acquire` calls fail with `Shutdown`;
    /// permits already handed out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}
