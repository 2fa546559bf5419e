//! Counting gate bounding the number of in-flight operations.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::bail;
use crate::concurrency::cancel::CancelRx;
use crate::error::{ConveyorResult, ErrorKind};

/// A semaphore with a fixed number of slots.
///
/// Unlike a queue capacity, this bounds how many operations run at the same time regardless of
/// how many are waiting. Slots are handed out as [`SemaphorePermit`] guards and returned when the
/// guard is dropped, so every exit path releases exactly once.
#[derive(Debug, Clone)]
pub struct BoundedSemaphore {
    inner: Arc<Semaphore>,
    capacity: usize,
}

/// A held semaphore slot, released on drop.
#[derive(Debug)]
pub struct SemaphorePermit {
    _permit: OwnedSemaphorePermit,
}

impl BoundedSemaphore {
    /// Creates a semaphore with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a free slot.
    ///
    /// Fails with [`ErrorKind::Cancelled`] if cancellation fires first, in which case no slot is
    /// held.
    pub async fn acquire(&self, cancel_rx: &CancelRx) -> ConveyorResult<SemaphorePermit> {
        if cancel_rx.is_cancelled() {
            bail!(ErrorKind::Cancelled, "Semaphore acquire was cancelled");
        }

        tokio::select! {
            biased;

            _ = cancel_rx.wait_for_cancel() => {
                bail!(ErrorKind::Cancelled, "Semaphore acquire was cancelled");
            }
            permit = self.inner.clone().acquire_owned() => match permit {
                Ok(permit) => Ok(SemaphorePermit { _permit: permit }),
                Err(_) => bail!(ErrorKind::InvalidState, "Semaphore was closed"),
            },
        }
    }

    /// Takes a free slot without waiting.
    pub fn try_acquire(&self) -> Option<SemaphorePermit> {
        match self.inner.clone().try_acquire_owned() {
            Ok(permit) => Some(SemaphorePermit { _permit: permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
