//! Counting semaphore with a settable initial count

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

/// Credits that move between producers and consumers of a store
///
/// Acquired credits are consumed, not returned on drop: the other side of
/// the store hands them back with [`Credits::release`].
#[derive(Debug)]
pub struct Credits {
    sem: Semaphore,
}

impl Credits {
    /// Create with `initial` credits available
    #[must_use]
    pub fn new(initial: usize) -> Self {
        Self {
            sem: Semaphore::new(initial),
        }
    }

    /// Wait for one credit, or until `cancel` fires
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires first, `Reset` if the credits
    /// were closed while waiting
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(StoreError::Cancelled),
            permit = self.sem.acquire() => {
                permit.map_err(|_| StoreError::Reset)?.forget();
                Ok(())
            }
        }
    }

    /// Take one credit without waiting
    pub fn try_acquire(&self) -> bool {
        match self.sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Hand back `n` credits
    pub fn release(&self, n: usize) {
        self.sem.add_permits(n);
    }

    /// Credits currently available
    #[must_use]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Wake every waiter with `Reset`
    pub fn close(&self) {
        self.sem.close();
    }
}
