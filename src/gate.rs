use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ServiceError;

/// Bounds how many requests may use the resident model at once. Waiters are
/// admitted in arrival order.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    slots: Arc<Semaphore>,
}

impl AdmissionGate {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// One request at a time.
    pub fn single() -> Self {
        Self::new(1)
    }

    /// Waits for a slot. The permit can be moved into a blocking task so the
    /// slot stays taken until the work really finishes, even if the awaiting
    /// request is dropped.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit, ServiceError> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::Inference("admission gate closed".into()))
    }

    pub fn is_busy(&self) -> bool {
        self.slots.available_permits() == 0
    }
}
