//! The single-slot serialization queue for mutating requests.
//!
//! At most one mutating request is in flight between proxy and target at any
//! instant; the rest wait in FIFO order. The slot is represented by a fair
//! single-permit semaphore, and the guard releases on drop, so every exit
//! path out of the queued handler (including panics and aborted
//! connections) hands the slot to the next waiter.

use std::sync::Arc;

use tokio::sync::Semaphore;

pub struct RequestQueue {
	slot: Arc<Semaphore>,
}

/// Holding a `SlotGuard` is the license to talk to the target with a
/// mutating request. Dropping it admits the next waiter.
pub struct SlotGuard {
	_permit: tokio::sync::OwnedSemaphorePermit,
}

impl RequestQueue {
	pub fn new() -> Self {
		RequestQueue {
			slot: Arc::new(Semaphore::new(1)),
		}
	}

	/// Wait for the slot. Waiters are admitted strictly in arrival order.
	pub async fn admit(&self) -> SlotGuard {
		let permit = self
			.slot
			.clone()
			.acquire_owned()
			.await
			.expect("queue semaphore is never closed");
		SlotGuard { _permit: permit }
	}
}

impl Default for RequestQueue {
	fn default() -> Self {
		Self::new()
	}
}
