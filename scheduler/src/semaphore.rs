//! Admission control for one (instance, model) pair.
//!
//! A [`Semaphore`] is a fixed-size FIFO gate. Its bound never changes; when
//! the safe concurrency for the pair moves, [`AdmissionSlot::resize`] installs
//! a fresh gate and retires the old one. Callers still queued on the retired
//! gate wake up and re-queue on the replacement, so they are admitted against
//! the new bound. Permits already granted by the old gate stay valid until
//! dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tracing::debug;

pub struct Semaphore {
    max_permits: usize,
    permits: Arc<tokio::sync::Semaphore>,
    waiting: AtomicUsize,
}

impl Semaphore {
    pub fn new(max_permits: usize) -> Self {
        Self {
            max_permits,
            permits: Arc::new(tokio::sync::Semaphore::new(max_permits)),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn permits_in_use(&self) -> usize {
        self.max_permits.saturating_sub(self.permits.available_permits())
    }

    /// Callers currently queued for a permit.
    pub fn queue_length(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.permits.is_closed()
    }

    fn retire(&self) {
        self.permits.close();
    }
}

/// Counts a caller as queued for as long as it is alive.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Right to run one request. Released when dropped.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    gate: Arc<Semaphore>,
}

impl AdmissionPermit {
    /// Bound of the gate that granted this permit.
    pub fn max_permits(&self) -> usize {
        self.gate.max_permits()
    }
}

/// The current gate for one (instance, model) pair.
pub struct AdmissionSlot {
    current: watch::Sender<Arc<Semaphore>>,
}

impl AdmissionSlot {
    pub fn new(max_permits: usize) -> Self {
        let (current, _) = watch::channel(Arc::new(Semaphore::new(max_permits)));
        Self { current }
    }

    pub fn current(&self) -> Arc<Semaphore> {
        self.current.borrow().clone()
    }

    pub fn max_permits(&self) -> usize {
        self.current().max_permits()
    }

    /// Permits held on the current gate.
    pub fn permits_in_use(&self) -> usize {
        self.current().permits_in_use()
    }

    pub fn queue_length(&self) -> usize {
        self.current().queue_length()
    }

    /// Install a gate with `max_permits` if the bound changed. Returns
    /// whether a replacement happened.
    pub fn resize(&self, max_permits: usize) -> bool {
        let old = self.current();
        if old.max_permits() == max_permits {
            return false;
        }
        debug!(from = old.max_permits(), to = max_permits, "replacing admission gate");
        self.current.send_replace(Arc::new(Semaphore::new(max_permits)));
        old.retire();
        true
    }

    /// Wait for a permit. Waiters are served in arrival order. Dropping the
    /// returned future leaves the queue.
    pub async fn acquire(&self) -> AdmissionPermit {
        loop {
            let gate = self.current();
            let acquired = {
                let _waiting = Waiting::enter(&gate.waiting);
                gate.permits.clone().acquire_owned().await
            };
            match acquired {
                Ok(permit) => return AdmissionPermit { _permit: permit, gate },
                // Retired while queued: re-queue on the replacement.
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn never_exceeds_bound() {
        let slot = Arc::new(AdmissionSlot::new(2));
        let a = slot.acquire().await;
        let _b = slot.acquire().await;
        assert_eq!(slot.permits_in_use(), 2);

        let waiter = tokio::spawn({
            let slot = slot.clone();
            async move { slot.acquire().await }
        });
        settle().await;
        assert_eq!(slot.queue_length(), 1);
        assert_eq!(slot.permits_in_use(), 2);

        drop(a);
        let _c = waiter.await.unwrap();
        assert_eq!(slot.permits_in_use(), 2);
        assert_eq!(slot.queue_length(), 0);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let slot = Arc::new(AdmissionSlot::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = slot.acquire().await;

        let mut handles = Vec::new();
        for i in 0..3 {
            let slot = slot.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _permit = slot.acquire().await;
                order.lock().await.push(i);
            }));
            settle().await;
        }
        assert_eq!(slot.queue_length(), 3);
        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_queue() {
        let slot = AdmissionSlot::new(1);
        let _held = slot.acquire().await;
        let timed_out = tokio::time::timeout(Duration::from_millis(10), slot.acquire()).await;
        assert!(timed_out.is_err());
        assert_eq!(slot.queue_length(), 0);
    }

    #[tokio::test]
    async fn resize_requeues_waiters_on_new_gate() {
        let slot = Arc::new(AdmissionSlot::new(1));
        let held = slot.acquire().await;
        let old = slot.current();

        let waiter = tokio::spawn({
            let slot = slot.clone();
            async move { slot.acquire().await }
        });
        settle().await;
        assert_eq!(old.queue_length(), 1);

        assert!(slot.resize(2));
        assert!(!slot.resize(2));
        let permit = waiter.await.unwrap();
        assert!(old.is_retired());
        assert_eq!(permit.max_permits(), 2);
        assert_eq!(slot.permits_in_use(), 1);
        drop(held);
        assert_eq!(slot.max_permits(), 2);
    }

    #[tokio::test]
    async fn permit_released_on_drop() {
        let slot = AdmissionSlot::new(1);
        {
            let _permit = slot.acquire().await;
            assert_eq!(slot.permits_in_use(), 1);
        }
        assert_eq!(slot.permits_in_use(), 0);
    }
}
