//! The FIFO queue of callers waiting for pool capacity.
//!
//! Waiters are woken with a one-shot signal rather than a condvar broadcast
//! so that exactly one waiter is ever told "try again" per release — this
//! avoids the thundering-herd re-check every other pooled-connection
//! implementation in the retrieval pack (and hyper-util's own legacy pool)
//! works hard to sidestep.

use std::collections::VecDeque;

use tokio::sync::oneshot;

/// One pending "a slot might be free now, try again" notification.
pub struct Waiter {
    tx: oneshot::Sender<()>,
}

/// The other half, returned to the caller that's waiting.
pub struct Waiting {
    rx: oneshot::Receiver<()>,
}

impl Waiting {
    /// Wait for a wake-up, or for `deadline` to pass first.
    pub async fn wait(self, deadline: Option<tokio::time::Instant>) -> bool {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.rx).await.is_ok(),
            None => self.rx.await.is_ok(),
        }
    }
}

/// A FIFO queue of waiters. Not thread-safe on its own — callers guard it
/// with the same lock that protects the pool's connection list, matching
/// how the pool always mutates both together.
#[derive(Default)]
pub struct WaitQueue {
    queue: VecDeque<Waiter>,
}

impl WaitQueue {
    pub fn new() -> WaitQueue {
        WaitQueue::default()
    }

    /// Register a new waiter at the back of the queue.
    pub fn push(&mut self) -> Waiting {
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(Waiter { tx });
        Waiting { rx }
    }

    /// Wake the oldest waiter, if any. A waiter whose receiver was already
    /// dropped (e.g. it gave up on timeout) is silently skipped in favor of
    /// the next one.
    pub fn wake_one(&mut self) {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
    }

    /// Wake every waiter, e.g. on pool shutdown.
    pub fn wake_all(&mut self) {
        for waiter in self.queue.drain(..) {
            let _ = waiter.tx.send(());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wake_one_only_signals_the_oldest_waiter() {
        let mut queue = WaitQueue::new();
        let first = queue.push();
        let second = queue.push();

        queue.wake_one();

        assert!(first.wait(None).await);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(10), second.wait(None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn deadline_expires_without_a_wake() {
        let mut queue = WaitQueue::new();
        let waiting = queue.push();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(10);
        assert!(!waiting.wait(Some(deadline)).await);
    }
}
