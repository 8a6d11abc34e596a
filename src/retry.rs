//! Two-level retry scheduling.
//!
//! The two dimensions are deliberately independent and must not be
//! conflated:
//!
//! - **RETRY** — a transient failure of the item a worker currently holds
//!   is retried immediately, up to `max_retries_timeout` times, with
//!   exponential backoff plus jitter. Never touches `loop_count`.
//! - **LOOP** — once RETRY is exhausted, the item's `loop_count` is
//!   incremented, its `attempt_count` resets, and it goes to the *end* of
//!   the queue so every other pending item gets a turn first. After
//!   `max_loops` passes the item is `Exhausted` and handed to the step's
//!   fallback path.
//!
//! Single-level immediate retry starves the rest of the queue behind one
//! broken item and hammers a single target; the round-robin loop spreads
//! repeat attempts across time and, because workers re-acquire from the
//! pool, across sessions.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::checkpoint::ItemRecord;

/// What to do with an item after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Retry in hand after the given backoff.
    RetryAfter(Duration),
    /// Requeue to the back of the queue for the next pass.
    Requeue,
    /// Loop budget spent; hand the item to the fallback path.
    Exhaust,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// RETRY budget within one loop pass (`max_retries_timeout`).
    pub max_attempts: u32,
    /// LOOP budget across passes (`max_loops`).
    pub max_loops: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_loops: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), cap)`, jittered ±10%.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter = 0.9 + fastrand::f64() * 0.2;
        raw.mul_f64(jitter)
    }

    /// Decide the fate of `item` after a retryable failure. `attempt_count`
    /// must already include the failed attempt.
    pub fn decide(&self, item: &ItemRecord) -> RetryAction {
        if item.attempt_count < self.max_attempts {
            RetryAction::RetryAfter(self.backoff_delay(item.attempt_count + 1))
        } else if item.loop_count + 1 < self.max_loops {
            RetryAction::Requeue
        } else {
            RetryAction::Exhaust
        }
    }
}

/// In-memory work queue for one step. Ownership of a claimed item is
/// exclusive until the worker completes, requeues, or exhausts it.
pub struct WorkQueue {
    inner: Mutex<VecDeque<ItemRecord>>,
}

impl WorkQueue {
    pub fn new(items: Vec<ItemRecord>) -> Self {
        Self {
            inner: Mutex::new(items.into()),
        }
    }

    /// Claim the next item. `None` means the queue is drained; requeued
    /// items were already pushed to the back, so a drained queue is the end
    /// of the step's work.
    pub fn claim(&self) -> Option<ItemRecord> {
        self.inner.lock().expect("queue lock").pop_front()
    }

    /// LOOP requeue: advance the loop counter, reset the per-pass attempt
    /// counter, and park the item behind everything currently waiting.
    pub fn requeue(&self, mut item: ItemRecord) -> ItemRecord {
        item.loop_count += 1;
        item.attempt_count = 0;
        item.state = crate::checkpoint::ItemState::Requeued;
        let snapshot = item.clone();
        self.inner.lock().expect("queue lock").push_back(item);
        snapshot
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ItemState;

    fn item(key: &str, attempts: u32, loops: u32) -> ItemRecord {
        let mut item = ItemRecord::pending(key);
        item.attempt_count = attempts;
        item.loop_count = loops;
        item
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            max_loops: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
        };
        // ±10% jitter bounds around 100ms, 200ms, 400ms, then the cap.
        let d1 = policy.backoff_delay(1);
        assert!(d1 >= Duration::from_millis(90) && d1 <= Duration::from_millis(110));
        let d2 = policy.backoff_delay(2);
        assert!(d2 >= Duration::from_millis(180) && d2 <= Duration::from_millis(220));
        let d3 = policy.backoff_delay(3);
        assert!(d3 >= Duration::from_millis(360) && d3 <= Duration::from_millis(440));
        let d4 = policy.backoff_delay(4);
        assert!(d4 >= Duration::from_millis(405) && d4 <= Duration::from_millis(495));
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let policy = RetryPolicy::default();
        let d = policy.backoff_delay(u32::MAX);
        assert!(d <= policy.max_delay.mul_f64(1.1));
    }

    #[test]
    fn decide_retries_until_attempts_spent() {
        let policy = RetryPolicy {
            max_attempts: 2,
            max_loops: 3,
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.decide(&item("k", 1, 0)),
            RetryAction::RetryAfter(_)
        ));
        assert_eq!(policy.decide(&item("k", 2, 0)), RetryAction::Requeue);
    }

    #[test]
    fn decide_exhausts_on_final_loop() {
        let policy = RetryPolicy {
            max_attempts: 2,
            max_loops: 3,
            ..RetryPolicy::default()
        };
        // loop_count counts completed passes; the pass underway is the
        // (loop_count + 1)-th. Passes 1 and 2 requeue, pass 3 exhausts.
        assert_eq!(policy.decide(&item("k", 2, 0)), RetryAction::Requeue);
        assert_eq!(policy.decide(&item("k", 2, 1)), RetryAction::Requeue);
        assert_eq!(policy.decide(&item("k", 2, 2)), RetryAction::Exhaust);
    }

    #[test]
    fn single_loop_policy_exhausts_without_requeue() {
        let policy = RetryPolicy {
            max_attempts: 1,
            max_loops: 1,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.decide(&item("k", 1, 0)), RetryAction::Exhaust);
    }

    #[test]
    fn claim_is_fifo_and_exclusive() {
        let queue = WorkQueue::new(vec![item("a", 0, 0), item("b", 0, 0)]);
        assert_eq!(queue.claim().unwrap().item_key, "a");
        assert_eq!(queue.claim().unwrap().item_key, "b");
        assert!(queue.claim().is_none());
    }

    #[test]
    fn requeue_goes_to_the_back_and_advances_loop() {
        let queue = WorkQueue::new(vec![item("a", 2, 0), item("b", 0, 0), item("c", 0, 0)]);
        let failed = queue.claim().unwrap();
        let requeued = queue.requeue(failed);
        assert_eq!(requeued.loop_count, 1);
        assert_eq!(requeued.attempt_count, 0);
        assert_eq!(requeued.state, ItemState::Requeued);

        // Round-robin: b and c are served before a comes around again.
        assert_eq!(queue.claim().unwrap().item_key, "b");
        assert_eq!(queue.claim().unwrap().item_key, "c");
        assert_eq!(queue.claim().unwrap().item_key, "a");
        assert!(queue.is_empty());
    }
}
