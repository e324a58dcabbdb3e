//! Booking intake: a blocking FIFO with front-of-line requeue, delayed
//! retries and expiry skimming.
//!
//! Consumers block in `dequeue` until work is ready or the queue is closed.
//! Wakeups come from enqueue/close notifications; the timed wait is only a
//! resync point for the delay heap, so a simulated clock works as long as
//! producers keep notifying.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::Clock;
use crate::types::BookingId;

/// Queue entry handed to match workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedBooking {
    pub booking: BookingId,
    pub requested_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Outcome of a blocking dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItem {
    /// A booking ready for a match cycle.
    Ready(QueuedBooking),
    /// A booking whose deadline lapsed while queued; the caller marks it.
    Expired(QueuedBooking),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayedBooking {
    not_before_ms: u64,
    item: QueuedBooking,
}

impl Ord for DelayedBooking {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering to make BinaryHeap a min-heap by due time.
        other
            .not_before_ms
            .cmp(&self.not_before_ms)
            .then_with(|| other.item.requested_at_ms.cmp(&self.item.requested_at_ms))
    }
}

impl PartialOrd for DelayedBooking {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueuedBooking>,
    delayed: BinaryHeap<DelayedBooking>,
    closed: bool,
}

/// FIFO of pending bookings shared by all match workers.
///
/// Ordering: due delayed retries first, then ready entries front to back.
/// `requeue_front` puts a failed booking ahead of fresh arrivals; starvation
/// is bounded because the engine caps attempts per booking.
pub struct BookingQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    clock: Arc<dyn Clock>,
}

impl BookingQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            clock,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a booking. Returns false once the queue is closed.
    pub fn enqueue(&self, item: QueuedBooking) -> bool {
        let mut state = self.lock_state();
        if state.closed {
            return false;
        }
        state.ready.push_back(item);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Put a booking back at the front of the line.
    pub fn requeue_front(&self, item: QueuedBooking) -> bool {
        let mut state = self.lock_state();
        if state.closed {
            return false;
        }
        state.ready.push_front(item);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Schedule a booking to re-enter once `not_before_ms` is reached. Due
    /// retries outrank fresh arrivals.
    pub fn enqueue_delayed(&self, item: QueuedBooking, not_before_ms: u64) -> bool {
        let mut state = self.lock_state();
        if state.closed {
            return false;
        }
        state.delayed.push(DelayedBooking {
            not_before_ms,
            item,
        });
        drop(state);
        // The new entry may be due before anything a waiter planned for.
        self.available.notify_all();
        true
    }

    /// Blocking pop. Returns `None` only after `close()` with both the ready
    /// line and the delay heap drained of due work.
    pub fn dequeue(&self) -> Option<QueueItem> {
        let mut state = self.lock_state();
        loop {
            let now = self.clock.now_ms();
            if let Some(due) = state.delayed.peek().copied() {
                if due.not_before_ms <= now {
                    state.delayed.pop();
                    return Some(classify(due.item, now));
                }
            }
            if let Some(item) = state.ready.pop_front() {
                return Some(classify(item, now));
            }
            if state.closed {
                return None;
            }
            state = match state.delayed.peek().map(|due| due.not_before_ms) {
                Some(due_ms) => {
                    let wait = Duration::from_millis(due_ms.saturating_sub(now).max(1));
                    let (guard, _timeout) = self
                        .available
                        .wait_timeout(state, wait)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard
                }
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Stop accepting work and wake every blocked consumer.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Entries waiting, including not-yet-due retries.
    pub fn len(&self) -> usize {
        let state = self.lock_state();
        state.ready.len() + state.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn classify(item: QueuedBooking, now: u64) -> QueueItem {
    // The deadline instant itself counts as expired.
    if now >= item.expires_at_ms {
        QueueItem::Expired(item)
    } else {
        QueueItem::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{SimulatedClock, SystemClock};

    fn item(id: u64, requested_at_ms: u64, expires_at_ms: u64) -> QueuedBooking {
        QueuedBooking {
            booking: BookingId(id),
            requested_at_ms,
            expires_at_ms,
        }
    }

    fn queue_at(start_ms: u64) -> (Arc<SimulatedClock>, BookingQueue) {
        let clock = Arc::new(SimulatedClock::starting_at(start_ms));
        let queue = BookingQueue::new(Arc::clone(&clock) as Arc<dyn Clock>);
        (clock, queue)
    }

    #[test]
    fn dequeue_preserves_fifo_order() {
        let (_, queue) = queue_at(0);
        queue.enqueue(item(1, 10, 1_000_000));
        queue.enqueue(item(2, 20, 1_000_000));
        queue.enqueue(item(3, 30, 1_000_000));

        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(1, 10, 1_000_000))));
        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(2, 20, 1_000_000))));
        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(3, 30, 1_000_000))));
    }

    #[test]
    fn requeue_front_outranks_fresh_arrivals() {
        let (_, queue) = queue_at(0);
        queue.enqueue(item(1, 10, 1_000_000));
        queue.enqueue(item(2, 20, 1_000_000));
        queue.requeue_front(item(3, 5, 1_000_000));

        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(3, 5, 1_000_000))));
        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(1, 10, 1_000_000))));
    }

    #[test]
    fn expired_entries_are_flagged_not_dropped() {
        let (clock, queue) = queue_at(0);
        queue.enqueue(item(1, 0, 5_000));
        clock.advance(5_000);

        assert_eq!(queue.dequeue(), Some(QueueItem::Expired(item(1, 0, 5_000))));
    }

    #[test]
    fn delayed_entries_wait_for_their_due_time() {
        let (clock, queue) = queue_at(0);
        queue.enqueue_delayed(item(1, 0, 1_000_000), 4_000);
        queue.enqueue(item(2, 10, 1_000_000));

        // The delayed entry is not due; the ready entry goes first.
        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(2, 10, 1_000_000))));

        clock.advance(4_000);
        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(1, 0, 1_000_000))));
    }

    #[test]
    fn due_retries_outrank_ready_entries() {
        let (clock, queue) = queue_at(10_000);
        queue.enqueue(item(1, 10, 1_000_000));
        queue.enqueue_delayed(item(2, 5, 1_000_000), 10_000);
        clock.advance(1);

        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(2, 5, 1_000_000))));
        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(1, 10, 1_000_000))));
    }

    #[test]
    fn close_drains_ready_work_then_yields_none() {
        let (_, queue) = queue_at(0);
        queue.enqueue(item(1, 10, 1_000_000));
        assert!(!queue.is_closed());
        queue.close();

        assert!(queue.is_closed());
        assert!(!queue.enqueue(item(2, 20, 1_000_000)));
        assert!(!queue.requeue_front(item(3, 30, 1_000_000)));
        assert_eq!(queue.dequeue(), Some(QueueItem::Ready(item(1, 10, 1_000_000))));
        assert_eq!(queue.dequeue(), None);
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn blocked_consumer_wakes_on_enqueue() {
        let queue = Arc::new(BookingQueue::new(Arc::new(SystemClock)));

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue())
        };
        // Give the consumer a moment to block.
        std::thread::sleep(Duration::from_millis(20));
        queue.enqueue(item(1, 10, u64::MAX));

        assert_eq!(
            consumer.join().expect("consumer thread"),
            Some(QueueItem::Ready(item(1, 10, u64::MAX)))
        );
    }

    #[test]
    fn blocked_consumer_wakes_on_close() {
        let queue = Arc::new(BookingQueue::new(Arc::new(SystemClock)));

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();

        assert_eq!(consumer.join().expect("consumer thread"), None);
    }

    #[test]
    fn len_counts_ready_and_delayed_entries() {
        let (_, queue) = queue_at(0);
        assert!(queue.is_empty());
        queue.enqueue(item(1, 10, 1_000_000));
        queue.enqueue_delayed(item(2, 20, 1_000_000), 5_000);
        assert_eq!(queue.len(), 2);
    }
}
