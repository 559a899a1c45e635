//! Outbound event queue shared by a session's two loops.
//!
//! A FIFO with an explicit close sentinel: producers `post` events from any
//! task, the send loop `pick`s the next batch, and `close` makes the next
//! pick return with the exit flag set. Enqueue order is transmit order.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::event::Event;

struct QueueState {
    events: VecDeque<Event>,
    closed: bool,
}

/// Multi-producer, single-consumer FIFO with a close sentinel.
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event. Events posted after `close` are dropped, since the
    /// consumer is winding down.
    pub(crate) fn post(&self, ev: Event) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.events.push_back(ev);
        self.ready.notify_one();
    }

    /// Mark the queue closed. Idempotent and non-blocking.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        self.ready.notify_one();
    }

    /// Close and drop anything still queued. Used when the consumer dies
    /// without transmitting its backlog; queued events hold session
    /// handles, so they must not outlive the loops.
    pub(crate) fn discard(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.events.clear();
        self.ready.notify_one();
    }

    /// Wait for work, then drain everything queued so far.
    ///
    /// Returns the batch in enqueue order plus the exit flag. After close,
    /// any remaining events are drained together with `true`; later picks
    /// return an empty batch with `true`.
    pub(crate) async fn pick(&self) -> (Vec<Event>, bool) {
        loop {
            {
                let mut state = self.lock();
                if !state.events.is_empty() || state.closed {
                    let batch = state.events.drain(..).collect();
                    return (batch, state.closed);
                }
            }
            self.ready.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, EventResult};
    use std::time::Duration;
    use tokio::time::timeout;

    fn ev(msg_id: u32) -> Event {
        let mut ev = Event::new(EventKind::Send, None);
        ev.msg_id = msg_id;
        ev
    }

    #[tokio::test]
    async fn test_pick_preserves_fifo_order() {
        let queue = EventQueue::new();
        queue.post(ev(1));
        queue.post(ev(2));
        queue.post(ev(3));

        let (batch, will_exit) = queue.pick().await;
        let ids: Vec<u32> = batch.iter().map(|e| e.msg_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(!will_exit);
    }

    #[tokio::test]
    async fn test_close_drains_pending_then_signals_exit() {
        let queue = EventQueue::new();
        queue.post(ev(7));
        queue.close();

        let (batch, will_exit) = queue.pick().await;
        assert_eq!(batch.len(), 1);
        assert!(will_exit);

        let (batch, will_exit) = queue.pick().await;
        assert!(batch.is_empty());
        assert!(will_exit);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let queue = EventQueue::new();
        queue.close();
        queue.close();

        let (batch, will_exit) = queue.pick().await;
        assert!(batch.is_empty());
        assert!(will_exit);
    }

    #[tokio::test]
    async fn test_discard_clears_backlog() {
        let queue = EventQueue::new();
        queue.post(ev(1));
        queue.post(ev(2));
        queue.discard();

        let (batch, will_exit) = queue.pick().await;
        assert!(batch.is_empty());
        assert!(will_exit);
    }

    #[tokio::test]
    async fn test_post_after_close_is_dropped() {
        let queue = EventQueue::new();
        queue.close();
        queue.post(ev(1));

        let (batch, _) = queue.pick().await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_pick_blocks_until_posted() {
        let queue = std::sync::Arc::new(EventQueue::new());

        // Nothing queued: pick must not return yet.
        assert!(timeout(Duration::from_millis(50), queue.pick())
            .await
            .is_err());

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.post(ev(42));
        });

        let (batch, will_exit) = timeout(Duration::from_secs(1), queue.pick())
            .await
            .expect("pick should wake on post");
        assert_eq!(batch[0].msg_id, 42);
        assert_eq!(batch[0].result(), EventResult::Ok);
        assert!(!will_exit);
    }
}
