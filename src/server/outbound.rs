//! Bounded outbound event queue
//!
//! All server→client events funnel through one of these per connection; a
//! single writer task drains it, preserving enqueue order. Under pressure
//! the oldest non-critical events (speech notices, keepalive chatter) are
//! dropped first; if the queue is full of critical events the connection is
//! torn down with a backpressure diagnostic.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::protocol::{EventErrorKind, ServerMessage};

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// Queue is saturated with critical events.
    Overflow,
    /// Connection already closed.
    Closed,
}

struct QueueState {
    items: VecDeque<ServerMessage>,
    closed: bool,
}

pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState { items: VecDeque::new(), closed: false }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an event for the writer. Never blocks.
    pub fn push(&self, message: ServerMessage) -> Result<(), EnqueueError> {
        let mut state = self.state.lock().expect("outbound queue poisoned");
        if state.closed {
            return Err(EnqueueError::Closed);
        }

        if state.items.len() >= self.capacity {
            match state.items.iter().position(|m| !m.is_critical()) {
                Some(pos) => {
                    let dropped = state.items.remove(pos);
                    debug!("outbound queue full, dropped non-critical event: {dropped:?}");
                }
                // A non-critical arrival is itself droppable.
                None if !message.is_critical() => {
                    debug!("outbound queue full, dropped incoming event: {message:?}");
                    return Ok(());
                }
                None => return Err(EnqueueError::Overflow),
            }
        }

        state.items.push_back(message);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Push an event, escalating overflow to connection teardown.
    pub fn push_or_fail(&self, message: ServerMessage) {
        if let Err(EnqueueError::Overflow) = self.push(message) {
            warn!("outbound queue saturated with critical events, closing connection");
            self.fail(EventErrorKind::Backpressure, "outbound queue overflow");
        }
    }

    /// Emit a final error event past the capacity bound and close the queue.
    pub fn fail(&self, kind: EventErrorKind, message: &str) {
        let mut state = self.state.lock().expect("outbound queue poisoned");
        if state.closed {
            return;
        }
        state.items.push_back(ServerMessage::error(kind, message));
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Close the queue; the writer drains what is already buffered, then
    /// observes the close.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("outbound queue poisoned");
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("outbound queue poisoned").closed
    }

    /// Next event in enqueue order; `None` once closed and drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("outbound queue poisoned");
                if let Some(message) = state.items.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

}
