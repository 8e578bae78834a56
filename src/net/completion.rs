//! Worker → main loop hand-back.
//!
//! Workers never touch the connection table, the timer list or multiplexer
//! registrations. When a task finishes it posts a [`Completion`] to a
//! lock-free queue and wakes the main loop, which applies it: re-arm the
//! descriptor (Busy → Idle) or close the connection.

use std::sync::Arc;

use lockfree::queue::Queue;
use mio::{Interest, Waker};

use crate::net::traits::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Re-enable readiness notifications with this interest.
    Rearm(Interest),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub conn_id: ConnectionId,
    pub outcome: Outcome,
}

pub struct Completions {
    queue: Queue<Completion>,
    waker: Arc<Waker>,
}

impl Completions {
    pub fn new(waker: Arc<Waker>) -> Self {
        Self {
            queue: Queue::new(),
            waker,
        }
    }

    pub fn post(&self, conn_id: ConnectionId, outcome: Outcome) {
        self.queue.push(Completion { conn_id, outcome });
        if let Err(e) = self.waker.wake() {
            // the loop still drains the queue on its next wakeup
            tracing::warn!(conn = %conn_id, error = %e, "failed to wake main loop");
        }
    }

    pub fn pop(&self) -> Option<Completion> {
        self.queue.pop()
    }

    /// Guard that posts [`Outcome::Close`] unless explicitly completed,
    /// so a panicking task cannot leave its connection Busy forever.
    pub fn guard(self: &Arc<Self>, conn_id: ConnectionId) -> CompletionGuard {
        CompletionGuard {
            completions: Arc::clone(self),
            conn_id,
            done: false,
        }
    }
}

pub struct CompletionGuard {
    completions: Arc<Completions>,
    conn_id: ConnectionId,
    done: bool,
}

impl CompletionGuard {
    pub fn complete(mut self, outcome: Outcome) {
        self.done = true;
        self.completions.post(self.conn_id, outcome);
    }

    /// Finish without posting anything, for connections already closed by
    /// the main loop.
    pub fn abandon(mut self) {
        self.done = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.done {
            self.completions.post(self.conn_id, Outcome::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::Multiplexer;
    use mio::Token;
    use std::time::Duration;

    fn completions() -> (Multiplexer, Arc<Completions>) {
        let mux = Multiplexer::new(8).unwrap();
        let waker = Arc::new(mux.waker(Token(1)).unwrap());
        (mux, Arc::new(Completions::new(waker)))
    }

    #[test]
    fn test_post_wakes_loop() {
        let (mut mux, completions) = completions();
        let id = ConnectionId::new(9, 2);
        completions.post(id, Outcome::Rearm(Interest::WRITABLE));

        let mut ready = Vec::new();
        mux.wait(&mut ready, Some(Duration::from_millis(500))).unwrap();
        assert_eq!(ready.len(), 1);

        assert_eq!(
            completions.pop(),
            Some(Completion {
                conn_id: id,
                outcome: Outcome::Rearm(Interest::WRITABLE)
            })
        );
        assert_eq!(completions.pop(), None);
    }

    #[test]
    fn test_dropped_guard_posts_close() {
        let (_mux, completions) = completions();
        let id = ConnectionId::new(3, 0);
        drop(completions.guard(id));
        assert_eq!(completions.pop().map(|c| c.outcome), Some(Outcome::Close));
    }

    #[test]
    fn test_abandoned_guard_posts_nothing() {
        let (_mux, completions) = completions();
        completions.guard(ConnectionId::new(3, 0)).abandon();
        assert_eq!(completions.pop(), None);
    }

    #[test]
    fn test_panicking_task_still_closes() {
        let (_mux, completions) = completions();
        let id = ConnectionId::new(4, 1);
        let guard = completions.guard(id);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = guard;
            panic!("handler failure");
        }));
        assert_eq!(completions.pop().map(|c| c.conn_id), Some(id));
    }
}
