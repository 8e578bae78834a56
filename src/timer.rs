//! Sorted idle-timer list.
//!
//! Timers live in a [`Slab`] and are threaded into a doubly linked list kept
//! in ascending deadline order. Equal deadlines fire in insertion order.
//!
//! ```text
//!  head                                              tail
//!   │                                                 │
//!   ▼                                                 ▼
//! [t=3 C7] ⇄ [t=5 C2] ⇄ [t=5 C9] ⇄ [t=11 C4] ⇄ [t=15 C1]
//! ```
//!
//! Deadlines that only ever move forward (refresh on activity) land at the
//! tail, so `add` and `adjust` are O(1) in the common case and fall back to a
//! scan from the head otherwise.
//!
//! Every [`TimerId`] carries a stamp. Removing or adjusting with a stale id,
//! one whose timer already fired or was removed, is a no-op even if the
//! slab slot has since been reused.

use slab::Slab;
use std::time::Instant;

/// Handle to a timer inside a [`TimerList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    key: usize,
    stamp: u64,
}

#[derive(Debug)]
struct Node<T> {
    expire: Instant,
    stamp: u64,
    target: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Ascending list of deadlines, each carrying a `target` handed back when
/// the timer fires.
#[derive(Debug)]
pub struct TimerList<T> {
    nodes: Slab<Node<T>>,
    head: Option<usize>,
    tail: Option<usize>,
    next_stamp: u64,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Slab::with_capacity(capacity),
            head: None,
            tail: None,
            next_stamp: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Schedule `target` to fire at `expire`.
    pub fn add(&mut self, expire: Instant, target: T) -> TimerId {
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        let key = self.nodes.insert(Node {
            expire,
            stamp,
            target,
            prev: None,
            next: None,
        });
        self.link(key);

        TimerId { key, stamp }
    }

    /// Move a timer to a new deadline, repositioning it to keep the order.
    ///
    /// Returns `false` if `id` is stale.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) -> bool {
        if !self.contains(id) {
            return false;
        }

        let node = &mut self.nodes[id.key];
        node.expire = expire;
        let (prev, next) = (node.prev, node.next);

        let after_prev = prev.map_or(true, |p| self.nodes[p].expire <= expire);
        let before_next = next.map_or(true, |n| expire < self.nodes[n].expire);
        if after_prev && before_next {
            return true;
        }

        self.unlink(id.key);
        self.link(id.key);
        true
    }

    /// Cancel a timer, returning its target. Stale ids return `None`.
    pub fn remove(&mut self, id: TimerId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        self.unlink(id.key);
        Some(self.nodes.remove(id.key).target)
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.nodes
            .get(id.key)
            .is_some_and(|node| node.stamp == id.stamp)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.head.map(|key| self.nodes[key].expire)
    }

    /// Fire every timer whose deadline is at or before `now`, in deadline
    /// order. Each timer is unlinked and freed before `fire` sees its
    /// target; its id is already stale by then.
    pub fn tick<F>(&mut self, now: Instant, mut fire: F) -> usize
    where
        F: FnMut(T),
    {
        let mut fired = 0;
        while let Some(key) = self.head {
            if self.nodes[key].expire > now {
                break;
            }
            self.unlink(key);
            let node = self.nodes.remove(key);
            fire(node.target);
            fired += 1;
        }
        fired
    }

    /// Iterate over `(deadline, target)` in firing order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn link(&mut self, key: usize) {
        let expire = self.nodes[key].expire;

        let Some(tail) = self.tail else {
            self.head = Some(key);
            self.tail = Some(key);
            return;
        };

        if self.nodes[tail].expire <= expire {
            self.insert_after(tail, key);
            return;
        }

        // first node strictly later than `expire`; ties stay in insertion order
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if self.nodes[current].expire > expire {
                self.insert_before(current, key);
                return;
            }
            cursor = self.nodes[current].next;
        }
        unreachable!("tail comparison guarantees a later node exists");
    }

    fn insert_after(&mut self, anchor: usize, key: usize) {
        let next = self.nodes[anchor].next;
        self.nodes[key].prev = Some(anchor);
        self.nodes[key].next = next;
        self.nodes[anchor].next = Some(key);
        match next {
            Some(next) => self.nodes[next].prev = Some(key),
            None => self.tail = Some(key),
        }
    }

    fn insert_before(&mut self, anchor: usize, key: usize) {
        let prev = self.nodes[anchor].prev;
        self.nodes[key].next = Some(anchor);
        self.nodes[key].prev = prev;
        self.nodes[anchor].prev = Some(key);
        match prev {
            Some(prev) => self.nodes[prev].next = Some(key),
            None => self.head = Some(key),
        }
    }

    fn unlink(&mut self, key: usize) {
        let (prev, next) = {
            let node = &mut self.nodes[key];
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
    }
}

pub struct Iter<'a, T> {
    list: &'a TimerList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Instant, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.list.nodes[self.cursor?];
        self.cursor = node.next;
        Some((node.expire, &node.target))
    }
}
