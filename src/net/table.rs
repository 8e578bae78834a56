//! Fixed-capacity connection table indexed by descriptor value.
//!
//! Each slot moves through
//!
//! ```text
//!          accept                 readable              close
//!  Free ──────────▶ Idle ────────────────────▶ Busy ─────────────▶ Closing ──▶ Free
//!                    ▲  ◀──── completion ──────  │                    ▲
//!                    │        (re-armed)         │                    │
//!                    └───────────────────────────┴──── close ─────────┘
//! ```
//!
//! Only the main loop touches the table. Every access goes through a
//! [`ConnectionId`] whose generation must match the slot's; releasing a slot
//! bumps its generation, so stale ids held by timers or completions resolve
//! to nothing instead of to whichever connection reuses the descriptor.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    error::{Error, Result},
    net::traits::ConnectionId,
    timer::TimerId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    /// Registered, waiting for readiness.
    Idle,
    /// Oneshot consumed, a worker owns the pending input.
    Busy,
    /// Deregistered, resources being released.
    Closing,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    state: SlotState,
    value: Option<T>,
    timer: Option<TimerId>,
}

impl<T> Slot<T> {
    fn free() -> Self {
        Self {
            generation: 0,
            state: SlotState::Free,
            value: None,
            timer: None,
        }
    }
}

/// What a closing slot handed back.
#[derive(Debug)]
pub struct Released<T> {
    pub value: T,
    pub timer: Option<TimerId>,
}

#[derive(Debug)]
pub struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
    live: Arc<AtomicUsize>,
}

impl<T> ConnectionTable<T> {
    /// Preallocate `capacity` slots; descriptors `>= capacity` are refused.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("connection table capacity must be non-zero".into()));
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|e| {
            Error::Config(format!("cannot allocate {capacity} connection slots: {e}"))
        })?;
        slots.extend((0..capacity).map(|_| Slot::free()));

        Ok(Self {
            slots,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared view of the live-connection counter.
    pub fn live_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live)
    }

    /// Whether a connection on descriptor `slot` could be admitted.
    pub fn has_room(&self, slot: usize) -> bool {
        self.len() < self.capacity()
            && self
                .slots
                .get(slot)
                .is_some_and(|s| s.state == SlotState::Free)
    }

    /// Occupy `slot` (Free → Idle). `build` receives the id the new
    /// connection will be known by.
    pub fn insert<F>(&mut self, slot: usize, build: F) -> Option<ConnectionId>
    where
        F: FnOnce(ConnectionId) -> T,
    {
        if !self.has_room(slot) {
            return None;
        }
        let entry = &mut self.slots[slot];
        let id = ConnectionId::new(slot, entry.generation);
        entry.value = Some(build(id));
        entry.state = SlotState::Idle;
        entry.timer = None;
        self.live.fetch_add(1, Ordering::AcqRel);
        Some(id)
    }

    fn slot(&self, id: ConnectionId) -> Option<&Slot<T>> {
        self.slots
            .get(id.slot())
            .filter(|s| s.generation == id.generation() && s.state != SlotState::Free)
    }

    fn slot_mut(&mut self, id: ConnectionId) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(id.slot())
            .filter(|s| s.generation == id.generation() && s.state != SlotState::Free)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        self.slot(id)
            .filter(|s| s.state != SlotState::Closing)
            .and_then(|s| s.value.as_ref())
    }

    pub fn state(&self, id: ConnectionId) -> SlotState {
        self.slot(id).map_or(SlotState::Free, |s| s.state)
    }

    pub fn timer(&self, id: ConnectionId) -> Option<TimerId> {
        self.slot(id).and_then(|s| s.timer)
    }

    /// Attach a timer, returning the one it replaces.
    pub fn set_timer(&mut self, id: ConnectionId, timer: TimerId) -> Option<TimerId> {
        self.slot_mut(id).and_then(|s| s.timer.replace(timer))
    }

    /// Idle → Busy. Returns `false` for any other state or a stale id.
    pub fn mark_busy(&mut self, id: ConnectionId) -> bool {
        self.transition(id, SlotState::Idle, SlotState::Busy)
    }

    /// Busy → Idle. Returns `false` for any other state or a stale id.
    pub fn mark_idle(&mut self, id: ConnectionId) -> bool {
        self.transition(id, SlotState::Busy, SlotState::Idle)
    }

    fn transition(&mut self, id: ConnectionId, from: SlotState, to: SlotState) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.state == from => {
                slot.state = to;
                true
            }
            _ => false,
        }
    }

    /// Idle/Busy → Closing, handing back the value and timer.
    ///
    /// Returns `None` if the connection is already closing or gone, which
    /// makes closing idempotent.
    pub fn begin_close(&mut self, id: ConnectionId) -> Option<Released<T>> {
        let slot = self.slot_mut(id)?;
        if slot.state == SlotState::Closing {
            return None;
        }
        slot.state = SlotState::Closing;
        let value = slot.value.take()?;
        Some(Released {
            value,
            timer: slot.timer.take(),
        })
    }

    /// Closing → Free. Bumps the generation and the live counter.
    pub fn release(&mut self, id: ConnectionId) -> bool {
        match self.slot_mut(id) {
            Some(slot) if slot.state == SlotState::Closing => {
                slot.state = SlotState::Free;
                slot.generation = slot.generation.wrapping_add(1);
                slot.value = None;
                slot.timer = None;
                self.live.fetch_sub(1, Ordering::AcqRel);
                true
            }
            _ => false,
        }
    }

    /// Ids of every connection not already closing.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.state, SlotState::Idle | SlotState::Busy))
            .map(|(i, s)| ConnectionId::new(i, s.generation))
            .collect()
    }
}
