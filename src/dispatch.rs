//! Per-kind, per-slot dispatch state.
//!
//! Every `(Slot, DirectiveKind)` pair owns an independent state machine:
//!
//! ```text
//!   Idle ──block seen──▶ PendingDebounce(key) ──timer──▶ Dispatched(key) ──done──▶ Idle
//!                          │       ▲
//!                          └───────┘ different key: restart timer
//! ```
//!
//! A record also remembers every key it has handed to a handler.  Those keys
//! are never handed out again for the same slot, so a block that stays in the
//! buffer after its handler finished is not re-run on the next scan.

use std::collections::{HashMap, HashSet};

use crate::types::{Directive, DirectiveKind, MessageId};

/// One run of one message.
///
/// A regenerated message keeps its id but gets a new generation, and with it
/// fresh dispatch state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Slot {
    /// The message receiving the stream.
    pub message: MessageId,

    /// The message's generation at the time the stream began.
    pub generation: u32,
}

impl Slot {
    /// Create a slot for the given message generation.
    pub fn new(message: MessageId, generation: u32) -> Self {
        Self {
            message,
            generation,
        }
    }
}

/// The dispatch state of one kind within one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DispatchState {
    /// Nothing pending or in flight.
    #[default]
    Idle,

    /// A block was seen and is waiting out the debounce window.
    PendingDebounce {
        /// Dedupe key of the pending block.
        key: String,
        /// Identifies the timer armed for this key.
        timer: u64,
    },

    /// A block was handed to its handler and has not completed yet.
    Dispatched {
        /// Dedupe key of the in-flight block.
        key: String,
    },
}

/// What the accumulator should do after a scan of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Nothing new.
    Unchanged,

    /// A handler for this kind is in flight; the new block waits its turn.
    Busy,

    /// Arm a debounce timer with this id.  Any earlier timer is now stale.
    Arm {
        /// Timer id to arm.
        timer: u64,
        /// True if this replaced a pending block with a different key.
        restarted: bool,
    },

    /// The pending block disappeared from the buffer and was dropped.
    Withdrawn,
}

#[derive(Debug, Default)]
struct Record {
    state: DispatchState,
    pending: Option<Directive>,
    handled: HashSet<String>,
}

/// All dispatch state for a session.
#[derive(Debug, Default)]
pub struct DispatchTable {
    records: HashMap<(Slot, DirectiveKind), Record>,
    next_timer: u64,
}

impl DispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `kind` in `slot`.
    pub fn state(&self, slot: Slot, kind: DirectiveKind) -> DispatchState {
        self.records
            .get(&(slot, kind))
            .map(|r| r.state.clone())
            .unwrap_or_default()
    }

    /// Returns true if `key` has already been handed to a handler in `slot`.
    pub fn was_handled(&self, slot: Slot, kind: DirectiveKind, key: &str) -> bool {
        self.records
            .get(&(slot, kind))
            .is_some_and(|r| r.handled.contains(key))
    }

    /// Feed the complete blocks of `kind` found by a scan.
    ///
    /// Only the first block whose key has not already been handled in this
    /// slot is considered.  Returns the action the caller must take and the
    /// number of blocks skipped as duplicates.
    pub fn observe(
        &mut self,
        slot: Slot,
        kind: DirectiveKind,
        blocks: Vec<Directive>,
    ) -> (Observation, usize) {
        let record = self.records.entry((slot, kind)).or_default();
        let mut duplicates = 0;
        let mut candidate = None;
        for block in blocks {
            if record.handled.contains(&block.key()) {
                duplicates += 1;
            } else {
                candidate = Some(block);
                break;
            }
        }
        let observation = match (record.state.clone(), candidate) {
            (DispatchState::Dispatched { .. }, Some(_)) => Observation::Busy,
            (DispatchState::Dispatched { .. }, None) => Observation::Unchanged,
            (DispatchState::PendingDebounce { .. }, None) => {
                record.state = DispatchState::Idle;
                record.pending = None;
                Observation::Withdrawn
            }
            (DispatchState::PendingDebounce { key, .. }, Some(block)) if key == block.key() => {
                Observation::Unchanged
            }
            (DispatchState::PendingDebounce { .. }, Some(block)) => {
                self.next_timer += 1;
                record.state = DispatchState::PendingDebounce {
                    key: block.key(),
                    timer: self.next_timer,
                };
                record.pending = Some(block);
                Observation::Arm {
                    timer: self.next_timer,
                    restarted: true,
                }
            }
            (DispatchState::Idle, None) => Observation::Unchanged,
            (DispatchState::Idle, Some(block)) => {
                self.next_timer += 1;
                record.state = DispatchState::PendingDebounce {
                    key: block.key(),
                    timer: self.next_timer,
                };
                record.pending = Some(block);
                Observation::Arm {
                    timer: self.next_timer,
                    restarted: false,
                }
            }
        };
        (observation, duplicates)
    }

    /// A debounce timer expired.
    ///
    /// If `timer` is still the armed timer, the pending block transitions to
    /// `Dispatched` and is returned for the caller to hand to its handler.
    pub fn fire(&mut self, slot: Slot, kind: DirectiveKind, timer: u64) -> Option<Directive> {
        let record = self.records.get_mut(&(slot, kind))?;
        match &record.state {
            DispatchState::PendingDebounce { timer: armed, .. } if *armed == timer => {}
            _ => return None,
        }
        let directive = record.pending.take()?;
        let key = directive.key();
        record.handled.insert(key.clone());
        record.state = DispatchState::Dispatched { key };
        Some(directive)
    }

    /// A handler finished, successfully or not.
    ///
    /// Returns false if the slot was reset while the handler ran.
    pub fn complete(&mut self, slot: Slot, kind: DirectiveKind, key: &str) -> bool {
        let Some(record) = self.records.get_mut(&(slot, kind)) else {
            return false;
        };
        if matches!(&record.state, DispatchState::Dispatched { key: inflight } if inflight == key) {
            record.state = DispatchState::Idle;
            true
        } else {
            false
        }
    }

    /// Forget every record belonging to `message`, across all generations.
    pub fn reset_message(&mut self, message: MessageId) {
        self.records.retain(|(slot, _), _| slot.message != message);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
