use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::protocol::ALERT_WINDOW;
use crate::clock;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SlotState {
    Pending,
    Due,
    /// Alert window elapsed unconfirmed. Still confirmable.
    Expired,
}

/// Edges reported by [`Slot::tick`]; each fires once per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTransition {
    BecameDue,
    Expired,
}

/// The next unconfirmed measurement of an ongoing exam. Never persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    /// Zero-based position of the measurement this slot will produce.
    pub index: usize,
    pub label: String,
    pub due: DateTime<Utc>,
    state: SlotState,
}

impl Slot {
    pub fn new(index: usize, label: String, due: DateTime<Utc>) -> Self {
        Self {
            index,
            label,
            due,
            state: SlotState::Pending,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, SlotState::Due | SlotState::Expired)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.due + chrono::Duration::from_std(ALERT_WINDOW).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        clock::remaining_ms(self.due, now)
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        Duration::from_millis(self.remaining_ms(now).max(0) as u64)
    }

    /// Advance by at most one edge. Call again until `None` to catch up
    /// after a stalled loop.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<SlotTransition> {
        match self.state {
            SlotState::Pending if now >= self.due => {
                self.state = SlotState::Due;
                Some(SlotTransition::BecameDue)
            }
            SlotState::Due if now >= self.expires_at() => {
                self.state = SlotState::Expired;
                Some(SlotTransition::Expired)
            }
            _ => None,
        }
    }

    /// All edges crossed by `now`, in order.
    pub fn catch_up(&mut self, now: DateTime<Utc>) -> Vec<SlotTransition> {
        let mut transitions = Vec::new();
        while let Some(transition) = self.tick(now) {
            transitions.push(transition);
        }
        transitions
    }
}
