//! Typed notifications from the engine, store and session.
//!
//! The presentation layer subscribes to an [`EventBus`] instead of the core
//! reaching into any view. Publishing never blocks and never fails: with no
//! subscribers the event is dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::Outcome;
use crate::grid::{Cell, Pose};
use crate::hint::HintSource;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunStarted {
        start: Pose,
        steps: usize,
    },
    /// One executed step. Loops emit one per iteration.
    InstructionExecuted {
        slot: usize,
        pose: Pose,
    },
    /// A move was clamped at the grid edge.
    WallBumped {
        slot: usize,
        pose: Pose,
    },
    ItemCollected {
        cell: Cell,
        item: String,
    },
    PoseReset {
        pose: Pose,
    },
    RunCompleted {
        pose: Pose,
        outcome: Outcome,
    },
    TimeExpired,
    ProgramChanged {
        slot: Option<usize>,
    },
    LevelChanged {
        level: u32,
    },
    BadgeEarned {
        badge: String,
        name: String,
    },
    CoinsEarned {
        amount: u32,
    },
    HintReady {
        text: String,
        source: HintSource,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no subscribers for event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Drain whatever is currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event subscriber lagged");
            }
            Err(_) => break,
        }
    }
    events
}
