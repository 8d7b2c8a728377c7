//! Core of the block-coding game: a learner's program of move / turn / loop
//! blocks replayed against a grid-world character, with persisted progress,
//! badges, hints and a coin payout on success.
//!
//! Presentation layers talk to a [`session::Session`] and subscribe to its
//! [`events::EventBus`]; nothing in this crate renders anything.

pub mod badge;
pub mod config;
pub mod economy;
pub mod engine;
pub mod error;
pub mod events;
pub mod grid;
pub mod hint;
pub mod io;
pub mod kv;
pub mod level;
pub mod program;
pub mod puzzle;
pub mod session;
pub mod store;
pub mod timer;

#[cfg(any(test, feature = "proptest-support"))]
pub mod strategy;

use std::future::Future;

use tokio::sync::broadcast::{self, error::RecvError};

pub use config::Config;
pub use engine::{Engine, Outcome, Pacing, RunReport};
pub use error::EngineError;
pub use events::{Event, EventBus};
pub use io::catalog::Catalog;
pub use level::Level;
pub use program::{Block, BlockTemplate, Instruction, Slot};
pub use puzzle::{PuzzleCommand, PuzzleLevel};
pub use session::{RunSummary, Session};

/// Bus capacity for headless replays; events are collected as the run
/// yields, so this only bounds what a single step may publish.
const REPLAY_CAPACITY: usize = 64;

/// Replay `program` on `level` with a private engine and return the report
/// together with every event the run published, in order.
pub async fn replay_level(
    level: &Level,
    program: &[Slot],
    pacing: Pacing,
) -> Result<(RunReport, Vec<Event>), EngineError> {
    let bus = EventBus::new(REPLAY_CAPACITY);
    let rx = bus.subscribe();
    let engine = Engine::new(pacing, bus);
    record(rx, engine.run_level(level, program, None)).await
}

/// [`replay_level`] for a grid-puzzle level driven by directional commands.
pub async fn replay_puzzle(
    level: &PuzzleLevel,
    commands: &[PuzzleCommand],
    pacing: Pacing,
) -> Result<(RunReport, Vec<Event>), EngineError> {
    let bus = EventBus::new(REPLAY_CAPACITY);
    let rx = bus.subscribe();
    let engine = Engine::new(pacing, bus);
    record(rx, engine.run_puzzle(level, commands, None)).await
}

async fn record<F>(
    mut rx: broadcast::Receiver<Event>,
    run: F,
) -> Result<(RunReport, Vec<Event>), EngineError>
where
    F: Future<Output = Result<RunReport, EngineError>>,
{
    tokio::pin!(run);
    let mut trace = Vec::new();
    let mut open = true;
    let report = loop {
        tokio::select! {
            biased;
            received = rx.recv(), if open => match received {
                Ok(event) => trace.push(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "replay trace lagged behind the run");
                }
                Err(RecvError::Closed) => open = false,
            },
            report = &mut run => break report?,
        }
    };
    trace.extend(events::drain(&mut rx));
    Ok((report, trace))
}
