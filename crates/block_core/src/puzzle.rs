//! Grid-puzzle levels: obstacles, keyed doors, collectibles and patrolling hazards.
//!
//! Puzzles reuse the engine loop with directional commands. After every
//! committed step the [`PuzzleArena`] checks, in order, locked doors,
//! obstacles and hazards; any hit ends the run and sends the character back
//! to the start. Keys and collectibles on the committed cell are picked up.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{Arena, CollisionCause, Outcome};
use crate::events::{Event, EventBus};
use crate::grid::{Cell, Direction, GridSize, Pose};

const BUILTIN_PUZZLES: &str = include_str!("../data/puzzles.json");

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PuzzleCommand {
    Up,
    Down,
    Left,
    Right,
    Wait,
}

impl PuzzleCommand {
    pub fn direction(&self) -> Option<Direction> {
        match self {
            PuzzleCommand::Up => Some(Direction::Up),
            PuzzleCommand::Down => Some(Direction::Down),
            PuzzleCommand::Left => Some(Direction::Left),
            PuzzleCommand::Right => Some(Direction::Right),
            PuzzleCommand::Wait => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// A key or the door it opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColoredCell {
    pub x: u32,
    pub y: u32,
    pub color: String,
}

impl ColoredCell {
    pub fn cell(&self) -> Cell {
        Cell::new(self.x, self.y)
    }
}

fn default_speed() -> i32 {
    1
}

/// A hazard patrolling one axis, reversing at the grid edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hazard {
    pub x: u32,
    pub y: u32,
    #[serde(alias = "direction")]
    pub axis: Axis,
    #[serde(default = "default_speed")]
    pub speed: i32,
}

impl Hazard {
    /// Position after `ticks` patrol updates.
    pub fn position_after(&self, ticks: u64, bounds: GridSize) -> Cell {
        let limit = match self.axis {
            Axis::Horizontal => i64::from(bounds.width),
            Axis::Vertical => i64::from(bounds.height),
        };
        let mut position = match self.axis {
            Axis::Horizontal => i64::from(self.x),
            Axis::Vertical => i64::from(self.y),
        };
        let mut speed = i64::from(self.speed);
        if speed != 0 && limit > 0 {
            for _ in 0..ticks {
                let mut next = position + speed;
                if next >= limit || next < 0 {
                    speed = -speed;
                    next = position + speed;
                }
                position = next.clamp(0, limit - 1);
            }
        }
        match self.axis {
            Axis::Horizontal => Cell::new(position as u32, self.y),
            Axis::Vertical => Cell::new(self.x, position as u32),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PuzzleLevel {
    pub id: u32,
    #[serde(alias = "name")]
    pub title: String,
    #[serde(alias = "gridSize")]
    pub grid: GridSize,
    pub start: Cell,
    pub goal: Cell,
    #[serde(default)]
    pub obstacles: Vec<Cell>,
    #[serde(default)]
    pub keys: Vec<ColoredCell>,
    #[serde(default)]
    pub doors: Vec<ColoredCell>,
    #[serde(default, alias = "coinPositions")]
    pub collectibles: Vec<Cell>,
    #[serde(default, alias = "targetCoins")]
    pub target_collectibles: u32,
    #[serde(default, alias = "initialEnemies")]
    pub hazards: Vec<Hazard>,
    #[serde(default)]
    pub reward: u32,
}

/// Puzzle levels shipped with the crate.
pub fn builtin_levels() -> Result<Vec<PuzzleLevel>> {
    let levels: Vec<PuzzleLevel> =
        serde_json::from_str(BUILTIN_PUZZLES).context("builtin puzzle catalog is invalid")?;
    for (index, level) in levels.iter().enumerate() {
        ensure!(
            level.id as usize == index + 1,
            "puzzle ids must be dense from 1, found {} at position {}",
            level.id,
            index
        );
    }
    Ok(levels)
}

/// Per-run puzzle state.
#[derive(Debug)]
pub struct PuzzleArena<'a> {
    level: &'a PuzzleLevel,
    hazard_tick: Duration,
    keys: BTreeSet<String>,
    collected: BTreeSet<usize>,
}

impl<'a> PuzzleArena<'a> {
    pub fn new(level: &'a PuzzleLevel, hazard_tick: Duration) -> Self {
        Self {
            level,
            hazard_tick,
            keys: BTreeSet::new(),
            collected: BTreeSet::new(),
        }
    }

    pub fn keys(&self) -> &BTreeSet<String> {
        &self.keys
    }

    fn hazard_ticks(&self, elapsed: Duration) -> u64 {
        if self.hazard_tick.is_zero() {
            return 0;
        }
        (elapsed.as_millis() / self.hazard_tick.as_millis().max(1)) as u64
    }
}

impl Arena for PuzzleArena<'_> {
    fn enter(&mut self, pose: Pose, elapsed: Duration, bus: &EventBus) -> Result<(), CollisionCause> {
        let cell = pose.cell();

        if let Some(door) = self.level.doors.iter().find(|door| door.cell() == cell) {
            if !self.keys.contains(&door.color) {
                return Err(CollisionCause::LockedDoor {
                    color: door.color.clone(),
                });
            }
        }
        if self.level.obstacles.contains(&cell) {
            return Err(CollisionCause::Obstacle);
        }
        let ticks = self.hazard_ticks(elapsed);
        if self
            .level
            .hazards
            .iter()
            .any(|hazard| hazard.position_after(ticks, self.level.grid) == cell)
        {
            return Err(CollisionCause::Hazard);
        }

        if let Some(key) = self.level.keys.iter().find(|key| key.cell() == cell) {
            if self.keys.insert(key.color.clone()) {
                bus.publish(Event::ItemCollected {
                    cell,
                    item: format!("{} key", key.color),
                });
            }
        }
        if let Some(index) = self.level.collectibles.iter().position(|c| *c == cell) {
            if self.collected.insert(index) {
                bus.publish(Event::ItemCollected {
                    cell,
                    item: "coin".to_string(),
                });
            }
        }
        Ok(())
    }

    fn verdict(&self, pose: Pose) -> Outcome {
        if pose.cell() != self.level.goal {
            return Outcome::GoalNotReached;
        }
        let collected = self.collected();
        if collected < self.level.target_collectibles {
            return Outcome::InsufficientCollectibles {
                collected,
                required: self.level.target_collectibles,
            };
        }
        Outcome::Success
    }

    fn collected(&self) -> u32 {
        self.collected.len() as u32
    }
}
