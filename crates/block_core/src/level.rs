use serde::{Deserialize, Serialize};

use crate::grid::{Cell, GridSize, Pose};
use crate::program::{BlockTemplate, InstructionKind};

fn default_max_blocks() -> usize {
    10
}

fn default_xp_reward() -> u32 {
    10
}

fn default_available_blocks() -> Vec<InstructionKind> {
    vec![
        InstructionKind::Move,
        InstructionKind::Turn,
        InstructionKind::Loop,
    ]
}

/// One block-coding level. Immutable once the catalog is loaded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    pub id: u32,
    #[serde(alias = "name")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Star rating shown next to the title.
    #[serde(default)]
    pub difficulty: u8,
    #[serde(alias = "gridSize")]
    pub grid: GridSize,
    pub start: Pose,
    pub goal: Cell,
    #[serde(default)]
    pub obstacles: Vec<Cell>,
    #[serde(default = "default_available_blocks")]
    pub available_blocks: Vec<InstructionKind>,
    #[serde(default = "default_max_blocks")]
    pub max_blocks: usize,
    #[serde(default = "default_xp_reward")]
    pub xp_reward: u32,
}

impl Level {
    /// Palette entries this level allows.
    pub fn palette(&self) -> Vec<BlockTemplate> {
        BlockTemplate::palette()
            .into_iter()
            .filter(|template| self.available_blocks.contains(&template.instruction.kind()))
            .collect()
    }
}
