//! Learner-authored programs: instructions, blocks and the slot sequence.
//!
//! A program is a contiguous `Vec<Slot>`; an empty slot is `None`. Blocks
//! persist with the flat `{blockId, blockType, blockDirection, ...}` layout
//! used by the saved state blob, while the engine only ever sees the closed
//! [`Instruction`] enum.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::BlockError;
use crate::grid::TurnDirection;

/// Repetitions used by a loop block when none (or zero) is given.
pub const DEFAULT_LOOP_COUNT: u32 = 2;

/// Upper bound on the repetitions of a single loop.
pub const MAX_LOOP_COUNT: u32 = 10;

/// Deepest loop nesting a block may carry.
pub const MAX_LOOP_DEPTH: usize = 3;

/// Effective repetitions for a requested loop count.
pub fn loop_iterations(count: u32) -> u32 {
    match count {
        0 => DEFAULT_LOOP_COUNT,
        count => count.min(MAX_LOOP_COUNT),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instruction {
    Move,
    Turn(TurnDirection),
    Loop { count: u32, body: Vec<Instruction> },
}

impl Instruction {
    /// Loop over a single move, the only body the palette offers.
    pub fn repeat_move(count: Option<u32>) -> Self {
        Instruction::Loop {
            count: loop_iterations(count.unwrap_or(DEFAULT_LOOP_COUNT)),
            body: vec![Instruction::Move],
        }
    }

    /// Loop nesting depth; primitives are 0.
    pub fn depth(&self) -> usize {
        match self {
            Instruction::Loop { body, .. } => {
                1 + body.iter().map(Instruction::depth).max().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Clamp every loop count, nested ones included, into range.
    pub fn normalized(self) -> Self {
        match self {
            Instruction::Loop { count, body } => Instruction::Loop {
                count: loop_iterations(count),
                body: body.into_iter().map(Instruction::normalized).collect(),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> InstructionKind {
        match self {
            Instruction::Move => InstructionKind::Move,
            Instruction::Turn(_) => InstructionKind::Turn,
            Instruction::Loop { .. } => InstructionKind::Loop,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionKind {
    Move,
    Turn,
    Loop,
}

impl InstructionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstructionKind::Move => "move",
            InstructionKind::Turn => "turn",
            InstructionKind::Loop => "loop",
        }
    }
}

/// An occupied program slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBlock", into = "RawBlock")]
pub struct Block {
    pub block_id: String,
    pub instruction: Instruction,
    pub action: Option<String>,
    pub icon: String,
    pub label: String,
}

pub type Slot = Option<Block>;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    block_id: String,
    block_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_direction: Option<TurnDirection>,
    #[serde(default)]
    icon: String,
    #[serde(default)]
    label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loop_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loop_body: Option<Vec<Instruction>>,
}

impl TryFrom<RawBlock> for Block {
    type Error = BlockError;

    fn try_from(raw: RawBlock) -> Result<Self, Self::Error> {
        let instruction = match raw.block_type.as_str() {
            "move" => Instruction::Move,
            "turn" => Instruction::Turn(
                raw.block_direction
                    .ok_or_else(|| BlockError::MissingDirection(raw.block_id.clone()))?,
            ),
            "loop" => Instruction::Loop {
                count: raw.loop_count.unwrap_or(DEFAULT_LOOP_COUNT),
                body: raw.loop_body.unwrap_or_else(|| vec![Instruction::Move]),
            }
            .normalized(),
            other => return Err(BlockError::UnknownType(other.to_string())),
        };
        if instruction.depth() > MAX_LOOP_DEPTH {
            return Err(BlockError::LoopTooDeep(raw.block_id));
        }
        Ok(Block {
            block_id: raw.block_id,
            instruction,
            action: raw.block_action,
            icon: raw.icon,
            label: raw.label,
        })
    }
}

impl From<Block> for RawBlock {
    fn from(block: Block) -> Self {
        let block_type = block.instruction.kind().as_str().to_string();
        let (block_direction, loop_count, loop_body) = match block.instruction {
            Instruction::Move => (None, None, None),
            Instruction::Turn(direction) => (Some(direction), None, None),
            Instruction::Loop { count, body } => {
                let body = (body != [Instruction::Move]).then_some(body);
                (None, Some(count), body)
            }
        };
        RawBlock {
            block_id: block.block_id,
            block_type,
            block_action: block.action,
            block_direction,
            icon: block.icon,
            label: block.label,
            loop_count,
            loop_body,
        }
    }
}

/// A palette entry: everything a block needs except its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTemplate {
    pub instruction: Instruction,
    pub action: Option<String>,
    pub icon: String,
    pub label: String,
}

impl BlockTemplate {
    pub fn new(instruction: Instruction) -> Self {
        let instruction = instruction.normalized();
        let (action, icon, label) = match &instruction {
            Instruction::Move => ("forward", "⬆️", "Move forward"),
            Instruction::Turn(TurnDirection::Left) => ("turn-left", "↩️", "Turn left"),
            Instruction::Turn(TurnDirection::Right) => ("turn-right", "↪️", "Turn right"),
            Instruction::Loop { .. } => ("repeat", "🔁", "Repeat"),
        };
        Self {
            instruction,
            action: Some(action.to_string()),
            icon: icon.to_string(),
            label: label.to_string(),
        }
    }

    /// The full block palette, filtered by the caller per level.
    pub fn palette() -> Vec<BlockTemplate> {
        vec![
            BlockTemplate::new(Instruction::Move),
            BlockTemplate::new(Instruction::Turn(TurnDirection::Left)),
            BlockTemplate::new(Instruction::Turn(TurnDirection::Right)),
            BlockTemplate::new(Instruction::repeat_move(None)),
        ]
    }

    pub fn into_block(self, block_id: String) -> Block {
        Block {
            block_id,
            instruction: self.instruction.normalized(),
            action: self.action,
            icon: self.icon,
            label: self.label,
        }
    }
}

/// Mints unique block ids of the form `block-<hex>-<slot>`.
#[derive(Clone, Debug)]
pub struct BlockIds {
    rng: ChaCha8Rng,
}

impl BlockIds {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { rng }
    }

    pub fn next(&mut self, slot: usize) -> String {
        format!("block-{:012x}-{}", self.rng.gen::<u64>() & 0xffff_ffff_ffff, slot)
    }
}

/// Occupied slots with their indices, in program order.
pub fn occupied(slots: &[Slot]) -> impl Iterator<Item = (usize, &Block)> {
    slots
        .iter()
        .enumerate()
        .filter_map(|(index, slot)| slot.as_ref().map(|block| (index, block)))
}

/// Parse a `slot-N` identifier. Negative or malformed ids yield `None`.
pub fn parse_slot_id(slot_id: &str) -> Option<usize> {
    slot_id.strip_prefix("slot-")?.parse::<usize>().ok()
}
