//! Proptest strategies for grid poses and block programs.

use proptest::prelude::*;

use crate::grid::{Direction, GridSize, Pose, TurnDirection};
use crate::program::{BlockTemplate, Instruction, Slot};

pub fn direction() -> impl Strategy<Value = Direction> {
    prop::sample::select(Direction::CLOCKWISE.to_vec())
}

pub fn turn_direction() -> impl Strategy<Value = TurnDirection> {
    prop_oneof![Just(TurnDirection::Left), Just(TurnDirection::Right)]
}

pub fn pose_within(bounds: GridSize) -> impl Strategy<Value = Pose> {
    (0..bounds.width, 0..bounds.height, direction()).prop_map(|(x, y, d)| Pose::new(x, y, d))
}

/// Flat instructions; loops repeat a single move at most five times.
pub fn instruction() -> impl Strategy<Value = Instruction> {
    prop_oneof![
        3 => Just(Instruction::Move),
        2 => turn_direction().prop_map(Instruction::Turn),
        1 => (1u32..=5).prop_map(|count| Instruction::repeat_move(Some(count))),
    ]
}

/// Programs with interleaved empty slots.
pub fn program(max_len: usize) -> impl Strategy<Value = Vec<Slot>> {
    prop::collection::vec(prop::option::weighted(0.8, instruction()), 0..=max_len).prop_map(
        |slots| {
            slots
                .into_iter()
                .enumerate()
                .map(|(index, slot)| {
                    slot.map(|instruction| {
                        BlockTemplate::new(instruction).into_block(format!("block-prop-{index}"))
                    })
                })
                .collect()
        },
    )
}
