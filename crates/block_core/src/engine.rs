//! The block-program execution engine.
//!
//! A run walks the authored slots in order, iterating loop bodies in place,
//! and replays primitive actions against a grid one at a time. Every executed action
//! is published as an [`Event::InstructionExecuted`]; moves and top-level
//! instructions are followed by tokio sleeps so callers can await a paced,
//! animation-friendly run. The arena decides what a committed cell means
//! (goal, obstacle, hazard, pickup) and produces the final [`Outcome`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::error::EngineError;
use crate::events::{Event, EventBus};
use crate::grid::{Cell, Direction, GridSize, Pose, TurnDirection};
use crate::level::Level;
use crate::program::{loop_iterations, occupied, Instruction, Slot, MAX_LOOP_DEPTH};
use crate::puzzle::{PuzzleArena, PuzzleCommand, PuzzleLevel};
use crate::timer::AbortSignal;

/// Suspension lengths between steps.
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pacing {
    /// Sleep after every forward move, including each loop iteration.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "move_delay_ms")]
    pub move_delay: Duration,
    /// Sleep after every top-level instruction.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "step_delay_ms")]
    pub step_delay: Duration,
    /// Hazard patrol cadence, measured in run time.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "hazard_tick_ms")]
    pub hazard_tick: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            move_delay: Duration::from_millis(300),
            step_delay: Duration::from_millis(500),
            hazard_tick: Duration::from_millis(500),
        }
    }
}

impl Pacing {
    /// No sleeps at all. Hazards keep their cadence but never advance.
    pub fn instant() -> Self {
        Self {
            move_delay: Duration::ZERO,
            step_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionCause {
    Obstacle,
    LockedDoor { color: String },
    Hazard,
}

/// Terminal verdict of a run. Failures here are expected results, not errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    GoalNotReached,
    Collision { cause: CollisionCause, cell: Cell },
    InsufficientCollectibles { collected: u32, required: u32 },
    TimeExpired { collected: u32 },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Short message for the learner.
    pub fn message(&self) -> String {
        match self {
            Outcome::Success => "Goal reached!".to_string(),
            Outcome::GoalNotReached => "Not at the goal yet. Try again!".to_string(),
            Outcome::Collision { cause, .. } => match cause {
                CollisionCause::Obstacle => "Bumped into an obstacle!".to_string(),
                CollisionCause::LockedDoor { color } => format!("You need the {color} key!"),
                CollisionCause::Hazard => "Caught by an enemy!".to_string(),
            },
            Outcome::InsufficientCollectibles {
                collected,
                required,
            } => format!("Collect {required} items first! (you have {collected})"),
            Outcome::TimeExpired { collected } => {
                format!("Time's up! You collected {collected}.")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub pose: Pose,
    /// Executed actions, counting each loop iteration.
    pub steps: usize,
    /// Moves clamped at the grid edge.
    pub bumps: usize,
    pub collected: u32,
    pub outcome: Outcome,
}

/// What a committed cell means in a particular kind of level.
pub trait Arena {
    /// Called after the character's cell is committed. An `Err` ends the run.
    fn enter(&mut self, pose: Pose, elapsed: Duration, bus: &EventBus) -> Result<(), CollisionCause>;

    fn verdict(&self, pose: Pose) -> Outcome;

    fn collected(&self) -> u32 {
        0
    }
}

/// Block-coding levels: only the goal cell matters.
#[derive(Clone, Copy, Debug)]
pub struct GoalArena {
    pub goal: Option<Cell>,
}

impl Arena for GoalArena {
    fn enter(&mut self, _pose: Pose, _elapsed: Duration, _bus: &EventBus) -> Result<(), CollisionCause> {
        Ok(())
    }

    fn verdict(&self, pose: Pose) -> Outcome {
        match self.goal {
            Some(goal) if goal == pose.cell() => Outcome::Success,
            _ => Outcome::GoalNotReached,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Action {
    Forward,
    Turn(TurnDirection),
    Step(Direction),
    Wait,
}

impl Action {
    fn commits_cell(&self) -> bool {
        !matches!(self, Action::Turn(_))
    }
}

/// One top-level program slot or puzzle command.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PlannedStep<'a> {
    slot: usize,
    source: StepSource<'a>,
}

#[derive(Clone, Copy, Debug)]
enum StepSource<'a> {
    Block(&'a Instruction),
    Command(Action),
}

impl<'a> PlannedStep<'a> {
    fn actions(&self) -> Actions<'a> {
        match self.source {
            StepSource::Block(instruction) => Actions {
                pending: None,
                frames: vec![Frame {
                    body: std::slice::from_ref(instruction),
                    next: 0,
                    remaining: 1,
                }],
            },
            StepSource::Command(action) => Actions {
                pending: Some(action),
                frames: Vec::new(),
            },
        }
    }
}

struct Frame<'a> {
    body: &'a [Instruction],
    next: usize,
    remaining: u32,
}

/// Walks an instruction tree one primitive action at a time. Loops are
/// iterated in place, never unrolled.
struct Actions<'a> {
    pending: Option<Action>,
    frames: Vec<Frame<'a>>,
}

impl Iterator for Actions<'_> {
    type Item = Action;

    fn next(&mut self) -> Option<Action> {
        if let Some(action) = self.pending.take() {
            return Some(action);
        }
        loop {
            let frame = self.frames.last_mut()?;
            if frame.next == frame.body.len() {
                frame.remaining -= 1;
                if frame.remaining == 0 {
                    self.frames.pop();
                } else {
                    frame.next = 0;
                }
                continue;
            }
            let body = frame.body;
            let instruction = &body[frame.next];
            frame.next += 1;
            match instruction {
                Instruction::Move => return Some(Action::Forward),
                Instruction::Turn(turn) => return Some(Action::Turn(*turn)),
                Instruction::Loop { count, body } => {
                    if body.is_empty() {
                        continue;
                    }
                    if self.frames.len() > MAX_LOOP_DEPTH {
                        tracing::warn!(depth = self.frames.len(), "skipping loop nested too deeply");
                        continue;
                    }
                    self.frames.push(Frame {
                        body,
                        next: 0,
                        remaining: loop_iterations(*count),
                    });
                }
            }
        }
    }
}

pub(crate) fn plan_program(program: &[Slot]) -> Vec<PlannedStep<'_>> {
    occupied(program)
        .map(|(slot, block)| PlannedStep {
            slot,
            source: StepSource::Block(&block.instruction),
        })
        .collect()
}

pub(crate) fn plan_commands(commands: &[PuzzleCommand]) -> Vec<PlannedStep<'static>> {
    commands
        .iter()
        .enumerate()
        .map(|(slot, command)| {
            let action = match command.direction() {
                Some(direction) => Action::Step(direction),
                None => Action::Wait,
            };
            PlannedStep {
                slot,
                source: StepSource::Command(action),
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct Engine {
    pacing: Pacing,
    bus: EventBus,
    running: Mutex<()>,
}

impl Engine {
    pub fn new(pacing: Pacing, bus: EventBus) -> Self {
        Self {
            pacing,
            bus,
            running: Mutex::new(()),
        }
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Replay `program` from `start` within `bounds` and return the terminal pose.
    pub async fn run(
        &self,
        program: &[Slot],
        start: Pose,
        bounds: GridSize,
    ) -> Result<Pose, EngineError> {
        let mut arena = GoalArena { goal: None };
        let report = self
            .execute(plan_program(program), start, bounds, &mut arena, None)
            .await?;
        Ok(report.pose)
    }

    /// Run `program` on `level` and judge the result against its goal.
    pub async fn run_level(
        &self,
        level: &Level,
        program: &[Slot],
        abort: Option<AbortSignal>,
    ) -> Result<RunReport, EngineError> {
        let mut arena = GoalArena {
            goal: Some(level.goal),
        };
        self.execute(plan_program(program), level.start, level.grid, &mut arena, abort)
            .await
    }

    /// Run directional commands on a grid-puzzle level.
    pub async fn run_puzzle(
        &self,
        level: &PuzzleLevel,
        commands: &[PuzzleCommand],
        abort: Option<AbortSignal>,
    ) -> Result<RunReport, EngineError> {
        let mut arena = PuzzleArena::new(level, self.pacing.hazard_tick);
        let start = Pose::at(level.start, Direction::default());
        self.execute(plan_commands(commands), start, level.grid, &mut arena, abort)
            .await
    }

    async fn execute<A: Arena>(
        &self,
        plan: Vec<PlannedStep<'_>>,
        start: Pose,
        bounds: GridSize,
        arena: &mut A,
        mut abort: Option<AbortSignal>,
    ) -> Result<RunReport, EngineError> {
        if plan.is_empty() {
            return Err(EngineError::EmptyProgram);
        }
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| EngineError::ConcurrentRun)?;

        let started = Instant::now();
        let mut pose = start;
        let mut steps = 0;
        let mut bumps = 0;
        let mut ended: Option<Outcome> = None;

        self.bus.publish(Event::RunStarted {
            start,
            steps: plan.len(),
        });
        tracing::debug!(instructions = plan.len(), ?start, "run started");

        'run: for step in &plan {
            if abort.as_ref().is_some_and(AbortSignal::is_aborted) {
                ended = Some(Outcome::TimeExpired {
                    collected: arena.collected(),
                });
                break;
            }

            for action in step.actions() {
                let moved = match action {
                    Action::Forward => {
                        let (next, moved) = pose.advanced(bounds);
                        pose = next;
                        moved
                    }
                    Action::Step(direction) => {
                        pose.direction = direction;
                        let (next, moved) = pose.advanced(bounds);
                        pose = next;
                        moved
                    }
                    Action::Turn(turn) => {
                        pose = pose.turned(turn);
                        true
                    }
                    Action::Wait => true,
                };
                steps += 1;

                if !moved {
                    bumps += 1;
                    tracing::warn!(slot = step.slot, x = pose.x, y = pose.y, "move clamped at grid edge");
                    self.bus.publish(Event::WallBumped {
                        slot: step.slot,
                        pose,
                    });
                }
                self.bus.publish(Event::InstructionExecuted {
                    slot: step.slot,
                    pose,
                });

                if action.commits_cell() {
                    if let Err(cause) = arena.enter(pose, started.elapsed(), &self.bus) {
                        tracing::info!(slot = step.slot, ?cause, "run ended by collision");
                        let cell = pose.cell();
                        pose = start;
                        self.bus.publish(Event::PoseReset { pose });
                        ended = Some(Outcome::Collision { cause, cell });
                        break 'run;
                    }
                }

                let delay = match action {
                    Action::Forward => self.pacing.move_delay,
                    _ => Duration::ZERO,
                };
                if self.pause(delay, &mut abort).await {
                    ended = Some(Outcome::TimeExpired {
                        collected: arena.collected(),
                    });
                    break 'run;
                }
            }

            if self.pause(self.pacing.step_delay, &mut abort).await {
                ended = Some(Outcome::TimeExpired {
                    collected: arena.collected(),
                });
                break;
            }
        }

        let outcome = ended.unwrap_or_else(|| arena.verdict(pose));
        tracing::debug!(?pose, ?outcome, steps, "run finished");
        self.bus.publish(Event::RunCompleted {
            pose,
            outcome: outcome.clone(),
        });

        Ok(RunReport {
            pose,
            steps,
            bumps,
            collected: arena.collected(),
            outcome,
        })
    }

    /// Sleep for `delay`, or just yield to the scheduler when it is zero.
    /// Returns `true` if the run was aborted meanwhile.
    async fn pause(&self, delay: Duration, abort: &mut Option<AbortSignal>) -> bool {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return abort.as_ref().is_some_and(AbortSignal::is_aborted);
        }
        match abort {
            Some(signal) => {
                if signal.is_aborted() {
                    return true;
                }
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = signal.aborted() => return true,
                }
                signal.is_aborted()
            }
            None => {
                sleep(delay).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use crate::program::BlockTemplate;
    use crate::strategy::{pose_within, program};
    use crate::timer::abort_pair;
    use proptest::prelude::*;

    fn slots(instructions: &[Instruction]) -> Vec<Slot> {
        instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| {
                Some(BlockTemplate::new(instruction.clone()).into_block(format!("b{index}")))
            })
            .collect()
    }

    fn instant_engine() -> Engine {
        Engine::new(Pacing::instant(), EventBus::new(64))
    }

    #[tokio::test]
    async fn two_moves_reach_goal() {
        let engine = instant_engine();
        let pose = engine
            .run(
                &slots(&[Instruction::Move, Instruction::Move]),
                Pose::new(0, 0, Direction::Right),
                GridSize::square(5),
            )
            .await
            .expect("run succeeds");
        assert_eq!(pose.cell(), Cell::new(2, 0));
        assert_eq!(pose.direction, Direction::Right);
    }

    #[tokio::test]
    async fn empty_program_is_rejected_without_events() {
        let engine = instant_engine();
        let mut rx = engine.bus().subscribe();
        let err = engine
            .run(&[None, None], Pose::default(), GridSize::square(5))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::EmptyProgram);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn wall_clamp_keeps_pose() {
        let engine = instant_engine();
        let mut rx = engine.bus().subscribe();
        let pose = engine
            .run(
                &slots(&[Instruction::Move]),
                Pose::new(2, 0, Direction::Right),
                GridSize::new(3, 3),
            )
            .await
            .expect("clamp is not an error");
        assert_eq!(pose, Pose::new(2, 0, Direction::Right));
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(event, Event::WallBumped { .. })));
    }

    #[tokio::test]
    async fn empty_slots_are_skipped() {
        let engine = instant_engine();
        let mut rx = engine.bus().subscribe();
        let mut program = slots(&[Instruction::Move]);
        program.insert(0, None);
        program.push(None);
        engine
            .run(&program, Pose::default(), GridSize::square(5))
            .await
            .expect("run succeeds");
        let executed: Vec<usize> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                Event::InstructionExecuted { slot, .. } => Some(slot),
                _ => None,
            })
            .collect();
        assert_eq!(executed, vec![1]);
    }

    #[tokio::test]
    async fn loop_repeats_body_and_reports_each_iteration() {
        let engine = instant_engine();
        let mut rx = engine.bus().subscribe();
        let pose = engine
            .run(
                &slots(&[Instruction::repeat_move(None)]),
                Pose::default(),
                GridSize::square(5),
            )
            .await
            .expect("run succeeds");
        assert_eq!(pose.cell(), Cell::new(2, 0));
        let executed = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, Event::InstructionExecuted { .. }))
            .count();
        assert_eq!(executed, 2);
    }

    fn actions_of(instruction: &Instruction) -> Vec<Action> {
        PlannedStep {
            slot: 0,
            source: StepSource::Block(instruction),
        }
        .actions()
        .collect()
    }

    #[test]
    fn nested_loops_iterate_in_place() {
        let instruction = Instruction::Loop {
            count: 2,
            body: vec![
                Instruction::Move,
                Instruction::Loop {
                    count: 2,
                    body: vec![Instruction::Turn(TurnDirection::Left)],
                },
            ],
        };
        let left = Action::Turn(TurnDirection::Left);
        assert_eq!(
            actions_of(&instruction),
            vec![Action::Forward, left, left, Action::Forward, left, left]
        );
    }

    #[test]
    fn loops_beyond_the_nesting_limit_are_skipped() {
        let mut instruction = Instruction::Move;
        for _ in 0..=crate::program::MAX_LOOP_DEPTH {
            instruction = Instruction::Loop {
                count: 1,
                body: vec![Instruction::Turn(TurnDirection::Right), instruction],
            };
        }
        let turns = Action::Turn(TurnDirection::Right);
        assert_eq!(actions_of(&instruction), vec![turns; crate::program::MAX_LOOP_DEPTH]);
    }

    #[tokio::test]
    async fn oversized_loop_count_runs_capped() {
        let engine = instant_engine();
        let block = crate::program::Block {
            block_id: "b-huge".to_string(),
            instruction: Instruction::Loop {
                count: u32::MAX,
                body: vec![Instruction::Move],
            },
            action: None,
            icon: String::new(),
            label: String::new(),
        };
        let mut arena = GoalArena { goal: None };
        let program = [Some(block)];
        let run = engine.execute(
            plan_program(&program),
            Pose::default(),
            GridSize::square(5),
            &mut arena,
            None,
        );
        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run returns")
            .expect("run succeeds");
        assert_eq!(report.steps, crate::program::MAX_LOOP_COUNT as usize);
        assert_eq!(report.pose.cell(), Cell::new(4, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn turns_skip_the_move_delay() {
        let engine = Engine::new(Pacing::default(), EventBus::new(16));
        let before = Instant::now();
        engine
            .run(
                &slots(&[Instruction::Move, Instruction::Turn(TurnDirection::Left)]),
                Pose::default(),
                GridSize::square(5),
            )
            .await
            .expect("run succeeds");
        assert_eq!(before.elapsed(), Duration::from_millis(300 + 500 + 500));
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_while_active_is_rejected() {
        let engine = Engine::new(Pacing::default(), EventBus::new(16));
        let program = slots(&[Instruction::Move, Instruction::Move]);
        let (first, second) = tokio::join!(
            engine.run(&program, Pose::default(), GridSize::square(5)),
            engine.run(&program, Pose::default(), GridSize::square(5)),
        );
        assert_eq!(first.expect("first run").cell(), Cell::new(2, 0));
        assert_eq!(second.unwrap_err(), EngineError::ConcurrentRun);
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_remaining_steps() {
        let engine = Engine::new(Pacing::default(), EventBus::new(16));
        let level = crate::io::catalog::Catalog::builtin()
            .expect("catalog")
            .get(5)
            .cloned()
            .expect("level 5");
        let (handle, signal) = abort_pair();
        let program = slots(&[Instruction::Move, Instruction::Move, Instruction::Move]);
        let run = engine.run_level(&level, &program, Some(signal));
        let stopper = async {
            sleep(Duration::from_millis(900)).await;
            handle.abort();
        };
        let (report, ()) = tokio::join!(run, stopper);
        let report = report.expect("run returns a report");
        assert_eq!(report.outcome, Outcome::TimeExpired { collected: 0 });
        assert_eq!(report.pose.cell(), Cell::new(2, 0));
    }

    #[tokio::test]
    async fn run_level_judges_goal() {
        let level = crate::io::catalog::Catalog::builtin()
            .expect("catalog")
            .get(1)
            .cloned()
            .expect("level 1");
        let engine = instant_engine();
        let report = engine
            .run_level(&level, &slots(&[Instruction::Move, Instruction::Move]), None)
            .await
            .expect("run succeeds");
        assert_eq!(report.outcome, Outcome::Success);
        let report = engine
            .run_level(&level, &slots(&[Instruction::Move]), None)
            .await
            .expect("run succeeds");
        assert_eq!(report.outcome, Outcome::GoalNotReached);
    }

    proptest! {
        #[test]
        fn engine_never_leaves_grid(
            (bounds, start) in (1u32..7, 1u32..7).prop_flat_map(|(w, h)| {
                let bounds = GridSize::new(w, h);
                (Just(bounds), pose_within(bounds))
            }),
            program in program(12),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("runtime builds");
            let engine = instant_engine();
            match runtime.block_on(engine.run(&program, start, bounds)) {
                Ok(pose) => prop_assert!(bounds.contains(pose.cell())),
                Err(err) => {
                    prop_assert_eq!(err, EngineError::EmptyProgram);
                    prop_assert!(program.iter().all(Option::is_none));
                }
            }
        }
    }
}
