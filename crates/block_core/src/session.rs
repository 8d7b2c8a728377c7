//! One learner's play session: the run / evaluate / reward / advance loop
//! that sits between the presentation layer and the core services.

use std::time::Duration;

use serde::Serialize;

use crate::badge::Badge;
use crate::config::Config;
use crate::economy::{coins_for_xp, CoinSink, Wallet};
use crate::engine::{Engine, RunReport};
use crate::error::EngineError;
use crate::events::{Event, EventBus};
use crate::grid::Pose;
use crate::hint::{ErrorAnalysis, Hint, HintProvider, NoGenerator, TextGenerator};
use crate::io::catalog::Catalog;
use crate::kv::KvStore;
use crate::level::Level;
use crate::program::{occupied, BlockIds, BlockTemplate, InstructionKind};
use crate::puzzle::{PuzzleCommand, PuzzleLevel};
use crate::store::ProgramStore;
use crate::timer::Countdown;

/// What a finished block-level run produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub level: u32,
    pub attempt: u32,
    pub report: RunReport,
    pub xp_earned: u32,
    pub coins_earned: u32,
    pub badges: Vec<String>,
    /// Level made current after a success, if there was one to advance to.
    pub advanced_to: Option<u32>,
}

pub struct Session<S = Wallet, G = NoGenerator> {
    catalog: Catalog,
    store: ProgramStore,
    engine: Engine,
    hints: HintProvider<G>,
    sink: S,
    attempts: u32,
    bus: EventBus,
}

impl<S: CoinSink> Session<S, NoGenerator> {
    /// A session wired from `config` with the static hint table only.
    pub fn offline(config: &Config, catalog: Catalog, kv: Box<dyn KvStore>, sink: S) -> Self {
        let bus = config.event_bus();
        let store = ProgramStore::open(kv, config.reward_policy, BlockIds::new(config.id_seed), bus.clone());
        let engine = Engine::new(config.pacing, bus.clone());
        Self::new(catalog, store, engine, HintProvider::offline(config.hints), sink)
    }
}

impl<S: CoinSink, G: TextGenerator> Session<S, G> {
    pub fn new(catalog: Catalog, store: ProgramStore, engine: Engine, hints: HintProvider<G>, sink: S) -> Self {
        let bus = engine.bus().clone();
        Self {
            catalog,
            store,
            engine,
            hints,
            sink,
            attempts: 0,
            bus,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &ProgramStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ProgramStore {
        &mut self.store
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn coins(&self) -> &S {
        &self.sink
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The active level. A stored id the catalog does not know maps to the first level.
    pub fn level(&self) -> &Level {
        self.catalog.get_or_first(self.store.current_level())
    }

    /// Place a palette block in `slot` of the active level's program.
    pub fn assign(&mut self, slot: usize, template: BlockTemplate) -> bool {
        let max_blocks = self.level().max_blocks;
        if slot >= max_blocks {
            self.reject(format!("slot {slot} is beyond this level's {max_blocks} slots"));
            return false;
        }
        self.store.assign(slot, template);
        true
    }

    pub fn clear(&mut self, slot: usize) {
        self.store.clear(slot);
    }

    /// Empty the program and start counting attempts afresh.
    pub fn clear_all(&mut self) {
        self.store.clear_all();
        self.attempts = 0;
    }

    /// Switch levels, discarding the program and attempt count.
    pub fn select_level(&mut self, id: u32) -> Option<&Level> {
        let Some(start) = self.catalog.get(id).map(|level| level.start) else {
            self.reject(format!("unknown level {id}"));
            return None;
        };
        self.enter_level(id, start);
        self.catalog.get(id)
    }

    fn enter_level(&mut self, id: u32, start: Pose) {
        self.store.clear_all();
        self.store.set_current_level(id);
        self.store.reset_character(start);
        self.attempts = 0;
        self.bus.publish(Event::LevelChanged { level: id });
        tracing::info!(level = id, "level selected");
    }

    /// Run the authored program on the active level and settle the result.
    pub async fn run(&mut self) -> Result<RunSummary, EngineError> {
        let level = self.level().clone();
        if occupied(self.store.blocks()).next().is_none() {
            self.reject(EngineError::EmptyProgram.to_string());
            return Err(EngineError::EmptyProgram);
        }

        self.attempts += 1;
        self.store.reset_character(level.start);
        let program = self.store.blocks().to_vec();
        let report = match self.engine.run_level(&level, &program, None).await {
            Ok(report) => report,
            Err(err) => {
                self.reject(err.to_string());
                return Err(err);
            }
        };
        self.store.update_character(report.pose);

        let mut summary = RunSummary {
            level: level.id,
            attempt: self.attempts,
            report,
            xp_earned: 0,
            coins_earned: 0,
            badges: Vec::new(),
            advanced_to: None,
        };
        if !summary.report.outcome.is_success() {
            tracing::info!(level = level.id, attempt = self.attempts, outcome = %summary.report.outcome.message(), "run did not reach the goal");
            return Ok(summary);
        }

        let badges = self.store.record_completion(level.id, level.xp_reward);
        let coins = coins_for_xp(level.xp_reward);
        self.pay(coins);
        summary.xp_earned = level.xp_reward;
        summary.coins_earned = coins;
        summary.badges = badge_ids(&badges);
        self.attempts = 0;

        if let Some(next) = self.catalog.next_after(level.id) {
            let start = self.catalog.get_or_first(next).start;
            self.enter_level(next, start);
            summary.advanced_to = Some(next);
        }
        Ok(summary)
    }

    /// Run directional commands on a grid-puzzle level, optionally against a
    /// countdown. A success pays the level's reward.
    pub async fn run_puzzle(
        &mut self,
        level: &PuzzleLevel,
        commands: &[PuzzleCommand],
        time_limit: Option<Duration>,
    ) -> Result<RunReport, EngineError> {
        let (countdown, abort) = match time_limit {
            Some(limit) => {
                let (countdown, signal) = Countdown::start(limit, self.bus.clone());
                (Some(countdown), Some(signal))
            }
            None => (None, None),
        };
        let result = self.engine.run_puzzle(level, commands, abort).await;
        if let Some(countdown) = countdown {
            tracing::debug!(
                level = level.id,
                remaining_ms = countdown.remaining().as_millis() as u64,
                "puzzle run finished"
            );
        }
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                self.reject(err.to_string());
                return Err(err);
            }
        };
        if report.outcome.is_success() {
            self.pay(level.reward);
        }
        Ok(report)
    }

    /// Introduce the block kind the active level adds to the palette.
    pub async fn tutorial(&self) -> Hint {
        let level = self.level();
        let mut learned: Vec<InstructionKind> = Vec::new();
        for earlier in self.catalog.levels().iter().filter(|earlier| earlier.id < level.id) {
            for kind in &earlier.available_blocks {
                if !learned.contains(kind) {
                    learned.push(*kind);
                }
            }
        }
        let concept = level
            .available_blocks
            .iter()
            .copied()
            .find(|kind| !learned.contains(kind))
            .or_else(|| level.available_blocks.last().copied())
            .unwrap_or(InstructionKind::Move);
        let hint = self.hints.tutorial(concept, &learned).await;
        self.bus.publish(Event::HintReady {
            text: hint.text.clone(),
            source: hint.source,
        });
        hint
    }

    pub async fn hint(&self) -> Hint {
        let level = self.level();
        let hint = self
            .hints
            .hint(level, self.store.blocks(), self.store.character(), self.attempts)
            .await;
        self.bus.publish(Event::HintReady {
            text: hint.text.clone(),
            source: hint.source,
        });
        hint
    }

    /// Explain why the last run ended where it did.
    pub async fn diagnose(&self) -> ErrorAnalysis {
        let level = self.level();
        self.hints
            .analyze_error(self.store.blocks(), level.goal, self.store.character().cell())
            .await
    }

    fn pay(&mut self, coins: u32) {
        self.sink.earn_coins(coins);
        self.bus.publish(Event::CoinsEarned { amount: coins });
    }

    fn reject(&self, reason: String) {
        tracing::debug!(%reason, "request rejected");
        self.bus.publish(Event::Rejected { reason });
    }
}

fn badge_ids(badges: &[&'static Badge]) -> Vec<String> {
    badges.iter().map(|badge| badge.id.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Outcome, Pacing};
    use crate::events::drain;
    use crate::grid::{Direction, TurnDirection};
    use crate::kv::MemoryKv;
    use crate::hint::concept_intro;
    use crate::program::{Instruction, MAX_LOOP_COUNT};
    use crate::puzzle::builtin_levels;

    fn session() -> Session<Wallet> {
        let config = Config {
            pacing: Pacing::instant(),
            id_seed: Some(7),
            ..Config::default()
        };
        Session::offline(&config, Catalog::builtin().expect("catalog"), Box::new(MemoryKv::new()), Wallet::new())
    }

    fn template(instruction: Instruction) -> BlockTemplate {
        BlockTemplate::new(instruction)
    }

    #[tokio::test]
    async fn success_rewards_once_and_advances() {
        let mut session = session();
        let mut rx = session.bus().subscribe();
        session.assign(0, template(Instruction::Move));
        session.assign(1, template(Instruction::Move));

        let summary = session.run().await.expect("run");
        assert_eq!(summary.report.pose, Pose::new(2, 0, Direction::Right));
        assert_eq!(summary.report.outcome, Outcome::Success);
        assert_eq!(summary.xp_earned, 10);
        assert_eq!(summary.coins_earned, 5);
        assert_eq!(summary.badges, vec!["first-win".to_string()]);
        assert_eq!(summary.advanced_to, Some(2));

        assert_eq!(session.coins().payouts(), 1);
        assert_eq!(session.coins().balance(), 5);
        assert_eq!(session.store().progress().xp, 10);
        assert_eq!(session.level().id, 2);
        assert!(session.store().blocks().is_empty());
        assert_eq!(session.attempts(), 0);

        let coin_events = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, Event::CoinsEarned { .. }))
            .count();
        assert_eq!(coin_events, 1);
    }

    #[tokio::test]
    async fn oversized_loop_is_capped_on_assignment() {
        let mut session = session();
        let oversized = BlockTemplate {
            instruction: Instruction::Loop {
                count: u32::MAX,
                body: vec![Instruction::Move],
            },
            ..template(Instruction::repeat_move(None))
        };
        session.assign(0, oversized);
        let stored = session.store().blocks()[0].as_ref().expect("slot 0 filled");
        assert_eq!(stored.instruction, Instruction::repeat_move(Some(MAX_LOOP_COUNT)));

        let summary = session.run().await.expect("run");
        assert_eq!(summary.report.steps, MAX_LOOP_COUNT as usize);
        assert_eq!(summary.report.outcome, Outcome::GoalNotReached);
    }

    #[tokio::test]
    async fn tutorial_introduces_the_new_block_kind() {
        let mut session = session();
        let mut rx = session.bus().subscribe();
        let intro = session.tutorial().await;
        assert_eq!(intro.text, concept_intro(InstructionKind::Move));

        session.select_level(2);
        let intro = session.tutorial().await;
        assert_eq!(intro.text, concept_intro(InstructionKind::Turn));

        let ready = drain(&mut rx)
            .into_iter()
            .filter(|event| matches!(event, Event::HintReady { .. }))
            .count();
        assert_eq!(ready, 2);
    }

    #[tokio::test]
    async fn empty_program_changes_nothing() {
        let mut session = session();
        let err = session.run().await.expect_err("empty program");
        assert_eq!(err, EngineError::EmptyProgram);
        assert_eq!(session.attempts(), 0);
        assert_eq!(session.store().progress().xp, 0);
        assert_eq!(session.coins().payouts(), 0);
        assert_eq!(session.store().character(), Pose::default());
    }

    #[tokio::test]
    async fn failure_counts_attempts_and_feeds_hints() {
        let mut session = session();
        session.assign(0, template(Instruction::Move));
        for attempt in 1..=2 {
            let summary = session.run().await.expect("run");
            assert_eq!(summary.report.outcome, Outcome::GoalNotReached);
            assert_eq!(summary.attempt, attempt);
        }
        assert_eq!(session.store().character(), Pose::new(1, 0, Direction::Right));
        assert_eq!(session.coins().payouts(), 0);

        let hint = session.hint().await;
        assert_eq!(hint.text, crate::hint::fallback_hint(1, 2));
        let analysis = session.diagnose().await;
        assert_eq!(analysis.hint, "Go further right.");

        session.clear_all();
        assert_eq!(session.attempts(), 0);
    }

    #[tokio::test]
    async fn slots_beyond_the_level_limit_are_rejected() {
        let mut session = session();
        let max = session.level().max_blocks;
        assert!(!session.assign(max, template(Instruction::Move)));
        assert!(session.store().blocks().is_empty());
        assert!(session.assign(max - 1, template(Instruction::Move)));
    }

    #[tokio::test]
    async fn select_level_resets_the_workspace() {
        let mut session = session();
        session.assign(0, template(Instruction::Turn(TurnDirection::Left)));
        session.run().await.expect("run");
        assert_eq!(session.attempts(), 1);

        let start = session.select_level(3).map(|level| level.start).expect("level 3");
        assert_eq!(session.level().id, 3);
        assert_eq!(session.attempts(), 0);
        assert!(session.store().blocks().is_empty());
        assert_eq!(session.store().character(), start);
        assert!(session.select_level(99).is_none());
        assert_eq!(session.level().id, 3);
    }

    #[tokio::test]
    async fn last_level_does_not_advance() {
        let mut session = session();
        let last = session.catalog().len() as u32;
        session.select_level(last);
        // Level 5: (0,0) facing right to (4,4).
        session.assign(0, template(Instruction::repeat_move(Some(4))));
        session.assign(1, template(Instruction::Turn(TurnDirection::Right)));
        session.assign(2, template(Instruction::repeat_move(Some(4))));
        let summary = session.run().await.expect("run");
        assert!(summary.report.outcome.is_success());
        assert_eq!(summary.advanced_to, None);
        assert_eq!(session.level().id, last);
        assert_eq!(session.store().blocks().len(), 3);
    }

    #[tokio::test]
    async fn puzzle_success_pays_reward() {
        let mut session = session();
        let levels = builtin_levels().expect("puzzles");
        let first = &levels[0];
        let mut commands = vec![PuzzleCommand::Right; 4];
        commands.extend([PuzzleCommand::Down; 4]);
        let report = session.run_puzzle(first, &commands, None).await.expect("run");
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(session.coins().balance(), u64::from(first.reward));
        assert_eq!(session.coins().payouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn puzzle_countdown_expires_run() {
        let config = Config::default();
        let mut session = Session::offline(&config, Catalog::builtin().expect("catalog"), Box::new(MemoryKv::new()), Wallet::new());
        let levels = builtin_levels().expect("puzzles");
        let commands = vec![PuzzleCommand::Right; 4];
        let report = session
            .run_puzzle(&levels[0], &commands, Some(Duration::from_millis(700)))
            .await
            .expect("run");
        assert!(matches!(report.outcome, Outcome::TimeExpired { .. }));
        assert_eq!(session.coins().payouts(), 0);
    }
}
