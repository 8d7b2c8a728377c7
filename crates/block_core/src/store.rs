//! The program store: authored slots for the active level plus cross-session
//! progress, written through to a [`KvStore`] after every mutation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::badge::{self, Badge};
use crate::error::StoreError;
use crate::events::{Event, EventBus};
use crate::grid::Pose;
use crate::kv::KvStore;
use crate::program::{parse_slot_id, Block, BlockIds, BlockTemplate, Slot};

/// Key of the persisted blob.
pub const STATE_KEY: &str = "blockCodingAppState";

/// Whether re-completing a level awards its XP again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardPolicy {
    #[default]
    EveryCompletion,
    FirstCompletionOnly,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Progress {
    pub xp: u64,
    pub badges: BTreeSet<String>,
    pub completed_levels: BTreeSet<u32>,
}

/// Everything persisted under [`STATE_KEY`]. Missing fields take defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SavedState {
    pub blocks: Vec<Slot>,
    pub character: Pose,
    pub current_level: u32,
    #[serde(flatten)]
    pub progress: Progress,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            character: Pose::default(),
            current_level: 1,
            progress: Progress::default(),
        }
    }
}

pub struct ProgramStore {
    state: SavedState,
    kv: Box<dyn KvStore>,
    ids: BlockIds,
    policy: RewardPolicy,
    bus: EventBus,
}

impl std::fmt::Debug for ProgramStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramStore")
            .field("state", &self.state)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ProgramStore {
    /// Open the store, hydrating from `kv`. Unreadable or corrupt blobs fall
    /// back to defaults.
    pub fn open(kv: Box<dyn KvStore>, policy: RewardPolicy, ids: BlockIds, bus: EventBus) -> Self {
        let state = hydrate(kv.as_ref());
        Self {
            state,
            kv,
            ids,
            policy,
            bus,
        }
    }

    pub fn state(&self) -> &SavedState {
        &self.state
    }

    pub fn blocks(&self) -> &[Slot] {
        &self.state.blocks
    }

    pub fn progress(&self) -> &Progress {
        &self.state.progress
    }

    pub fn character(&self) -> Pose {
        self.state.character
    }

    pub fn current_level(&self) -> u32 {
        self.state.current_level
    }

    pub fn policy(&self) -> RewardPolicy {
        self.policy
    }

    /// Put a new block in `slot`, replacing whatever was there. The program
    /// grows with empty slots as needed.
    pub fn assign(&mut self, slot: usize, template: BlockTemplate) -> Block {
        if self.state.blocks.len() <= slot {
            self.state.blocks.resize(slot + 1, None);
        }
        let block = template.into_block(self.ids.next(slot));
        self.state.blocks[slot] = Some(block.clone());
        self.bus.publish(Event::ProgramChanged { slot: Some(slot) });
        self.persist();
        block
    }

    /// [`assign`](Self::assign) addressed by a `slot-N` id; malformed or
    /// negative ids are ignored.
    pub fn assign_slot_id(&mut self, slot_id: &str, template: BlockTemplate) -> Option<usize> {
        let Some(slot) = parse_slot_id(slot_id) else {
            tracing::debug!(slot_id, "ignoring assignment to invalid slot id");
            return None;
        };
        self.assign(slot, template);
        Some(slot)
    }

    pub fn clear(&mut self, slot: usize) {
        if let Some(entry) = self.state.blocks.get_mut(slot) {
            *entry = None;
        }
        self.bus.publish(Event::ProgramChanged { slot: Some(slot) });
        self.persist();
    }

    pub fn clear_all(&mut self) {
        self.state.blocks.clear();
        self.bus.publish(Event::ProgramChanged { slot: None });
        self.persist();
    }

    /// Put the character back at `pose`, typically the level start.
    pub fn reset_character(&mut self, pose: Pose) {
        self.state.character = pose;
        self.persist();
    }

    /// Cache the character pose for display; persisted with the next write.
    pub fn update_character(&mut self, pose: Pose) {
        self.state.character = pose;
    }

    pub fn set_current_level(&mut self, level: u32) {
        self.state.current_level = level;
        self.persist();
    }

    /// Mark `level_id` complete and add `xp` according to the reward policy.
    /// Returns the badges this earned.
    pub fn record_completion(&mut self, level_id: u32, xp: u32) -> Vec<&'static Badge> {
        let first_time = self.state.progress.completed_levels.insert(level_id);
        let award = match self.policy {
            RewardPolicy::EveryCompletion => true,
            RewardPolicy::FirstCompletionOnly => first_time,
        };
        if award {
            self.state.progress.xp = self.state.progress.xp.saturating_add(u64::from(xp));
        }
        tracing::info!(level_id, xp, first_time, awarded = award, "level completed");
        let earned = self.earn_badges();
        self.persist();
        earned
    }

    /// Earn every badge whose predicate now holds.
    pub fn evaluate_badges(&mut self) -> Vec<&'static Badge> {
        let earned = self.earn_badges();
        if !earned.is_empty() {
            self.persist();
        }
        earned
    }

    fn earn_badges(&mut self) -> Vec<&'static Badge> {
        let earned = badge::newly_earned(&self.state.progress);
        for badge in &earned {
            self.state.progress.badges.insert(badge.id.to_string());
            tracing::info!(badge = badge.id, "badge earned");
            self.bus.publish(Event::BadgeEarned {
                badge: badge.id.to_string(),
                name: badge.name.to_string(),
            });
        }
        earned
    }

    /// Pretty JSON of the whole saved state.
    pub fn export_progress(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(&self.state)?)
    }

    /// Merge a previously exported document over the current state. Keys in
    /// the document replace the current values; the rest is kept.
    pub fn import_progress(&mut self, json: &str) -> bool {
        match merge_over(&self.state, json) {
            Ok(state) => {
                self.state = state;
                self.persist();
                true
            }
            Err(err) => {
                tracing::warn!(%err, "failed to import progress");
                false
            }
        }
    }

    pub fn reset_progress(&mut self) {
        self.state = SavedState::default();
        self.bus.publish(Event::ProgramChanged { slot: None });
        self.persist();
    }

    fn persist(&mut self) {
        let result = serde_json::to_string(&self.state)
            .map_err(StoreError::from)
            .and_then(|json| self.kv.set(STATE_KEY, &json));
        if let Err(err) = result {
            tracing::warn!(%err, "failed to persist program state; continuing in memory");
        }
    }
}

fn hydrate(kv: &dyn KvStore) -> SavedState {
    match kv.get(STATE_KEY) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(source) => {
                let err = StoreError::Corrupt {
                    key: STATE_KEY.to_string(),
                    source,
                };
                tracing::warn!(%err, "falling back to default state");
                SavedState::default()
            }
        },
        Ok(None) => SavedState::default(),
        Err(err) => {
            tracing::warn!(%err, "falling back to default state");
            SavedState::default()
        }
    }
}

fn merge_over(current: &SavedState, json: &str) -> Result<SavedState, serde_json::Error> {
    let imported: Value = serde_json::from_str(json)?;
    let mut merged = serde_json::to_value(current)?;
    if let (Value::Object(target), Value::Object(source)) = (&mut merged, imported) {
        target.extend(source);
    }
    serde_json::from_value(merged)
}
