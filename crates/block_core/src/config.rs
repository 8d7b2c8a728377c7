use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::engine::Pacing;
use crate::events::EventBus;
use crate::hint::HintSettings;
use crate::kv::{FileKv, KvStore, MemoryKv};
use crate::store::RewardPolicy;

/// Runtime configuration shared by the binaries. Every field has a default,
/// so an empty document is valid.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pacing: Pacing,
    pub reward_policy: RewardPolicy,
    pub hints: HintSettings,
    /// Directory for the persisted blob. `None` keeps state in memory.
    pub state_dir: Option<PathBuf>,
    pub event_capacity: usize,
    /// Seed for block id suffixes; entropy when absent.
    pub id_seed: Option<u64>,
    /// Countdown applied to grid-puzzle runs.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "puzzle_time_limit_ms")]
    pub puzzle_time_limit: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pacing: Pacing::default(),
            reward_policy: RewardPolicy::default(),
            hints: HintSettings::default(),
            state_dir: None,
            event_capacity: 256,
            id_seed: None,
            puzzle_time_limit: None,
        }
    }
}

impl Config {
    /// Load a config JSON document from disk.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open config file {:?}", path))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        serde_json::from_reader(reader).context("invalid config json")
    }

    pub fn event_bus(&self) -> EventBus {
        EventBus::new(self.event_capacity.max(1))
    }

    pub fn kv_store(&self) -> Box<dyn KvStore> {
        match &self.state_dir {
            Some(dir) => Box::new(FileKv::new(dir.clone())),
            None => Box::new(MemoryKv::new()),
        }
    }
}
