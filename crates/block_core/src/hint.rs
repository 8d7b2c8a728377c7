//! Hints for a stuck learner.
//!
//! A static table always answers. When a [`TextGenerator`] is injected, the
//! provider asks it first and falls back to the table on timeout, failure or
//! blank output. Only one generation is in flight at a time; a request that
//! arrives meanwhile is answered from the table.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tokio::sync::Mutex;

use crate::error::GenerateError;
use crate::grid::{Cell, Pose};
use crate::level::Level;
use crate::program::{occupied, InstructionKind, Slot};

const FALLBACK_HINTS: [(u32, [&str; 3]); 5] = [
    (
        1,
        [
            "Try using the move forward block.",
            "Count how many squares away the goal is.",
            "Using move forward twice will get you there.",
        ],
    ),
    (
        2,
        [
            "You need to change direction first.",
            "Turn left, then try moving forward.",
            "The turn blocks change which way the character faces.",
        ],
    ),
    (
        3,
        [
            "Move like you are climbing stairs.",
            "Go forward, then go up, and repeat.",
            "Alternate turning and moving.",
        ],
    ),
    (
        4,
        [
            "You need to go around the obstacle.",
            "When you hit a wall, look for another path.",
            "Think about a route that goes up or down around it.",
        ],
    ),
    (
        5,
        [
            "Are you doing the same thing several times?",
            "The repeat block makes this much shorter.",
            "Drawing a square means doing the same thing four times.",
        ],
    ),
];

const GENERIC_HINT: &str = "Check the order of your blocks again.";

pub const HINT_SYSTEM_PROMPT: &str = "You are a friendly coding tutor for elementary school students.
- Give hints in simple, easy to understand language.
- Do not give the answer away; lead the student to think it through.
- Answer in two or three short sentences.
- Keep an encouraging, positive tone.";

pub const ERROR_ANALYSIS_SYSTEM_PROMPT: &str = "You analyze mistakes in a student's block program.
Reply only with JSON of the form:
{\"issue\": \"one sentence summary\", \"concept\": \"the missed concept\", \"hint\": \"one sentence hint for the next try\"}";

pub const TUTORIAL_SYSTEM_PROMPT: &str = "You introduce a new coding concept to elementary school students.
Explain it so a young student can follow, with a friendly and playful comparison.";

/// Static hint for `level_id`, more specific as `attempts` grows.
pub fn fallback_hint(level_id: u32, attempts: u32) -> &'static str {
    let Some((_, hints)) = FALLBACK_HINTS.iter().find(|(id, _)| *id == level_id) else {
        return GENERIC_HINT;
    };
    let index = (attempts.max(1) as usize - 1).min(hints.len() - 1);
    hints[index]
}

/// Which way the character still has to go to reach `goal`.
pub fn position_feedback(goal: Cell, actual: Cell) -> &'static str {
    let dx = i64::from(goal.x) - i64::from(actual.x);
    let dy = i64::from(goal.y) - i64::from(actual.y);
    if dx == 0 && dy == 0 {
        "You reached the goal!"
    } else if dx.abs() > dy.abs() {
        if dx > 0 {
            "Go further right."
        } else {
            "Go further left."
        }
    } else if dy > 0 {
        "Go further down."
    } else {
        "Go further up."
    }
}

/// One-line introduction to a block kind, used when nothing better is available.
pub fn concept_intro(concept: InstructionKind) -> &'static str {
    match concept {
        InstructionKind::Move => "The move block walks the character one square the way it is facing.",
        InstructionKind::Turn => "Turn blocks spin the character left or right without moving it.",
        InstructionKind::Loop => {
            "The repeat block runs the blocks inside it several times, like counting out jumping jacks."
        }
    }
}

pub fn tutorial_prompt(concept: InstructionKind, learned: &[InstructionKind]) -> String {
    let learned: Vec<&str> = learned.iter().map(InstructionKind::as_str).collect();
    let learned = if learned.is_empty() {
        "none".to_string()
    } else {
        learned.join(", ")
    };
    format!(
        "New concept: \"{concept}\"\n\
         Concepts learned so far: {learned}\n\n\
         Write a short tutorial introducing this concept to an elementary school student:\n\
         1. Explain the concept in two or three sentences\n\
         2. Give an everyday comparison\n\
         3. Show a simple example",
        concept = concept.as_str(),
    )
}

pub fn hint_prompt(level: &Level, program: &[Slot], pose: Pose, attempts: u32) -> String {
    let used: Vec<&str> = occupied(program)
        .map(|(_, block)| block.instruction.kind().as_str())
        .collect();
    let used = if used.is_empty() {
        "none".to_string()
    } else {
        used.join(", ")
    };
    format!(
        "Level {id}: {title}\n\
         Description: {description}\n\
         Goal: ({gx}, {gy})\n\n\
         Blocks used: {used}\n\
         Character position: ({x}, {y})\n\
         Attempts: {attempts}\n\n\
         The student failed on attempt {attempts}.\n\
         Give a helpful hint:",
        id = level.id,
        title = level.title,
        description = level.description,
        gx = level.goal.x,
        gy = level.goal.y,
        x = pose.x,
        y = pose.y,
    )
}

fn error_analysis_prompt(program: &[Slot], goal: Cell, actual: Cell) -> String {
    let sequence: Vec<String> = occupied(program)
        .map(|(_, block)| format!("{} {}", block.icon, block.label))
        .collect();
    format!(
        "Block order: {}\nGoal: ({}, {})\nActual position: ({}, {})\n\n\
         Explain which concept the student misunderstood, as JSON.",
        sequence.join(" -> "),
        goal.x,
        goal.y,
        actual.x,
        actual.y,
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintSource {
    Static,
    Generated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Hint {
    pub text: String,
    pub source: HintSource,
}

impl Hint {
    pub fn fallback(level_id: u32, attempts: u32) -> Self {
        Self {
            text: fallback_hint(level_id, attempts).to_string(),
            source: HintSource::Static,
        }
    }
}

/// Structured diagnosis of a failed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub issue: String,
    pub concept: String,
    pub hint: String,
}

impl ErrorAnalysis {
    pub fn fallback(goal: Cell, actual: Cell) -> Self {
        Self {
            issue: "The character ended somewhere other than the goal.".to_string(),
            concept: "block order".to_string(),
            hint: position_feedback(goal, actual).to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
}

/// A text-generation service. Implementations make a single attempt.
pub trait TextGenerator: Send + Sync {
    fn generate(
        &self,
        request: GenerationRequest,
    ) -> impl Future<Output = Result<String, GenerateError>> + Send;
}

/// Stand-in for a missing service.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoGenerator;

impl TextGenerator for NoGenerator {
    async fn generate(&self, _request: GenerationRequest) -> Result<String, GenerateError> {
        Err(GenerateError::Unavailable)
    }
}

#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HintSettings {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "timeout_ms")]
    pub timeout: Duration,
    pub max_tokens: u32,
}

impl Default for HintSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_tokens: 100,
        }
    }
}

#[derive(Debug)]
pub struct HintProvider<G = NoGenerator> {
    generator: Option<G>,
    settings: HintSettings,
    in_flight: Mutex<()>,
}

impl HintProvider<NoGenerator> {
    /// A provider that only ever answers from the static table.
    pub fn offline(settings: HintSettings) -> Self {
        Self {
            generator: None,
            settings,
            in_flight: Mutex::new(()),
        }
    }
}

impl<G: TextGenerator> HintProvider<G> {
    pub fn with_generator(generator: G, settings: HintSettings) -> Self {
        Self {
            generator: Some(generator),
            settings,
            in_flight: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> HintSettings {
        self.settings
    }

    pub async fn hint(&self, level: &Level, program: &[Slot], pose: Pose, attempts: u32) -> Hint {
        let request = GenerationRequest {
            prompt: hint_prompt(level, program, pose, attempts),
            system_prompt: Some(HINT_SYSTEM_PROMPT.to_string()),
            max_tokens: self.settings.max_tokens,
        };
        match self.ask(request).await {
            Ok(text) => Hint {
                text,
                source: HintSource::Generated,
            },
            Err(err) => {
                if err != GenerateError::Unavailable {
                    tracing::warn!(%err, level = level.id, attempts, "hint generation failed; using static hint");
                }
                Hint::fallback(level.id, attempts)
            }
        }
    }

    /// Introduce `concept` to a learner who already knows `learned`.
    pub async fn tutorial(&self, concept: InstructionKind, learned: &[InstructionKind]) -> Hint {
        let request = GenerationRequest {
            prompt: tutorial_prompt(concept, learned),
            system_prompt: Some(TUTORIAL_SYSTEM_PROMPT.to_string()),
            max_tokens: self.settings.max_tokens.saturating_mul(2),
        };
        match self.ask(request).await {
            Ok(text) => Hint {
                text,
                source: HintSource::Generated,
            },
            Err(err) => {
                if err != GenerateError::Unavailable {
                    tracing::warn!(%err, concept = concept.as_str(), "tutorial generation failed; using static intro");
                }
                Hint {
                    text: concept_intro(concept).to_string(),
                    source: HintSource::Static,
                }
            }
        }
    }

    /// Diagnose a failed run. Unparseable replies fall back to a positional nudge.
    pub async fn analyze_error(&self, program: &[Slot], goal: Cell, actual: Cell) -> ErrorAnalysis {
        let request = GenerationRequest {
            prompt: error_analysis_prompt(program, goal, actual),
            system_prompt: Some(ERROR_ANALYSIS_SYSTEM_PROMPT.to_string()),
            max_tokens: self.settings.max_tokens.saturating_mul(3) / 2,
        };
        let parsed = self.ask(request).await.and_then(|text| parse_analysis(&text));
        match parsed {
            Ok(analysis) => analysis,
            Err(err) => {
                if err != GenerateError::Unavailable {
                    tracing::warn!(%err, "error analysis failed; using positional feedback");
                }
                ErrorAnalysis::fallback(goal, actual)
            }
        }
    }

    async fn ask(&self, request: GenerationRequest) -> Result<String, GenerateError> {
        let generator = self.generator.as_ref().ok_or(GenerateError::Unavailable)?;
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!("generation already in flight");
            return Err(GenerateError::Unavailable);
        };
        let timeout = self.settings.timeout;
        let text = tokio::time::timeout(timeout, generator.generate(request))
            .await
            .map_err(|_| GenerateError::Timeout(timeout))??;
        let text = text.trim();
        if text.is_empty() {
            return Err(GenerateError::Malformed("empty response".to_string()));
        }
        Ok(text.to_string())
    }
}

fn parse_analysis(text: &str) -> Result<ErrorAnalysis, GenerateError> {
    let json = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => return Err(GenerateError::Malformed("no JSON object in reply".to_string())),
    };
    serde_json::from_str(json).map_err(|err| GenerateError::Malformed(err.to_string()))
}
