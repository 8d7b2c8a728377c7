//! Error types shared across the block-program core.

use std::time::Duration;

use thiserror::Error;

/// Reasons the execution engine refuses to start a run.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("program has no instructions to run")]
    EmptyProgram,

    #[error("a run is already in progress")]
    ConcurrentRun,
}

/// Failures talking to the key-value blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stored blob under {key} is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Problems found while validating a level catalog.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog contains no levels")]
    Empty,

    #[error("level ids must be dense from 1: expected {expected}, found {found}")]
    NonDenseId { expected: u32, found: u32 },

    #[error("level {id} has an empty grid")]
    EmptyGrid { id: u32 },

    #[error("level {id}: {what} ({x}, {y}) lies outside the {width}x{height} grid")]
    OutOfBounds {
        id: u32,
        what: &'static str,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
}

/// Rejections raised while decoding a persisted block.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("unknown block type {0:?}")]
    UnknownType(String),

    #[error("turn block {0} has no direction")]
    MissingDirection(String),

    #[error("loop block {0} nests too deeply")]
    LoopTooDeep(String),
}

/// Failures of the optional text-generation capability.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GenerateError {
    #[error("text generation is not available")]
    Unavailable,

    #[error("text generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("text generation returned unusable output: {0}")]
    Malformed(String),

    #[error("text generation failed: {0}")]
    Failed(String),
}
