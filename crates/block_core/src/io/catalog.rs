use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::CatalogError;
use crate::grid::Cell;
use crate::level::Level;

const BUILTIN_LEVELS: &str = include_str!("../../data/levels.json");

/// Ordered, validated list of block-coding levels.
#[derive(Clone, Debug, PartialEq)]
pub struct Catalog {
    levels: Vec<Level>,
}

impl Catalog {
    pub fn new(levels: Vec<Level>) -> Result<Self, CatalogError> {
        validate(&levels)?;
        Ok(Self { levels })
    }

    /// The catalog shipped with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_reader(BUILTIN_LEVELS.as_bytes()).context("builtin level catalog is invalid")
    }

    /// Load a catalog JSON document from disk.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open catalog {:?}", path))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Deserialize and validate a catalog from an arbitrary reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let levels: Vec<Level> = serde_json::from_reader(reader).context("invalid catalog json")?;
        Ok(Self::new(levels)?)
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Level> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.levels.get(index)
    }

    /// Level lookup that falls back to the first level for unknown ids.
    pub fn get_or_first(&self, id: u32) -> &Level {
        self.get(id).unwrap_or(&self.levels[0])
    }

    /// Id of the level after `id`, if any.
    pub fn next_after(&self, id: u32) -> Option<u32> {
        let next = id.checked_add(1)?;
        self.get(next).map(|level| level.id)
    }
}

fn validate(levels: &[Level]) -> Result<(), CatalogError> {
    if levels.is_empty() {
        return Err(CatalogError::Empty);
    }
    for (index, level) in levels.iter().enumerate() {
        let expected = index as u32 + 1;
        if level.id != expected {
            return Err(CatalogError::NonDenseId {
                expected,
                found: level.id,
            });
        }
        if level.grid.is_empty() {
            return Err(CatalogError::EmptyGrid { id: level.id });
        }
        check_cell(level, "start", level.start.cell())?;
        check_cell(level, "goal", level.goal)?;
    }
    Ok(())
}

fn check_cell(level: &Level, what: &'static str, cell: Cell) -> Result<(), CatalogError> {
    if level.grid.contains(cell) {
        return Ok(());
    }
    Err(CatalogError::OutOfBounds {
        id: level.id,
        what,
        x: cell.x,
        y: cell.y,
        width: level.grid.width,
        height: level.grid.height,
    })
}
