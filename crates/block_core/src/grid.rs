use serde::{Deserialize, Serialize};

/// Facing of a character on the grid. `Up` decreases `y`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    #[default]
    Right,
    Down,
    Left,
}

/// Rotation applied by a turn instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnDirection {
    Left,
    Right,
}

impl Direction {
    /// Facings in clockwise order.
    pub const CLOCKWISE: [Direction; 4] = [
        Direction::Up,
        Direction::Right,
        Direction::Down,
        Direction::Left,
    ];

    /// Rotate a quarter turn.
    pub fn turned(self, turn: TurnDirection) -> Self {
        let index = Self::CLOCKWISE
            .iter()
            .position(|direction| *direction == self)
            .unwrap_or(0);
        let next = match turn {
            TurnDirection::Right => (index + 1) % 4,
            TurnDirection::Left => (index + 3) % 4,
        };
        Self::CLOCKWISE[next]
    }

    /// Unit step in grid coordinates.
    pub fn delta(self) -> (i64, i64) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

impl Cell {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Grid dimensions. Accepts either a bare square size or `{width, height}` on input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "GridShape")]
pub struct GridSize {
    pub width: u32,
    pub height: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GridShape {
    Square(u32),
    Rect { width: u32, height: u32 },
}

impl From<GridShape> for GridSize {
    fn from(shape: GridShape) -> Self {
        match shape {
            GridShape::Square(size) => GridSize::square(size),
            GridShape::Rect { width, height } => GridSize { width, height },
        }
    }
}

impl GridSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, cell: Cell) -> bool {
        cell.x < self.width && cell.y < self.height
    }

    /// Neighbour of `cell` one step towards `direction`, or `None` when that
    /// would leave the grid.
    pub fn step(&self, cell: Cell, direction: Direction) -> Option<Cell> {
        let (dx, dy) = direction.delta();
        let x = i64::from(cell.x) + dx;
        let y = i64::from(cell.y) + dy;
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return None;
        }
        Some(Cell::new(x as u32, y as u32))
    }
}

/// Character cell plus facing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pose {
    pub x: u32,
    pub y: u32,
    #[serde(default)]
    pub direction: Direction,
}

impl Pose {
    pub fn new(x: u32, y: u32, direction: Direction) -> Self {
        Self { x, y, direction }
    }

    pub fn cell(&self) -> Cell {
        Cell::new(self.x, self.y)
    }

    pub fn at(cell: Cell, direction: Direction) -> Self {
        Self::new(cell.x, cell.y, direction)
    }

    pub fn turned(self, turn: TurnDirection) -> Self {
        Self {
            direction: self.direction.turned(turn),
            ..self
        }
    }

    /// Advance one cell forward. Returns the pose unchanged when the move
    /// would leave `bounds`, along with `false`.
    pub fn advanced(self, bounds: GridSize) -> (Self, bool) {
        match bounds.step(self.cell(), self.direction) {
            Some(cell) => (Self::at(cell, self.direction), true),
            None => (self, false),
        }
    }
}
