use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Byte value of a live cell. Matches the white level of an 8-bit PGM.
pub const ALIVE: u8 = 255;
pub const DEAD: u8 = 0;

pub fn is_alive(cell: u8) -> bool {
    cell != DEAD
}

pub fn cell_byte(alive: bool) -> u8 {
    if alive {
        ALIVE
    } else {
        DEAD
    }
}

macro_rules! id_newtype {
    ($name:ident, $inner:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub $inner);
    };
}

id_newtype!(WorkerId, usize);
id_newtype!(RunId, Uuid);

impl RunId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Half-open row range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowRange {
    pub start: usize,
    pub end: usize,
}

impl RowRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl std::fmt::Display for RowRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPos {
    pub x: usize,
    pub y: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSummary {
    pub width: usize,
    pub height: usize,
    pub alive_count: usize,
    pub alive: Vec<CellPos>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GridError {
    #[error("grid dimensions must be non-zero, got {width}x{height}")]
    EmptyDimensions { width: usize, height: usize },
    #[error("grid of {width}x{height} needs {expected} cells, got {actual}")]
    CellCount {
        width: usize,
        height: usize,
        expected: usize,
        actual: usize,
    },
    #[error("grid of {width}x{height} does not fit in memory")]
    TooLarge { width: usize, height: usize },
}

/// Cell count of a non-empty `width`×`height` grid.
pub fn cell_count(width: usize, height: usize) -> Result<usize, GridError> {
    if width == 0 || height == 0 {
        return Err(GridError::EmptyDimensions { width, height });
    }
    width
        .checked_mul(height)
        .ok_or(GridError::TooLarge { width, height })
}

/// Row-major W×H cell buffer. Dimensions never change after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<u8>,
}

impl Grid {
    pub fn new(width: usize, height: usize) -> Result<Self, GridError> {
        let len = cell_count(width, height)?;
        Ok(Self {
            width,
            height,
            cells: vec![DEAD; len],
        })
    }

    pub fn from_cells(width: usize, height: usize, cells: Vec<u8>) -> Result<Self, GridError> {
        let expected = cell_count(width, height)?;
        if cells.len() != expected {
            return Err(GridError::CellCount {
                width,
                height,
                expected,
                actual: cells.len(),
            });
        }
        Ok(Self {
            width,
            height,
            cells,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    pub fn is_alive(&self, x: usize, y: usize) -> bool {
        is_alive(self.cells[y * self.width + x])
    }

    pub fn set(&mut self, x: usize, y: usize, alive: bool) {
        self.cells[y * self.width + x] = cell_byte(alive);
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.cells[y * self.width..(y + 1) * self.width]
    }

    pub fn rows(&self, range: RowRange) -> &[u8] {
        &self.cells[range.start * self.width..range.end * self.width]
    }

    pub fn alive_count(&self) -> usize {
        self.cells.iter().filter(|cell| is_alive(**cell)).count()
    }

    pub fn alive_cells(&self) -> Vec<CellPos> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| is_alive(**cell))
            .map(|(idx, _)| CellPos {
                x: idx % self.width,
                y: idx / self.width,
            })
            .collect()
    }

    pub fn summary(&self) -> GridSummary {
        let alive = self.alive_cells();
        GridSummary {
            width: self.width,
            height: self.height,
            alive_count: alive.len(),
            alive,
        }
    }
}
