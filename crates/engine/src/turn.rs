use shared::{
    domain::{cell_byte, is_alive},
    protocol::{WorkResult, WorkTask},
};
use thiserror::Error;

use crate::rule::next_state;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaloSide {
    Above,
    Below,
}

impl std::fmt::Display for HaloSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Above => f.write_str("above"),
            Self::Below => f.write_str("below"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("task width must be non-zero")]
    ZeroWidth,
    #[error("row range [{start}, {end}) is inverted")]
    InvertedRange { start: usize, end: usize },
    #[error("band for {rows} rows of width {width} needs {expected} cells, got {actual}")]
    BandLength {
        rows: usize,
        width: usize,
        expected: usize,
        actual: usize,
    },
    #[error("band of {rows} rows of width {width} is too large")]
    Oversized { rows: usize, width: usize },
    #[error("halo row {0} the band is missing")]
    MissingHalo(HaloSide),
    #[error("halo row {side} has {actual} cells, expected {expected}")]
    HaloWidth {
        side: HaloSide,
        expected: usize,
        actual: usize,
    },
}

/// Advances one band by a single turn.
///
/// Rows outside the band are read from the halos; columns wrap within each
/// row. The result carries the task's turn and row range unchanged, which is
/// what the broker checks before merging it.
pub fn execute_turn(task: &WorkTask) -> Result<WorkResult, TaskError> {
    let (above, below) = validate(task)?;
    let width = task.width;
    let rows = task.range.len();
    let mut next = vec![0u8; rows * width];

    for r in 0..rows {
        let current = &task.band[r * width..(r + 1) * width];
        let north = if r == 0 {
            above
        } else {
            &task.band[(r - 1) * width..r * width]
        };
        let south = if r + 1 == rows {
            below
        } else {
            &task.band[(r + 1) * width..(r + 2) * width]
        };

        for x in 0..width {
            let west = (x + width - 1) % width;
            let east = (x + 1) % width;
            let live = [
                north[west],
                north[x],
                north[east],
                current[west],
                current[east],
                south[west],
                south[x],
                south[east],
            ]
            .iter()
            .filter(|cell| is_alive(**cell))
            .count() as u8;

            next[r * width + x] = cell_byte(next_state(is_alive(current[x]), live));
        }
    }

    Ok(WorkResult {
        turn: task.turn,
        range: task.range,
        width,
        band: next,
    })
}

fn validate(task: &WorkTask) -> Result<(&[u8], &[u8]), TaskError> {
    if task.width == 0 {
        return Err(TaskError::ZeroWidth);
    }
    if task.range.end < task.range.start {
        return Err(TaskError::InvertedRange {
            start: task.range.start,
            end: task.range.end,
        });
    }
    let rows = task.range.len();
    let expected = rows.checked_mul(task.width).ok_or(TaskError::Oversized {
        rows,
        width: task.width,
    })?;
    if task.band.len() != expected {
        return Err(TaskError::BandLength {
            rows,
            width: task.width,
            expected,
            actual: task.band.len(),
        });
    }
    let above = halo(task.halo_above.as_deref(), HaloSide::Above, task.width)?;
    let below = halo(task.halo_below.as_deref(), HaloSide::Below, task.width)?;
    Ok((above, below))
}

fn halo(row: Option<&[u8]>, side: HaloSide, width: usize) -> Result<&[u8], TaskError> {
    let row = row.ok_or(TaskError::MissingHalo(side))?;
    if row.len() != width {
        return Err(TaskError::HaloWidth {
            side,
            expected: width,
            actual: row.len(),
        });
    }
    Ok(row)
}

#[cfg(test)]
#[path = "tests/turn_tests.rs"]
mod tests;
