use shared::{
    domain::{cell_count, Grid, GridError, RowRange},
    protocol::{WorkResult, WorkTask},
};
use thiserror::Error;

/// Splits `height` rows into `bands` contiguous ranges.
///
/// Every band gets `height / bands` rows and the first `height % bands` bands
/// get one more. When `bands > height` the trailing bands are empty.
pub fn partition_rows(height: usize, bands: usize) -> Vec<RowRange> {
    if bands == 0 {
        return Vec::new();
    }
    let base = height / bands;
    let extra = height % bands;

    let mut start = 0;
    (0..bands)
        .map(|i| {
            let rows = base + usize::from(i < extra);
            let range = RowRange::new(start, start + rows);
            start += rows;
            range
        })
        .collect()
}

/// Row indices of the halo above and below `range` on a torus of `height` rows.
pub fn halo_rows(height: usize, range: RowRange) -> (usize, usize) {
    ((range.start + height - 1) % height, range.end % height)
}

/// Copies a band and its halos out of the committed grid.
pub fn build_task(grid: &Grid, turn: u64, range: RowRange) -> WorkTask {
    let (above, below) = halo_rows(grid.height(), range);
    WorkTask {
        turn,
        range,
        width: grid.width(),
        band: grid.rows(range).to_vec(),
        halo_above: Some(grid.row(above).to_vec()),
        halo_below: Some(grid.row(below).to_vec()),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssembleError {
    #[error("result for turn {actual} does not belong to turn {expected}")]
    WrongTurn { expected: u64, actual: u64 },
    #[error("bands leave a gap or overlap at row {row}")]
    Coverage { row: usize },
    #[error("bands end at row {covered}, grid has {height} rows")]
    Incomplete { covered: usize, height: usize },
    #[error("band {range} has {actual} cells, expected {expected}")]
    BandLength {
        range: RowRange,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Merges one turn's results, in row order, into a fresh grid.
pub fn assemble(
    width: usize,
    height: usize,
    turn: u64,
    mut results: Vec<WorkResult>,
) -> Result<Grid, AssembleError> {
    results.sort_by_key(|result| (result.range.start, result.range.end));

    let mut cells = Vec::with_capacity(cell_count(width, height)?);
    let mut next_row = 0;
    for result in results {
        if result.turn != turn {
            return Err(AssembleError::WrongTurn {
                expected: turn,
                actual: result.turn,
            });
        }
        if result.range.start != next_row || result.range.end < result.range.start {
            return Err(AssembleError::Coverage { row: next_row });
        }
        let rows = result.range.len();
        let expected = rows
            .checked_mul(width)
            .ok_or(GridError::TooLarge { width, height: rows })?;
        if result.width != width || result.band.len() != expected {
            return Err(AssembleError::BandLength {
                range: result.range,
                expected,
                actual: result.band.len(),
            });
        }
        cells.extend_from_slice(&result.band);
        next_row = result.range.end;
    }

    if next_row != height {
        return Err(AssembleError::Incomplete {
            covered: next_row,
            height,
        });
    }
    Ok(Grid::from_cells(width, height, cells)?)
}

#[cfg(test)]
#[path = "tests/partition_tests.rs"]
mod tests;
