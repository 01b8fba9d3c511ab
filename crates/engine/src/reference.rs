//! Single-process stepper over the whole torus. Used as the oracle the
//! distributed pipeline is checked against.

use shared::domain::Grid;

use crate::rule::next_state;

const OFFSETS: [isize; 3] = [-1, 0, 1];

pub fn step(grid: &Grid) -> Grid {
    let (width, height) = (grid.width() as isize, grid.height() as isize);
    let mut next = grid.clone();
    for y in 0..grid.height() {
        for x in 0..grid.width() {
            let mut live = 0u8;
            for dy in OFFSETS {
                for dx in OFFSETS {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (x as isize + dx).rem_euclid(width) as usize;
                    let ny = (y as isize + dy).rem_euclid(height) as usize;
                    if grid.is_alive(nx, ny) {
                        live += 1;
                    }
                }
            }
            next.set(x, y, next_state(grid.is_alive(x, y), live));
        }
    }
    next
}

pub fn simulate(grid: &Grid, turns: u64) -> Grid {
    (0..turns).fold(grid.clone(), |current, _| step(&current))
}
