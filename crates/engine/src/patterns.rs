use shared::domain::Grid;

pub const GLIDER: &str = ".#.\n..#\n###";
pub const BLOCK: &str = "##\n##";
pub const BLINKER: &str = "###";

/// Stamps `pattern` (`#` alive, anything else dead) with its top-left corner at
/// `(x, y)`, wrapping around the grid edges.
pub fn place(grid: &mut Grid, pattern: &str, x: usize, y: usize) {
    for (dy, line) in pattern.lines().enumerate() {
        for (dx, ch) in line.chars().enumerate() {
            let px = (x + dx) % grid.width();
            let py = (y + dy) % grid.height();
            grid.set(px, py, ch == '#');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glider_wraps_across_the_corner() {
        let mut grid = Grid::new(4, 4).expect("grid");
        place(&mut grid, GLIDER, 3, 3);
        assert_eq!(grid.alive_count(), 5);
        assert!(grid.is_alive(0, 3));
        assert!(grid.is_alive(3, 1) && grid.is_alive(0, 1) && grid.is_alive(1, 1));
    }
}
