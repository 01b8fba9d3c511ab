/// Conway's B3/S23 rule.
pub fn next_state(alive: bool, live_neighbours: u8) -> bool {
    match (alive, live_neighbours) {
        (true, 2) | (true, 3) => true, // survival
        (false, 3) => true,            // birth
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_rule_table_for_every_neighbour_count() {
        for n in 0..=8u8 {
            assert_eq!(next_state(true, n), n == 2 || n == 3, "live cell, {n} neighbours");
            assert_eq!(next_state(false, n), n == 3, "dead cell, {n} neighbours");
        }
    }
}
