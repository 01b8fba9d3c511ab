//! Game of Life compute engine: the transition rule, row-band partitioning,
//! per-band turn execution and a single-process reference stepper.

pub mod partition;
pub mod patterns;
pub mod reference;
pub mod rule;
pub mod turn;

pub use partition::{assemble, build_task, halo_rows, partition_rows, AssembleError};
pub use rule::next_state;
pub use turn::{execute_turn, HaloSide, TaskError};
