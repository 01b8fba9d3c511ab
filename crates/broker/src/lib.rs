//! Broker role: owns the authoritative grid, splits each turn into row bands,
//! fans them out to workers and commits the reassembled grid.

pub mod coordinator;
pub mod dispatch;
pub mod routes;
pub mod store;

pub use coordinator::{Broker, BrokerConfig, ControlError, RunError, RunOutcome, StartError};
pub use dispatch::{DispatchError, HttpWorker, TurnExecutor};
pub use routes::{build_router, DEFAULT_MAX_BODY_BYTES};
pub use store::{GridStore, MemoryStore, PgmStore, StoreError};
