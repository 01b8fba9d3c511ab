use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{GridSummary, RowRange, RunId, WorkerId},
    error::ApiError,
};

/// One band of one turn, sent from the broker to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkTask {
    pub turn: u64,
    pub range: RowRange,
    pub width: usize,
    #[serde(with = "crate::codec::b64")]
    pub band: Vec<u8>,
    #[serde(default, with = "crate::codec::b64_opt")]
    pub halo_above: Option<Vec<u8>>,
    #[serde(default, with = "crate::codec::b64_opt")]
    pub halo_below: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
    pub turn: u64,
    pub range: RowRange,
    pub width: usize,
    #[serde(with = "crate::codec::b64")]
    pub band: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub image_name: String,
    pub turns: u64,
    pub threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub turns_completed: u64,
    #[serde(default)]
    pub quit_early: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<GridSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Pause,
    Resume,
    Save,
    Quit,
}

impl std::str::FromStr for ControlKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "save" => Ok(Self::Save),
            "quit" => Ok(Self::Quit),
            other => Err(format!("unknown control command '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub kind: ControlKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Executing,
    Paused,
    Quitting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlAck {
    pub kind: ControlKind,
    /// Last committed turn at the moment the command was applied.
    pub turn: u64,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_as: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker: WorkerId,
    pub label: String,
    pub live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub running: bool,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub turn: u64,
    pub turns_requested: u64,
    pub alive_count: usize,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BrokerEvent {
    RunStarted {
        run_id: RunId,
        width: usize,
        height: usize,
        turns: u64,
        bands: usize,
        started_at: DateTime<Utc>,
    },
    TurnComplete {
        turn: u64,
        alive_count: usize,
    },
    AliveCellsCount {
        turn: u64,
        count: usize,
    },
    StateChange {
        turn: u64,
        state: RunState,
    },
    GridSaved {
        turn: u64,
        name: String,
    },
    WorkerLost {
        worker: WorkerId,
        turn: u64,
        reason: String,
    },
    FinalTurnComplete {
        turn: u64,
        alive_count: usize,
        completed_at: DateTime<Utc>,
    },
    RunFailed {
        last_committed_turn: u64,
        message: String,
    },
}
