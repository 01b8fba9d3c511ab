use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use shared::{
    error::ApiError,
    protocol::{WorkResult, WorkTask},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{worker} did not answer within {timeout:?}")]
    Timeout { worker: String, timeout: Duration },
    #[error("{worker} unreachable: {source}")]
    Transport {
        worker: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{worker} rejected the task: {error}")]
    Rejected { worker: String, error: ApiError },
    #[error("{worker} returned a mismatched result: {reason}")]
    Mismatch { worker: String, reason: String },
}

/// Something that can run one band of one turn. The broker only ever talks to
/// workers through this seam.
#[async_trait]
pub trait TurnExecutor: Send + Sync {
    fn label(&self) -> &str;

    async fn execute_turn(&self, task: &WorkTask) -> Result<WorkResult, DispatchError>;
}

/// Checks that a result answers exactly the task that was sent.
pub fn check_result(task: &WorkTask, result: &WorkResult) -> Result<(), String> {
    if result.turn != task.turn {
        return Err(format!(
            "turn {} answered with turn {}",
            task.turn, result.turn
        ));
    }
    if result.range != task.range {
        return Err(format!(
            "band {} answered with band {}",
            task.range, result.range
        ));
    }
    let expected = task.band.len();
    if result.width != task.width || result.band.len() != expected {
        return Err(format!(
            "band {} needs {expected} cells, got {}",
            task.range,
            result.band.len()
        ));
    }
    Ok(())
}

/// Worker reached over HTTP at `base_url`.
pub struct HttpWorker {
    http: Client,
    base_url: String,
}

impl HttpWorker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        self.http
            .get(format!("{}/healthz", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn transport(&self, source: impl Into<anyhow::Error>) -> DispatchError {
        DispatchError::Transport {
            worker: self.base_url.clone(),
            source: source.into(),
        }
    }
}

#[async_trait]
impl TurnExecutor for HttpWorker {
    fn label(&self) -> &str {
        &self.base_url
    }

    async fn execute_turn(&self, task: &WorkTask) -> Result<WorkResult, DispatchError> {
        let response = self
            .http
            .post(format!("{}/execute_turn", self.base_url))
            .json(task)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let error: ApiError = response.json().await.map_err(|e| self.transport(e))?;
            return Err(DispatchError::Rejected {
                worker: self.base_url.clone(),
                error,
            });
        }

        let response = response.error_for_status().map_err(|e| self.transport(e))?;
        response.json().await.map_err(|e| self.transport(e))
    }
}
