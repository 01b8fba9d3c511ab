use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Utc;
use engine::{assemble, build_task, partition_rows};
use futures::future::join_all;
use shared::{
    domain::{Grid, RowRange, RunId, WorkerId},
    protocol::{
        BrokerEvent, ControlAck, ControlKind, RunState, StartRequest, StatusReport, WorkResult,
        WorkTask, WorkerStatus,
    },
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    dispatch::{check_result, DispatchError, TurnExecutor},
    store::{output_name, GridStore, StoreError},
};

const CONTROL_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Upper bound on a single worker call, per attempt.
    pub task_timeout: Duration,
    /// Period of `AliveCellsCount` events; zero disables them.
    pub status_interval: Duration,
    pub event_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(10),
            status_interval: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Error)]
#[error("run aborted after turn {last_committed_turn}: {message}")]
pub struct RunError {
    pub run_id: RunId,
    pub last_committed_turn: u64,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("a run is already in progress")]
    AlreadyRunning,
    #[error("{0}")]
    Invalid(String),
    #[error("no worker connections available")]
    NoWorkers,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("run task failed: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no run in progress")]
    NoActiveRun,
    #[error("save failed: {0}")]
    Save(#[from] StoreError),
    #[error("{0:?} arrived during the final turn and was not applied")]
    RunEnding(ControlKind),
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub turns_completed: u64,
    pub quit_early: bool,
    pub grid: Grid,
    pub saved_as: Option<String>,
}

struct ControlMsg {
    kind: ControlKind,
    reply: oneshot::Sender<Result<ControlAck, ControlError>>,
}

#[derive(Debug, Default)]
struct Progress {
    state: RunState,
    run_id: Option<RunId>,
    turn: u64,
    turns_requested: u64,
    alive_count: usize,
}

/// Owns the authoritative grid for the duration of a run, the worker
/// connections and the turn counter. One run at a time.
pub struct Broker {
    workers: Vec<Arc<dyn TurnExecutor>>,
    live: Mutex<Vec<bool>>,
    store: Arc<dyn GridStore>,
    config: BrokerConfig,
    events: broadcast::Sender<BrokerEvent>,
    control: Mutex<Option<mpsc::Sender<ControlMsg>>>,
    progress: Mutex<Progress>,
}

/// Releases the run slot when the run task ends, however it ends.
struct RunSlot {
    broker: Arc<Broker>,
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        lock(&self.broker.control).take();
        lock(&self.broker.progress).state = RunState::Idle;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Broker {
    pub fn new(
        workers: Vec<Arc<dyn TurnExecutor>>,
        store: Arc<dyn GridStore>,
        config: BrokerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            live: Mutex::new(vec![true; workers.len()]),
            workers,
            store,
            config,
            events,
            control: Mutex::new(None),
            progress: Mutex::new(Progress::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> StatusReport {
        let live = lock(&self.live).clone();
        let progress = lock(&self.progress);
        StatusReport {
            running: progress.state != RunState::Idle,
            state: progress.state,
            run_id: progress.run_id,
            turn: progress.turn,
            turns_requested: progress.turns_requested,
            alive_count: progress.alive_count,
            workers: self
                .workers
                .iter()
                .zip(live)
                .enumerate()
                .map(|(idx, (worker, live))| WorkerStatus {
                    worker: WorkerId(idx),
                    label: worker.label().to_string(),
                    live,
                })
                .collect(),
        }
    }

    /// Runs a whole game and returns once every requested turn is committed,
    /// a quit command is applied, or the run fails.
    ///
    /// The run executes on its own task, so dropping the returned future
    /// does not abandon the grid mid-turn.
    pub async fn start_game(self: &Arc<Self>, req: StartRequest) -> Result<RunOutcome, StartError> {
        if req.threads == 0 {
            return Err(StartError::Invalid("threads must be at least 1".into()));
        }
        if self.workers.is_empty() {
            return Err(StartError::NoWorkers);
        }

        let run_id = RunId::generate();
        let control_rx = {
            let mut slot = lock(&self.control);
            if slot.is_some() {
                warn!(image = %req.image_name, "broker: start rejected, run already in progress");
                return Err(StartError::AlreadyRunning);
            }
            let (tx, rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
            *slot = Some(tx);
            // Visible as running from the moment the slot is taken.
            *lock(&self.progress) = Progress {
                state: RunState::Executing,
                run_id: Some(run_id),
                turn: 0,
                turns_requested: req.turns,
                alive_count: 0,
            };
            rx
        };
        let slot = RunSlot {
            broker: Arc::clone(self),
        };

        let broker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _slot = slot;
            broker.run(run_id, req, control_rx).await
        });
        handle
            .await
            .map_err(|e| StartError::Internal(e.to_string()))?
    }

    /// Queues a control command for the turn loop and waits until it has been
    /// applied at the next turn boundary.
    pub async fn control(&self, kind: ControlKind) -> Result<ControlAck, ControlError> {
        let sender = lock(&self.control)
            .clone()
            .ok_or(ControlError::NoActiveRun)?;
        let (reply, ack) = oneshot::channel();
        sender
            .send(ControlMsg { kind, reply })
            .await
            .map_err(|_| ControlError::NoActiveRun)?;
        ack.await.map_err(|_| ControlError::NoActiveRun)?
    }

    async fn run(
        self: Arc<Self>,
        run_id: RunId,
        req: StartRequest,
        mut control: mpsc::Receiver<ControlMsg>,
    ) -> Result<RunOutcome, StartError> {
        let initial = self.store.load(&req.image_name).await?;
        let (width, height) = (initial.width(), initial.height());
        let bands = partition_rows(height, req.threads.min(height));

        lock(&self.live).iter_mut().for_each(|live| *live = true);
        lock(&self.progress).alive_count = initial.alive_count();
        info!(
            %run_id,
            image = %req.image_name,
            width,
            height,
            turns = req.turns,
            bands = bands.len(),
            workers = self.workers.len(),
            "broker: run started"
        );
        self.emit(BrokerEvent::RunStarted {
            run_id,
            width,
            height,
            turns: req.turns,
            bands: bands.len(),
            started_at: Utc::now(),
        });
        self.emit(BrokerEvent::StateChange {
            turn: 0,
            state: RunState::Executing,
        });
        let ticker = self.spawn_ticker();

        let mut grid = initial;
        let mut completed = 0u64;
        let mut quit_early = false;
        let result = loop {
            if completed >= req.turns {
                break Ok(());
            }
            if self.apply_controls(&mut control, &grid, completed).await {
                quit_early = true;
                break Ok(());
            }
            match self.run_turn(&grid, completed, &bands).await {
                Ok(next) => {
                    // Commit: the previous snapshot is dropped only now.
                    grid = next;
                    completed += 1;
                    let alive_count = grid.alive_count();
                    {
                        let mut progress = lock(&self.progress);
                        progress.turn = completed;
                        progress.alive_count = alive_count;
                    }
                    self.emit(BrokerEvent::TurnComplete {
                        turn: completed,
                        alive_count,
                    });
                }
                Err(message) => {
                    break Err(RunError {
                        run_id,
                        last_committed_turn: completed,
                        message,
                    })
                }
            }
        };
        if let Some(ticker) = ticker {
            ticker.abort();
        }
        self.drain_controls(&mut control, &grid, completed, result.is_ok()).await;

        if let Err(err) = result {
            error!(
                %run_id,
                last_committed_turn = err.last_committed_turn,
                error = %err.message,
                "broker: run failed"
            );
            self.emit(BrokerEvent::RunFailed {
                last_committed_turn: err.last_committed_turn,
                message: err.message.clone(),
            });
            return Err(err.into());
        }

        let saved_as = match self.save_snapshot(&grid, completed).await {
            Ok(name) => Some(name),
            Err(e) => {
                warn!(%run_id, error = %e, "broker: could not save final grid");
                None
            }
        };
        let alive_count = grid.alive_count();
        info!(%run_id, turns = completed, alive_count, quit_early, "broker: run complete");
        self.emit(BrokerEvent::FinalTurnComplete {
            turn: completed,
            alive_count,
            completed_at: Utc::now(),
        });

        Ok(RunOutcome {
            run_id,
            turns_completed: completed,
            quit_early,
            grid,
            saved_as,
        })
    }

    /// Applies queued control commands at a turn boundary. Blocks while
    /// paused. Returns `true` when the run should stop.
    async fn apply_controls(
        &self,
        control: &mut mpsc::Receiver<ControlMsg>,
        grid: &Grid,
        turn: u64,
    ) -> bool {
        let mut paused = false;
        loop {
            let msg = if paused {
                match control.recv().await {
                    Some(msg) => msg,
                    None => return false,
                }
            } else {
                match control.try_recv() {
                    Ok(msg) => msg,
                    Err(_) => return false,
                }
            };

            let reply = match msg.kind {
                ControlKind::Pause => {
                    if !paused {
                        paused = true;
                        self.set_state(turn, RunState::Paused);
                    }
                    Ok(ack(msg.kind, turn, RunState::Paused, None))
                }
                ControlKind::Resume => {
                    if paused {
                        paused = false;
                        self.set_state(turn, RunState::Executing);
                    }
                    Ok(ack(msg.kind, turn, RunState::Executing, None))
                }
                ControlKind::Save => {
                    let state = if paused {
                        RunState::Paused
                    } else {
                        RunState::Executing
                    };
                    self.save_snapshot(grid, turn)
                        .await
                        .map(|name| ack(msg.kind, turn, state, Some(name)))
                        .map_err(ControlError::from)
                }
                ControlKind::Quit => {
                    self.set_state(turn, RunState::Quitting);
                    let _ = msg
                        .reply
                        .send(Ok(ack(msg.kind, turn, RunState::Quitting, None)));
                    return true;
                }
            };
            let _ = msg.reply.send(reply);
        }
    }

    /// Answers commands that were queued while the last turn was in flight.
    /// `Save` and `Quit` are served against the final grid; anything else, or
    /// anything after a failed run, is refused.
    async fn drain_controls(
        &self,
        control: &mut mpsc::Receiver<ControlMsg>,
        grid: &Grid,
        turn: u64,
        succeeded: bool,
    ) {
        control.close();
        while let Ok(msg) = control.try_recv() {
            let state = lock(&self.progress).state;
            let reply = match msg.kind {
                ControlKind::Save if succeeded => self
                    .save_snapshot(grid, turn)
                    .await
                    .map(|name| ack(msg.kind, turn, state, Some(name)))
                    .map_err(ControlError::from),
                ControlKind::Quit if succeeded => {
                    Ok(ack(msg.kind, turn, RunState::Quitting, None))
                }
                kind => Err(ControlError::RunEnding(kind)),
            };
            let _ = msg.reply.send(reply);
        }
    }

    /// One full turn: fan out every band, wait for all of them, reassemble.
    async fn run_turn(&self, grid: &Grid, turn: u64, bands: &[RowRange]) -> Result<Grid, String> {
        let tasks: Vec<Arc<WorkTask>> = bands
            .iter()
            .map(|range| Arc::new(build_task(grid, turn, *range)))
            .collect();
        let worker_count = self.workers.len();
        let mut results: Vec<Option<WorkResult>> = vec![None; tasks.len()];
        // (band, preferred worker); band i starts on worker i mod n.
        let mut pending: Vec<(usize, usize)> =
            (0..tasks.len()).map(|band| (band, band % worker_count)).collect();

        let mut last_failure: Option<String> = None;

        while !pending.is_empty() {
            let live = lock(&self.live).clone();
            let assignments = pending
                .iter()
                .map(|&(band, preferred)| next_live(&live, preferred).map(|worker| (band, worker)))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    let mut message = format!(
                        "no live worker left to take {} band(s) of turn {turn}",
                        pending.len()
                    );
                    if let Some(reason) = &last_failure {
                        message.push_str(&format!(" (last failure: {reason})"));
                    }
                    message
                })?;

            let handles = assignments.iter().map(|&(band, worker)| {
                let executor = Arc::clone(&self.workers[worker]);
                let task = Arc::clone(&tasks[band]);
                let timeout = self.config.task_timeout;
                tokio::spawn(async move { dispatch_with_retry(executor.as_ref(), &task, timeout).await })
            });
            let outcomes = join_all(handles).await;

            pending.clear();
            for ((band, worker), outcome) in assignments.into_iter().zip(outcomes) {
                let reason = match outcome {
                    Ok(Ok(result)) => {
                        results[band] = Some(result);
                        continue;
                    }
                    Ok(Err(DispatchError::Rejected { worker: label, error })) => format!(
                        "{label} rejected band {} of turn {turn}: {error}",
                        tasks[band].range
                    ),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => format!("dispatch task failed: {e}"),
                };
                // A worker that refuses a band is treated like one that failed it.
                self.mark_dead(worker, turn, reason.clone());
                last_failure = Some(reason);
                pending.push((band, (worker + 1) % worker_count));
            }
        }

        let results = results.into_iter().flatten().collect();
        assemble(grid.width(), grid.height(), turn, results).map_err(|e| e.to_string())
    }

    fn mark_dead(&self, worker: usize, turn: u64, reason: String) {
        let newly_lost = {
            let mut live = lock(&self.live);
            std::mem::replace(&mut live[worker], false)
        };
        if newly_lost {
            warn!(
                worker = %self.workers[worker].label(),
                turn,
                %reason,
                "broker: worker lost, reassigning its bands"
            );
            self.emit(BrokerEvent::WorkerLost {
                worker: WorkerId(worker),
                turn,
                reason,
            });
        }
    }

    async fn save_snapshot(&self, grid: &Grid, turn: u64) -> Result<String, StoreError> {
        let name = output_name(grid, turn);
        self.store.save(&name, grid).await?;
        info!(name = %name, turn, "broker: grid saved");
        self.emit(BrokerEvent::GridSaved {
            turn,
            name: name.clone(),
        });
        Ok(name)
    }

    fn set_state(&self, turn: u64, state: RunState) {
        lock(&self.progress).state = state;
        info!(turn, ?state, "broker: state change");
        self.emit(BrokerEvent::StateChange { turn, state });
    }

    fn spawn_ticker(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.status_interval;
        if period.is_zero() {
            return None;
        }
        let broker = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let (turn, count) = {
                    let progress = lock(&broker.progress);
                    (progress.turn, progress.alive_count)
                };
                broker.emit(BrokerEvent::AliveCellsCount { turn, count });
            }
        }))
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }
}

fn ack(kind: ControlKind, turn: u64, state: RunState, saved_as: Option<String>) -> ControlAck {
    ControlAck {
        kind,
        turn,
        state,
        saved_as,
    }
}

/// First live worker at or after `preferred`, wrapping around.
fn next_live(live: &[bool], preferred: usize) -> Option<usize> {
    (0..live.len())
        .map(|offset| (preferred + offset) % live.len())
        .find(|&idx| live[idx])
}

async fn dispatch_with_retry(
    executor: &dyn TurnExecutor,
    task: &WorkTask,
    timeout: Duration,
) -> Result<WorkResult, DispatchError> {
    let first = match dispatch_once(executor, task, timeout).await {
        Ok(result) => return Ok(result),
        // A refusal is final for this worker; the band moves on without a retry.
        Err(rejected @ DispatchError::Rejected { .. }) => return Err(rejected),
        Err(e) => e,
    };
    warn!(
        worker = %executor.label(),
        turn = task.turn,
        band = %task.range,
        error = %first,
        "broker: dispatch failed, retrying once"
    );
    dispatch_once(executor, task, timeout).await
}

async fn dispatch_once(
    executor: &dyn TurnExecutor,
    task: &WorkTask,
    timeout: Duration,
) -> Result<WorkResult, DispatchError> {
    let result = tokio::time::timeout(timeout, executor.execute_turn(task))
        .await
        .map_err(|_| DispatchError::Timeout {
            worker: executor.label().to_string(),
            timeout,
        })??;
    check_result(task, &result).map_err(|reason| DispatchError::Mismatch {
        worker: executor.label().to_string(),
        reason,
    })?;
    Ok(result)
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
