//! Three-stage listing cascade: analysis -> price research -> persistence.
//!
//! Items wait in a FIFO queue per stage. Each wave the orchestrator fills
//! every stage up to its concurrency ceiling, waits for the whole wave to
//! come back and routes each item by its outcome: on to the next stage,
//! `done`, or a terminal `error` that stays put until `retry`. Queues and the
//! ledger are only touched under the orchestrator's lock; executors own their
//! item for the duration of a call and hand it back through `StageOutcome`.

pub mod collaborators;
pub mod config;
pub mod demo;
pub mod executor;
pub mod ledger;
pub mod queue;

#[cfg(test)]
pub(crate) mod testing;

use crate::models::{ItemId, OverallStage, ProgressRecord, Stage, StageStatus, WorkItem};
use config::CascadeConfig;
use executor::{Collaborators, StageExecutor, StageOutcome};
use ledger::{ProgressLedger, ProgressPatch, describe};
use queue::StageQueue;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, watch},
    task::{JoinError, JoinSet},
    time::sleep,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CascadeError {
    #[error("unknown item {0}")]
    UnknownItem(ItemId),
    #[error("item {item_id} is {state}; only finished items can be retried")]
    InvalidState { item_id: ItemId, state: String },
    #[error("item {0} was submitted more than once")]
    DuplicateItem(ItemId),
    #[error("batch contains no items")]
    EmptyBatch,
    #[error("batch has {count} items; the limit is {limit}")]
    BatchTooLarge { count: usize, limit: usize },
    #[error("batch was cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid transition for item {item_id}: {detail}")]
    InvalidTransition { item_id: ItemId, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDisposition {
    /// The item was reset and queued for analysis.
    Requeued,
    /// The item had already finished; nothing changed.
    AlreadyDone,
}

struct CascadeState {
    queues: [StageQueue; 3],
    in_flight: [usize; 3],
    ledger: ProgressLedger,
    running: bool,
    cancelled: bool,
    wave: u64,
}

impl CascadeState {
    fn new() -> Self {
        Self {
            queues: [StageQueue::new(), StageQueue::new(), StageQueue::new()],
            in_flight: [0; 3],
            ledger: ProgressLedger::new(),
            running: false,
            cancelled: false,
            wave: 0,
        }
    }

    fn is_drained(&self) -> bool {
        self.queues.iter().all(StageQueue::is_empty) && self.in_flight.iter().all(|n| *n == 0)
    }

    fn apply(&mut self, stage: Stage, outcome: StageOutcome) {
        let k = stage.index();
        self.in_flight[k] = self.in_flight[k].saturating_sub(1);

        let (item, status, failure) = match outcome {
            StageOutcome::Advance(item) => (item, StageStatus::Completed, None),
            StageOutcome::Skip(item) => (item, StageStatus::Skipped, None),
            StageOutcome::Fail(item, err) => (item, StageStatus::Error, Some(err)),
        };
        let id = item.id;

        let result = match (failure, stage.next()) {
            (Some(err), _) => self.ledger.update(
                id,
                ProgressPatch::default()
                    .stage(OverallStage::Error)
                    .status(stage, status)
                    .error(err.to_string())
                    .payload(item.payload),
            ),
            (None, Some(next)) => {
                let patched = self.ledger.update(
                    id,
                    ProgressPatch::default()
                        .stage(OverallStage::Queued(next))
                        .status(stage, status)
                        .payload(item.payload.clone()),
                );
                if patched.is_ok() {
                    self.queues[next.index()].enqueue(item);
                }
                patched
            }
            (None, None) => self.ledger.update(
                id,
                ProgressPatch::default()
                    .stage(OverallStage::Done)
                    .status(stage, status)
                    .progress(100)
                    .payload(item.payload),
            ),
        };

        match result {
            Ok(()) => debug!(
                target = "hermes.cascade",
                item_id = %id,
                stage = stage.as_str(),
                status = ?status,
                "stage_result_applied"
            ),
            Err(err) => error!(
                target = "hermes.cascade",
                item_id = %id,
                stage = stage.as_str(),
                error = %err,
                "stage_result_rejected"
            ),
        }
    }

    /// A stage task that panicked or was aborted leaves its item errored and
    /// retryable with the payload it had before the stage.
    fn contain_abort(&mut self, stage: Stage, id: ItemId, err: JoinError) {
        let k = stage.index();
        self.in_flight[k] = self.in_flight[k].saturating_sub(1);
        warn!(
            target = "hermes.cascade",
            item_id = %id,
            stage = stage.as_str(),
            error = %err,
            "stage_task_aborted"
        );
        if let Err(rejected) = self.ledger.update(
            id,
            ProgressPatch::default()
                .stage(OverallStage::Error)
                .status(stage, StageStatus::Error)
                .error(format!("{stage} task aborted: {err}")),
        ) {
            error!(
                target = "hermes.cascade",
                item_id = %id,
                stage = stage.as_str(),
                error = %rejected,
                "stage_result_rejected"
            );
        }
    }
}

struct Shared {
    config: Arc<CascadeConfig>,
    executor: StageExecutor,
    state: Mutex<CascadeState>,
    progress_tx: watch::Sender<Vec<ProgressRecord>>,
    idle_tx: watch::Sender<bool>,
}

/// Drives one batch through the cascade. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(config: CascadeConfig, collaborators: Collaborators) -> Result<Self, CascadeError> {
        config.validate().map_err(CascadeError::InvalidConfig)?;
        let config = Arc::new(config);
        let executor = StageExecutor::new(collaborators, config.clone());
        let (progress_tx, _) = watch::channel(Vec::new());
        let (idle_tx, _) = watch::channel(true);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                executor,
                state: Mutex::new(CascadeState::new()),
                progress_tx,
                idle_tx,
            }),
        })
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.shared.config
    }

    /// Seeds the analysis queue and the ledger, then starts the scheduling
    /// loop if it is not already running. Returns without waiting for the
    /// batch; observe it through `snapshot`, `subscribe` or `wait_idle`.
    pub async fn start(&self, items: Vec<WorkItem>) -> Result<(), CascadeError> {
        if items.is_empty() {
            return Err(CascadeError::EmptyBatch);
        }
        let mut state = self.shared.state.lock().await;
        if state.cancelled {
            return Err(CascadeError::Cancelled);
        }
        let mut seen = HashSet::new();
        for item in &items {
            if !seen.insert(item.id) || state.ledger.contains(item.id) {
                return Err(CascadeError::DuplicateItem(item.id));
            }
        }

        let count = items.len();
        for item in items {
            state.ledger.register(&item)?;
            state.queues[Stage::Analysis.index()].enqueue(item);
        }
        info!(
            target = "hermes.cascade",
            items = count,
            stage1_limit = self.shared.config.concurrency(Stage::Analysis),
            stage2_limit = self.shared.config.concurrency(Stage::Pricing),
            stage3_limit = self.shared.config.concurrency(Stage::Persistence),
            "batch_started"
        );
        self.publish(&state);
        self.ensure_running(&mut state);
        Ok(())
    }

    /// Re-enters an errored item at analysis. Finished items are left alone;
    /// items still queued or in flight are rejected.
    pub async fn retry(&self, id: ItemId) -> Result<RetryDisposition, CascadeError> {
        let mut state = self.shared.state.lock().await;
        if state.cancelled {
            return Err(CascadeError::Cancelled);
        }
        let record = state.ledger.get(id).ok_or(CascadeError::UnknownItem(id))?;
        match record.stage {
            OverallStage::Done => Ok(RetryDisposition::AlreadyDone),
            OverallStage::Error => {
                let item = state.ledger.reset(id)?;
                state.queues[Stage::Analysis.index()].enqueue(item);
                info!(target = "hermes.cascade", item_id = %id, "item_requeued");
                self.publish(&state);
                self.ensure_running(&mut state);
                Ok(RetryDisposition::Requeued)
            }
            other => Err(CascadeError::InvalidState {
                item_id: id,
                state: describe(other),
            }),
        }
    }

    /// Stops launching waves. Calls already in flight finish and are
    /// recorded; queued items stay queued.
    pub async fn cancel(&self) {
        let mut state = self.shared.state.lock().await;
        if !state.cancelled {
            state.cancelled = true;
            info!(target = "hermes.cascade", "batch_cancelled");
        }
    }

    pub async fn snapshot(&self) -> Vec<ProgressRecord> {
        self.shared.state.lock().await.ledger.snapshot()
    }

    pub async fn get(&self, id: ItemId) -> Option<ProgressRecord> {
        self.shared.state.lock().await.ledger.get(id)
    }

    /// Receives a fresh snapshot after every ledger change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ProgressRecord>> {
        self.shared.progress_tx.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.lock().await.running
    }

    pub async fn is_cancelled(&self) -> bool {
        self.shared.state.lock().await.cancelled
    }

    /// Resolves once the loop has drained or stopped after `cancel`.
    pub async fn wait_idle(&self) {
        let mut idle = self.shared.idle_tx.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    fn publish(&self, state: &CascadeState) {
        self.shared.progress_tx.send_replace(state.ledger.snapshot());
    }

    fn ensure_running(&self, state: &mut CascadeState) {
        if state.running {
            return;
        }
        state.running = true;
        self.shared.idle_tx.send_replace(false);
        let this = self.clone();
        tokio::spawn(async move { this.drive().await });
    }

    async fn drive(self) {
        let shared = &self.shared;
        loop {
            let mut tasks = JoinSet::new();
            let mut dispatched = HashMap::new();
            {
                let mut state = shared.state.lock().await;
                if state.cancelled || state.is_drained() {
                    state.running = false;
                    shared.idle_tx.send_replace(true);
                    info!(
                        target = "hermes.cascade",
                        waves = state.wave,
                        cancelled = state.cancelled,
                        "scheduling_loop_stopped"
                    );
                    return;
                }
                state.wave += 1;
                let wave = state.wave;

                for stage in Stage::ALL {
                    let k = stage.index();
                    let room = shared
                        .config
                        .concurrency(stage)
                        .saturating_sub(state.in_flight[k]);
                    for item in state.queues[k].dequeue_up_to(room) {
                        let id = item.id;
                        let claimed = state.ledger.update(
                            id,
                            ProgressPatch::default()
                                .stage(OverallStage::Processing(stage))
                                .status(stage, StageStatus::Processing)
                                .progress(stage.progress()),
                        );
                        if let Err(err) = claimed {
                            error!(
                                target = "hermes.cascade",
                                item_id = %id,
                                stage = stage.as_str(),
                                error = %err,
                                "dispatch_rejected"
                            );
                            continue;
                        }
                        state.in_flight[k] += 1;
                        let executor = shared.executor.clone();
                        let handle = tasks.spawn(async move { executor.execute(stage, item).await });
                        dispatched.insert(handle.id(), (stage, id));
                    }
                }
                crate::metrics::wave_dispatched(wave, tasks.len());
                debug!(
                    target = "hermes.cascade",
                    wave,
                    analysis = state.in_flight[0],
                    pricing = state.in_flight[1],
                    persistence = state.in_flight[2],
                    queued = state.queues.iter().map(StageQueue::len).sum::<usize>(),
                    "wave_dispatched"
                );
                self.publish(&state);
            }

            while let Some(joined) = tasks.join_next_with_id().await {
                let mut state = shared.state.lock().await;
                match joined {
                    Ok((task_id, outcome)) => {
                        if let Some((stage, _)) = dispatched.get(&task_id) {
                            state.apply(*stage, outcome);
                        }
                    }
                    Err(err) => {
                        if let Some((stage, id)) = dispatched.get(&err.id()) {
                            state.contain_abort(*stage, *id, err);
                        }
                    }
                }
                self.publish(&state);
            }

            let delay = shared.config.wave_delay();
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }
}
