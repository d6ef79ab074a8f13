use crate::cascade::{
    CascadeError, Orchestrator, config::CascadeConfig, executor::Collaborators,
};
use crate::models::{BatchCreated, BatchRequest, BatchView, Payload, WorkItem};
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("unknown batch {0}")]
    UnknownBatch(Uuid),
    #[error("item {index}: payload must be a JSON object")]
    InvalidPayload { index: usize },
    #[error(transparent)]
    Cascade(#[from] CascadeError),
}

/// Every submitted batch and the orchestrator driving it.
#[derive(Clone)]
pub struct BatchRegistry {
    base: Arc<CascadeConfig>,
    collaborators: Collaborators,
    retention: usize,
    inner: Arc<Mutex<Batches>>,
}

#[derive(Default)]
struct Batches {
    by_id: HashMap<Uuid, Orchestrator>,
    order: VecDeque<Uuid>,
}

impl BatchRegistry {
    pub fn new(base: CascadeConfig, collaborators: Collaborators) -> Self {
        Self {
            base: Arc::new(base),
            collaborators,
            retention: retention_from_env(),
            inner: Arc::new(Mutex::new(Batches::default())),
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn base_config(&self) -> &CascadeConfig {
        &self.base
    }

    pub async fn submit(&self, request: BatchRequest) -> Result<BatchCreated, BatchError> {
        let count = request.items.len();
        if count == 0 {
            return Err(CascadeError::EmptyBatch.into());
        }
        if count > self.base.max_batch_items {
            return Err(CascadeError::BatchTooLarge {
                count,
                limit: self.base.max_batch_items,
            }
            .into());
        }

        let mut items = Vec::with_capacity(count);
        for (index, submitted) in request.items.into_iter().enumerate() {
            let Value::Object(fields) = submitted.payload else {
                return Err(BatchError::InvalidPayload { index });
            };
            items.push(WorkItem {
                id: submitted.id.unwrap_or_else(Uuid::new_v4),
                payload: Payload::new(fields),
            });
        }

        let config = match &request.config {
            Some(overrides) => self.base.apply(overrides),
            None => (*self.base).clone(),
        };
        let orchestrator = Orchestrator::new(config, self.collaborators.clone())?;
        let item_ids = items.iter().map(|item| item.id).collect::<Vec<_>>();
        orchestrator.start(items).await?;

        let batch_id = Uuid::new_v4();
        let mut batches = self.inner.lock().await;
        batches.by_id.insert(batch_id, orchestrator);
        batches.order.push_back(batch_id);
        self.evict(&mut batches).await;
        info!(target = "hermes.cascade", batch_id = %batch_id, items = count, "batch_submitted");

        Ok(BatchCreated { batch_id, item_ids })
    }

    pub async fn get(&self, batch_id: Uuid) -> Result<Orchestrator, BatchError> {
        self.inner
            .lock()
            .await
            .by_id
            .get(&batch_id)
            .cloned()
            .ok_or(BatchError::UnknownBatch(batch_id))
    }

    pub async fn view(&self, batch_id: Uuid) -> Result<BatchView, BatchError> {
        let orchestrator = self.get(batch_id).await?;
        Ok(BatchView {
            batch_id,
            running: orchestrator.is_running().await,
            cancelled: orchestrator.is_cancelled().await,
            items: orchestrator.snapshot().await,
        })
    }

    /// Drops the oldest idle batches once more than `retention` are held.
    /// Running batches are never dropped.
    async fn evict(&self, batches: &mut Batches) {
        let mut kept = VecDeque::with_capacity(batches.order.len());
        let mut excess = batches.order.len().saturating_sub(self.retention);
        while let Some(id) = batches.order.pop_front() {
            let idle = match batches.by_id.get(&id) {
                Some(orchestrator) => !orchestrator.is_running().await,
                None => continue,
            };
            if excess > 0 && idle {
                batches.by_id.remove(&id);
                excess -= 1;
                debug!(target = "hermes.cascade", batch_id = %id, "batch_evicted");
            } else {
                kept.push_back(id);
            }
        }
        batches.order = kept;
    }
}

fn retention_from_env() -> usize {
    std::env::var("BATCH_RETENTION")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256)
}
