use super::CascadeError;
use crate::models::{
    ItemId, OverallStage, Payload, ProgressRecord, Stage, StageStatus, StageStatuses, WorkItem,
};
use chrono::Utc;
use std::collections::HashMap;

/// Partial update applied to one record. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub stage: Option<OverallStage>,
    pub stage_status: Option<(Stage, StageStatus)>,
    pub progress: Option<u8>,
    pub last_error: Option<String>,
    pub payload: Option<Payload>,
}

impl ProgressPatch {
    pub fn stage(mut self, stage: OverallStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn status(mut self, stage: Stage, status: StageStatus) -> Self {
        self.stage_status = Some((stage, status));
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(message.into());
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Caller-visible status of every item in a batch, in submission order.
#[derive(Debug, Default)]
pub struct ProgressLedger {
    records: HashMap<ItemId, ProgressRecord>,
    order: Vec<ItemId>,
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, item: &WorkItem) -> Result<(), CascadeError> {
        if self.records.contains_key(&item.id) {
            return Err(CascadeError::DuplicateItem(item.id));
        }
        self.records
            .insert(item.id, ProgressRecord::submitted(item));
        self.order.push(item.id);
        Ok(())
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn get(&self, id: ItemId) -> Option<ProgressRecord> {
        self.records.get(&id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ProgressRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect()
    }

    /// Validates the whole patch before touching the record, so a rejected
    /// patch leaves it unchanged.
    pub fn update(&mut self, id: ItemId, patch: ProgressPatch) -> Result<(), CascadeError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(CascadeError::UnknownItem(id))?;

        if let Some(next) = patch.stage
            && record.stage.is_terminal()
            && next != record.stage
        {
            return Err(CascadeError::InvalidTransition {
                item_id: id,
                detail: format!("{:?} is terminal; cannot move to {next:?}", record.stage),
            });
        }
        if let Some((stage, status)) = patch.stage_status {
            let current = record.stage_statuses.get(stage);
            if !current.can_transition_to(status) {
                return Err(CascadeError::InvalidTransition {
                    item_id: id,
                    detail: format!("{stage} cannot go from {current:?} to {status:?}"),
                });
            }
        }

        if let Some(stage) = patch.stage {
            record.stage = stage;
        }
        if let Some((stage, status)) = patch.stage_status {
            record.stage_statuses.set(stage, status);
        }
        if let Some(progress) = patch.progress {
            record.progress = record.progress.max(progress.min(100));
        }
        if let Some(message) = patch.last_error {
            record.last_error = Some(message);
        }
        if let Some(payload) = patch.payload {
            record.payload = payload;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Puts an errored item back at the start of the cascade and hands back
    /// the item to enqueue.
    pub fn reset(&mut self, id: ItemId) -> Result<WorkItem, CascadeError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(CascadeError::UnknownItem(id))?;
        if record.stage != OverallStage::Error {
            return Err(CascadeError::InvalidState {
                item_id: id,
                state: describe(record.stage),
            });
        }
        record.stage = OverallStage::Queued(Stage::Analysis);
        record.stage_statuses = StageStatuses::default();
        record.progress = 0;
        record.last_error = None;
        record.updated_at = Utc::now();
        Ok(WorkItem {
            id,
            payload: record.payload.clone(),
        })
    }
}

pub(crate) fn describe(stage: OverallStage) -> String {
    match stage {
        OverallStage::Queued(stage) => format!("queued for {stage}"),
        OverallStage::Processing(stage) => format!("processing {stage}"),
        OverallStage::Done => "done".into(),
        OverallStage::Error => "error".into(),
    }
}
