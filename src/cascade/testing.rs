//! In-memory collaborators with knobs for latency and failures, plus a probe
//! that records what the executors were doing and when.

use super::collaborators::{
    AnalysisService, CollaboratorError, PersistedRecord, PersistenceService, PriceQuery,
    PriceSuggestion, PricingService,
};
use super::executor::Collaborators;
use crate::hsuf::{Product, ingest};
use crate::models::{ItemId, Payload, Stage};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    End,
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub item: ItemId,
    pub stage: Stage,
    pub kind: EventKind,
    pub at: Instant,
}

#[derive(Default)]
struct ProbeState {
    active: HashMap<Stage, usize>,
    peak: HashMap<Stage, usize>,
    owned: HashSet<ItemId>,
    double_owned: bool,
    events: Vec<Event>,
}

#[derive(Clone, Default)]
pub struct Probe {
    state: Arc<Mutex<ProbeState>>,
}

impl Probe {
    fn enter(&self, stage: Stage, item: ItemId) {
        let mut state = self.state.lock().unwrap();
        let active = state.active.entry(stage).or_default();
        *active += 1;
        let now_active = *active;
        let peak = state.peak.entry(stage).or_default();
        *peak = (*peak).max(now_active);
        if !state.owned.insert(item) {
            state.double_owned = true;
        }
        state.events.push(Event {
            item,
            stage,
            kind: EventKind::Start,
            at: Instant::now(),
        });
    }

    fn exit(&self, stage: Stage, item: ItemId) {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.active.get_mut(&stage) {
            *active = active.saturating_sub(1);
        }
        state.owned.remove(&item);
        state.events.push(Event {
            item,
            stage,
            kind: EventKind::End,
            at: Instant::now(),
        });
    }

    pub fn peak(&self, stage: Stage) -> usize {
        let state = self.state.lock().unwrap();
        state.peak.get(&stage).copied().unwrap_or(0)
    }

    pub fn double_owned(&self) -> bool {
        self.state.lock().unwrap().double_owned
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn started(&self, stage: Stage, item: ItemId) -> usize {
        self.events()
            .iter()
            .filter(|e| e.item == item && e.stage == stage && e.kind == EventKind::Start)
            .count()
    }
}

struct ProbeGuard<'a> {
    probe: Option<&'a Probe>,
    stage: Stage,
    item: ItemId,
}

impl<'a> ProbeGuard<'a> {
    fn new(probe: Option<&'a Probe>, stage: Stage, item: ItemId) -> Self {
        if let Some(probe) = probe {
            probe.enter(stage, item);
        }
        Self { probe, stage, item }
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if let Some(probe) = self.probe {
            probe.exit(self.stage, self.item);
        }
    }
}

fn sku_of(item_id: ItemId, payload: &Payload) -> String {
    payload
        .str_field("sku")
        .map(str::to_string)
        .unwrap_or_else(|| item_id.simple().to_string())
}

#[derive(Clone, Default)]
pub struct ScriptedAnalysis {
    latency: Duration,
    fail_all: Option<String>,
    fail_once: Arc<Mutex<HashMap<String, String>>>,
    probe: Option<Probe>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedAnalysis {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_all: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_probe(mut self, probe: &Probe) -> Self {
        self.probe = Some(probe.clone());
        self
    }

    /// The next analysis of `sku` fails with `message`; later ones succeed.
    pub fn fail_once_for(self, sku: &str, message: &str) -> Self {
        self.fail_once
            .lock()
            .unwrap()
            .insert(sku.to_string(), message.to_string());
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl AnalysisService for ScriptedAnalysis {
    async fn analyze(&self, item_id: ItemId, raw: &Payload) -> Result<Product, CollaboratorError> {
        let _guard = ProbeGuard::new(self.probe.as_ref(), Stage::Analysis, item_id);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        let sku = sku_of(item_id, raw);
        if let Some(message) = &self.fail_all {
            return Err(CollaboratorError::new(message.clone()));
        }
        if let Some(message) = self.fail_once.lock().unwrap().remove(&sku) {
            return Err(CollaboratorError::new(message));
        }
        let mut product = ingest::fallback_product(&sku, &raw.images());
        product.name = format!("Vintage {sku} jacket");
        product.offers.price = Some(49.99);
        Ok(product)
    }
}

#[derive(Clone)]
pub struct ScriptedPricing {
    connected: bool,
    latency: Duration,
    result: Result<(f64, usize), String>,
    probe: Option<Probe>,
    calls: Arc<AtomicUsize>,
}

impl Default for ScriptedPricing {
    fn default() -> Self {
        Self::suggesting(42.0, 5)
    }
}

impl ScriptedPricing {
    pub fn suggesting(price: f64, comparables: usize) -> Self {
        Self {
            connected: true,
            latency: Duration::ZERO,
            result: Ok((price, comparables)),
            probe: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            result: Err(message.to_string()),
            ..Self::default()
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_probe(mut self, probe: &Probe) -> Self {
        self.probe = Some(probe.clone());
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl PricingService for ScriptedPricing {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn research_price(
        &self,
        item_id: ItemId,
        query: &PriceQuery,
    ) -> Result<PriceSuggestion, CollaboratorError> {
        let _guard = ProbeGuard::new(self.probe.as_ref(), Stage::Pricing, item_id);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        match &self.result {
            Ok((price, comparables)) => Ok(PriceSuggestion {
                suggested_price: *price,
                currency: query.currency.clone(),
                comparable_count: *comparables,
            }),
            Err(message) => Err(CollaboratorError::new(message.clone())),
        }
    }
}

#[derive(Clone, Default)]
pub struct ScriptedPersistence {
    latency: Duration,
    fail_all: Option<String>,
    fail_once: Arc<Mutex<HashMap<String, String>>>,
    probe: Option<Probe>,
    saves: Arc<Mutex<Vec<ItemId>>>,
}

impl ScriptedPersistence {
    pub fn failing(message: &str) -> Self {
        Self {
            fail_all: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_probe(mut self, probe: &Probe) -> Self {
        self.probe = Some(probe.clone());
        self
    }

    pub fn fail_once_for(self, sku: &str, message: &str) -> Self {
        self.fail_once
            .lock()
            .unwrap()
            .insert(sku.to_string(), message.to_string());
        self
    }

    /// Ids of successful saves, in completion order.
    pub fn saves(&self) -> Arc<Mutex<Vec<ItemId>>> {
        self.saves.clone()
    }
}

#[async_trait]
impl PersistenceService for ScriptedPersistence {
    async fn save(
        &self,
        item_id: ItemId,
        payload: &Payload,
    ) -> Result<PersistedRecord, CollaboratorError> {
        let _guard = ProbeGuard::new(self.probe.as_ref(), Stage::Persistence, item_id);
        tokio::time::sleep(self.latency).await;
        if let Some(message) = &self.fail_all {
            return Err(CollaboratorError::new(message.clone()));
        }
        if let Some(message) = self.fail_once.lock().unwrap().remove(&sku_of(item_id, payload)) {
            return Err(CollaboratorError::new(message));
        }
        self.saves.lock().unwrap().push(item_id);
        Ok(PersistedRecord {
            persisted_id: format!("row-{}", item_id.simple()),
        })
    }
}

pub fn collaborators(
    analysis: ScriptedAnalysis,
    pricing: ScriptedPricing,
    persistence: ScriptedPersistence,
) -> Collaborators {
    Collaborators {
        analysis: Arc::new(analysis),
        pricing: Arc::new(pricing),
        persistence: Arc::new(persistence),
    }
}
