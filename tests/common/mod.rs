#![allow(dead_code)]

use async_trait::async_trait;
use codegen_pipeline::config::ContainerSpec;
use codegen_pipeline::gateway::{InsertPolicy, StoreGateway};
use codegen_pipeline::activities::Activities;
use codegen_pipeline::db::{self, Pool};
use codegen_pipeline::journal::Journal;
use codegen_pipeline::model::{CodeRecord, ItemKey, PartitionKeyPath};
use codegen_pipeline::orchestrator::{PipelineOrchestrator, PipelineSettings};
use codegen_pipeline::store::{DocumentStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

pub type CreateRule = Box<dyn Fn(usize) -> Option<StoreError> + Send + Sync>;

#[derive(Default)]
struct State {
    items: HashMap<(String, String, String), String>,
    throughput: HashMap<String, u32>,
    replace_calls: Vec<(String, u32)>,
    read_calls: Vec<String>,
    unreadable: HashSet<String>,
    unwritable: HashSet<String>,
    create_calls: usize,
}

/// In-memory store that records throughput changes and injects create faults.
#[derive(Clone, Default)]
pub struct RecordingStore {
    state: Arc<Mutex<State>>,
    rule: Arc<Option<CreateRule>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `rule(n)` decides the fate of the n-th create call (1-based); `None` lets it through.
    pub fn with_rule(rule: impl Fn(usize) -> Option<StoreError> + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::default(),
            rule: Arc::new(Some(Box::new(rule))),
        }
    }

    pub async fn set_throughput(&self, container: &str, value: u32) {
        self.state
            .lock()
            .await
            .throughput
            .insert(container.to_string(), value);
    }

    pub async fn fail_reads(&self, container: &str) {
        self.state.lock().await.unreadable.insert(container.to_string());
    }

    pub async fn fail_writes(&self, container: &str) {
        self.state.lock().await.unwritable.insert(container.to_string());
    }

    pub async fn throughput(&self, container: &str) -> Option<u32> {
        self.state.lock().await.throughput.get(container).copied()
    }

    pub async fn replace_calls(&self) -> Vec<(String, u32)> {
        self.state.lock().await.replace_calls.clone()
    }

    pub async fn read_calls(&self) -> Vec<String> {
        self.state.lock().await.read_calls.clone()
    }

    pub async fn create_calls(&self) -> usize {
        self.state.lock().await.create_calls
    }

    pub async fn item_count(&self, container: &str) -> usize {
        self.state
            .lock()
            .await
            .items
            .keys()
            .filter(|(c, _, _)| c == container)
            .count()
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn create_item(
        &self,
        container: &str,
        key: &ItemKey,
        record: &CodeRecord,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.create_calls += 1;
        if let Some(rule) = &*self.rule {
            if let Some(err) = rule(state.create_calls) {
                return Err(err);
            }
        }
        let slot = (
            container.to_string(),
            key.partition_key.clone(),
            key.item_key.clone(),
        );
        match state.items.get(&slot) {
            Some(id) if id == &record.id => Ok(()),
            Some(_) => Err(StoreError::Conflict {
                partition_key: key.partition_key.clone(),
            }),
            None => {
                state.items.insert(slot, record.id.clone());
                Ok(())
            }
        }
    }

    async fn read_throughput(&self, container: &str) -> Result<Option<u32>, StoreError> {
        let mut state = self.state.lock().await;
        state.read_calls.push(container.to_string());
        if state.unreadable.contains(container) {
            return Err(StoreError::Unavailable("read refused".into()));
        }
        Ok(state.throughput.get(container).copied())
    }

    async fn replace_throughput(&self, container: &str, max_throughput: u32) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .replace_calls
            .push((container.to_string(), max_throughput));
        if state.unwritable.contains(container) {
            return Err(StoreError::Unavailable("write refused".into()));
        }
        state.throughput.insert(container.to_string(), max_throughput);
        Ok(())
    }
}

/// Wraps a [`RecordingStore`], notes when each create arrives, and holds the
/// first `held` creates until [`GatedStore::release`] lets them through.
#[derive(Clone)]
pub struct GatedStore {
    inner: RecordingStore,
    held: usize,
    gate: Arc<Semaphore>,
    arrivals: Arc<Mutex<Vec<Instant>>>,
    waiting: Arc<AtomicUsize>,
}

impl GatedStore {
    pub fn new(inner: RecordingStore, held: usize) -> Self {
        Self {
            inner,
            held,
            gate: Arc::new(Semaphore::new(0)),
            arrivals: Arc::default(),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &RecordingStore {
        &self.inner
    }

    pub fn release(&self, creates: usize) {
        self.gate.add_permits(creates);
    }

    /// Creates currently held at the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub async fn arrivals(&self) -> Vec<Instant> {
        self.arrivals.lock().await.clone()
    }

    /// Poll until at least `count` creates have arrived.
    pub async fn wait_for_arrivals(&self, count: usize) {
        while self.arrivals.lock().await.len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl DocumentStore for GatedStore {
    async fn create_item(
        &self,
        container: &str,
        key: &ItemKey,
        record: &CodeRecord,
    ) -> Result<(), StoreError> {
        let n = {
            let mut arrivals = self.arrivals.lock().await;
            arrivals.push(Instant::now());
            arrivals.len()
        };
        if n <= self.held {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| StoreError::Unavailable("gate closed".into()))?;
            permit.forget();
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.create_item(container, key, record).await
    }

    async fn read_throughput(&self, container: &str) -> Result<Option<u32>, StoreError> {
        self.inner.read_throughput(container).await
    }

    async fn replace_throughput(&self, container: &str, max_throughput: u32) -> Result<(), StoreError> {
        self.inner.replace_throughput(container, max_throughput).await
    }
}

/// Small batches, no pacing, no settle delay, one companion container.
pub fn settings() -> PipelineSettings {
    PipelineSettings {
        batch_size: 10,
        request_units_per_item: 0,
        throughput_ceiling: 10_000,
        max_shortfall_rounds: 1,
        throughput_attempts: 2,
        throughput_retry_delay: Duration::from_millis(5),
        restore_settle: Duration::ZERO,
        lease_heartbeat: Duration::from_millis(20),
        lease_stale_after: Duration::from_secs(60),
        target: ContainerSpec {
            id: "codes".into(),
            partition_key: PartitionKeyPath::Value,
        },
        companions: vec!["codes-by-batch".into()],
    }
}

pub fn orchestrator(pool: &Pool, store: &RecordingStore, settings: PipelineSettings) -> PipelineOrchestrator {
    orchestrator_over(pool, Arc::new(store.clone()), settings)
}

pub fn orchestrator_over(
    pool: &Pool,
    store: Arc<dyn DocumentStore>,
    settings: PipelineSettings,
) -> PipelineOrchestrator {
    let gateway = StoreGateway::new(
        store,
        InsertPolicy {
            default_retry_after: Duration::from_millis(5),
            ..InsertPolicy::default()
        },
    );
    PipelineOrchestrator::new(Journal::new(pool.clone()), Activities::new(gateway), settings)
}

pub async fn setup_pool() -> Pool {
    db::memory_pool().await.unwrap()
}
