//! Worker registry: heartbeat-fed view of the fleet and its model inventory.
//!
//! The registry is a pure aggregation with a defined update protocol
//! (heartbeat ingestion and the expiry sweep) rather than ambient shared
//! state. The model view is a projection of the same data keyed by model id
//! instead of worker id.

use crate::protocol::{HeartbeatMessage, WorkerPresence};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Unique identifier for a worker, stable across reconnects within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness of a worker as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Live,
    Expired,
}

/// Registry record for one worker.
#[derive(Debug)]
pub struct WorkerEntry {
    pub id: WorkerId,
    pub cached: HashSet<String>,
    pub loaded: HashSet<String>,
    pub last_heartbeat: Instant,
    pub liveness: Liveness,
}

/// Aggregate availability of one model across live workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelAvailability {
    pub cached_on: Vec<String>,
    pub loaded_on: Vec<String>,
}

/// Serializable worker info for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub cached_models: Vec<String>,
    pub loaded_models: Vec<String>,
}

impl From<&WorkerEntry> for WorkerInfo {
    fn from(entry: &WorkerEntry) -> Self {
        let mut cached: Vec<String> = entry.cached.iter().cloned().collect();
        let mut loaded: Vec<String> = entry.loaded.iter().cloned().collect();
        cached.sort();
        loaded.sort();
        Self {
            id: entry.id.0.clone(),
            cached_models: cached,
            loaded_models: loaded,
        }
    }
}

/// Live view of which workers exist and what each has cached/loaded.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    pub workers: HashMap<WorkerId, WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a heartbeat: upsert the worker record and reset its expiry
    /// timer. An `offline` heartbeat removes the worker immediately.
    ///
    /// The loaded set is constrained to the cached set on ingestion, since a
    /// model cannot be memory-resident without its bytes on disk.
    pub fn ingest(&mut self, hb: &HeartbeatMessage) {
        let id = WorkerId(hb.worker_id.clone());

        if hb.status == WorkerPresence::Offline {
            if self.workers.remove(&id).is_some() {
                info!("Worker {} went offline", id);
            }
            return;
        }

        let cached: HashSet<String> = hb.cached_models.iter().cloned().collect();
        let mut loaded: HashSet<String> = hb.loaded_models.iter().cloned().collect();
        let stray: Vec<String> = loaded.difference(&cached).cloned().collect();
        if !stray.is_empty() {
            warn!(
                "Worker {} reported loaded models not in its cache: {:?}",
                id, stray
            );
            loaded.retain(|m| cached.contains(m));
        }

        match self.workers.get_mut(&id) {
            Some(entry) => {
                if entry.liveness == Liveness::Expired {
                    info!("Worker {} recovered (heartbeat received)", id);
                    entry.liveness = Liveness::Live;
                }
                entry.cached = cached;
                entry.loaded = loaded;
                entry.last_heartbeat = Instant::now();
            }
            None => {
                info!("Worker {} joined ({} cached models)", id, cached.len());
                self.workers.insert(
                    id.clone(),
                    WorkerEntry {
                        id,
                        cached,
                        loaded,
                        last_heartbeat: Instant::now(),
                        liveness: Liveness::Live,
                    },
                );
            }
        }
        debug!("Registry now tracks {} workers", self.workers.len());
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerEntry> {
        self.workers.get(id)
    }

    /// Live workers only; expired workers are excluded from availability
    /// queries but their already-delivered results are never retracted.
    pub fn live_workers(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.workers
            .values()
            .filter(|w| w.liveness == Liveness::Live)
    }

    /// Whether a live worker with this id exists.
    pub fn is_live(&self, id: &WorkerId) -> bool {
        self.workers
            .get(id)
            .map(|w| w.liveness == Liveness::Live)
            .unwrap_or(false)
    }

    /// Serializable list of live workers, sorted by id.
    pub fn list(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.live_workers().map(WorkerInfo::from).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Projection keyed by model id: which live workers have each model
    /// cached and loaded.
    pub fn model_view(&self) -> HashMap<String, ModelAvailability> {
        let mut view: HashMap<String, ModelAvailability> = HashMap::new();
        for worker in self.live_workers() {
            for model in &worker.cached {
                view.entry(model.clone())
                    .or_default()
                    .cached_on
                    .push(worker.id.0.clone());
            }
            for model in &worker.loaded {
                view.entry(model.clone())
                    .or_default()
                    .loaded_on
                    .push(worker.id.0.clone());
            }
        }
        for availability in view.values_mut() {
            availability.cached_on.sort();
            availability.loaded_on.sort();
        }
        view
    }

    /// Union of live workers' cached sets, sorted.
    pub fn known_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self
            .live_workers()
            .flat_map(|w| w.cached.iter().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        models.sort();
        models
    }
}
