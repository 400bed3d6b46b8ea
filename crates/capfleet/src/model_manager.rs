//! Worker-local model lifecycle state machine.
//!
//! Tracks every model the worker knows about through
//! Unloaded → Downloading → Cached → Loaded and back, owns the on-disk
//! cache directory, and enforces the lifecycle invariants: a model is never
//! Loaded without being Cached, and evict/unload/delete are rejected with
//! `ModelBusy` while a task for that model is in flight.
//!
//! Long-running transitions (hub downloads) hold no lock while their I/O is
//! in progress, so heartbeats and control operations for other models are
//! never blocked behind them.

use crate::adapter::{AdapterFactory, AdapterSpec, CaptionAdapter, ModelOrigin, CUSTOM_CODE_FILE};
use crate::hub::HubClient;
use crate::{ClusterError, ModelState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// File inside each model's cache directory holding the raw model id
/// (directory names are token-encoded).
pub const MODEL_ID_FILE: &str = "model.id";

/// A loaded model's adapter, shared between tasks. Locking the cell
/// serializes load/infer calls for that model.
pub type AdapterCell = Arc<AsyncMutex<Box<dyn CaptionAdapter>>>;

struct ModelRecord {
    state: ModelState,
    origin: ModelOrigin,
    in_flight: usize,
    last_used: Instant,
    adapter: Option<AdapterCell>,
}

impl ModelRecord {
    fn new(state: ModelState, origin: ModelOrigin) -> Self {
        Self {
            state,
            origin,
            in_flight: 0,
            last_used: Instant::now(),
            adapter: None,
        }
    }
}

/// Owns the worker's model cache and loaded set. The on-disk cache and the
/// in-memory adapters belong exclusively to this worker process.
pub struct ModelManager {
    cache_dir: PathBuf,
    max_loaded: usize,
    hub: HubClient,
    factory: Arc<dyn AdapterFactory>,
    state: Mutex<HashMap<String, ModelRecord>>,
}

/// RAII marker for one in-flight task on one model. While any guard exists
/// the model cannot be evicted, unloaded, or deleted.
pub struct TaskGuard {
    manager: Arc<ModelManager>,
    model: String,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.manager.state.lock() {
            if let Some(record) = state.get_mut(&self.model) {
                record.in_flight = record.in_flight.saturating_sub(1);
                record.last_used = Instant::now();
            }
        }
    }
}

impl ModelManager {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        max_loaded: usize,
        hub: HubClient,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_loaded: max_loaded.max(1),
            hub,
            factory,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn model_dir(&self, model: &str) -> PathBuf {
        HubClient::model_dir(&self.cache_dir, model)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ModelRecord>> {
        self.state.lock().expect("model manager lock poisoned")
    }

    /// Seed the Cached set from directories already present in the cache.
    pub async fn scan_cache(&self) -> Result<(), ClusterError> {
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(_) => {
                debug!("Cache directory {} not found", self.cache_dir.display());
                return Ok(());
            }
        };

        let mut found = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Cache scan aborted: {}", e);
                    break;
                }
            };
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Ok(model_id) = tokio::fs::read_to_string(dir.join(MODEL_ID_FILE)).await else {
                continue;
            };
            let model_id = model_id.trim().to_string();
            if model_id.is_empty() {
                continue;
            }
            let origin = if dir.join(CUSTOM_CODE_FILE).exists() {
                ModelOrigin::Custom
            } else {
                ModelOrigin::Hosted
            };
            found.push((model_id, origin));
        }

        let mut state = self.lock();
        for (model_id, origin) in found {
            state
                .entry(model_id.clone())
                .or_insert_with(|| ModelRecord::new(ModelState::Cached, origin));
        }
        let cached: Vec<&String> = state.keys().collect();
        info!("Cache scan found {} models: {:?}", cached.len(), cached);
        Ok(())
    }

    /// Current state of one model (`Unloaded` when unknown).
    pub fn state_of(&self, model: &str) -> ModelState {
        self.lock()
            .get(model)
            .map(|r| r.state)
            .unwrap_or(ModelState::Unloaded)
    }

    /// Models with bytes on disk (Cached or Loaded), sorted.
    pub fn cached_models(&self) -> Vec<String> {
        let state = self.lock();
        let mut models: Vec<String> = state
            .iter()
            .filter(|(_, r)| matches!(r.state, ModelState::Cached | ModelState::Loaded))
            .map(|(m, _)| m.clone())
            .collect();
        models.sort();
        models
    }

    /// Models resident in memory, sorted.
    pub fn loaded_models(&self) -> Vec<String> {
        let state = self.lock();
        let mut models: Vec<String> = state
            .iter()
            .filter(|(_, r)| r.state == ModelState::Loaded)
            .map(|(m, _)| m.clone())
            .collect();
        models.sort();
        models
    }

    /// Fetch a model's artifacts from the hub into the local cache.
    /// Idempotent when the model is already cached; a failed download leaves
    /// the model in `DownloadFailed`, from which a retry (or a custom-code
    /// install) may proceed.
    pub async fn download(&self, model: &str) -> Result<ModelState, ClusterError> {
        {
            let mut state = self.lock();
            match state.get(model).map(|r| r.state) {
                Some(s @ (ModelState::Cached | ModelState::Loaded)) => {
                    debug!("Model '{}' already cached, skipping download", model);
                    return Ok(s);
                }
                Some(ModelState::Downloading) => {
                    return Err(ClusterError::DownloadError(format!(
                        "download of '{model}' already in progress"
                    )));
                }
                _ => {}
            }
            state.insert(
                model.to_string(),
                ModelRecord::new(ModelState::Downloading, ModelOrigin::Hosted),
            );
        }

        let dir = self.model_dir(model);
        let fetched = async {
            self.hub.download(model, &dir).await?;
            tokio::fs::write(dir.join(MODEL_ID_FILE), model.as_bytes())
                .await
                .map_err(|e| ClusterError::DownloadError(format!("cache write failed: {e}")))
        }
        .await;

        match fetched {
            Ok(()) => {
                self.lock()
                    .insert(model.to_string(), ModelRecord::new(ModelState::Cached, ModelOrigin::Hosted));
                info!("Model '{}' downloaded and cached", model);
                Ok(ModelState::Cached)
            }
            Err(e) => {
                if let Some(record) = self.lock().get_mut(model) {
                    record.state = ModelState::DownloadFailed;
                }
                let _ = tokio::fs::remove_dir_all(&dir).await;
                warn!("Download of '{}' failed: {}", model, e);
                Err(e)
            }
        }
    }

    /// Install caller-supplied inference code in place of a hub download.
    pub async fn install_custom(&self, model: &str, code: &[u8]) -> Result<ModelState, ClusterError> {
        {
            let mut state = self.lock();
            match state.get(model).map(|r| r.state) {
                Some(ModelState::Cached | ModelState::Loaded) => {
                    return Err(ClusterError::InvalidInput(format!(
                        "model '{model}' already cached"
                    )));
                }
                Some(ModelState::Downloading) => {
                    return Err(ClusterError::DownloadError(format!(
                        "download of '{model}' already in progress"
                    )));
                }
                _ => {}
            }
            state.insert(
                model.to_string(),
                ModelRecord::new(ModelState::Downloading, ModelOrigin::Custom),
            );
        }

        let dir = self.model_dir(model);
        let installed = install_code(&dir, model, code).await;

        match installed {
            Ok(()) => {
                self.lock()
                    .insert(model.to_string(), ModelRecord::new(ModelState::Cached, ModelOrigin::Custom));
                info!("Custom code for '{}' installed", model);
                Ok(ModelState::Cached)
            }
            Err(e) => {
                if let Some(record) = self.lock().get_mut(model) {
                    record.state = ModelState::DownloadFailed;
                }
                let _ = tokio::fs::remove_dir_all(&dir).await;
                Err(e)
            }
        }
    }

    /// Remove a model's cached bytes and unload it from memory. Rejected
    /// while a task for the model is in flight.
    pub async fn delete(&self, model: &str) -> Result<(), ClusterError> {
        {
            let mut state = self.lock();
            match state.get(model) {
                None => {
                    warn!("Delete of unknown model '{}'", model);
                    return Ok(());
                }
                Some(record) if record.in_flight > 0 => {
                    return Err(ClusterError::ModelBusy(model.to_string()));
                }
                Some(record) if record.state == ModelState::Downloading => {
                    return Err(ClusterError::ModelBusy(format!(
                        "download of '{model}' in progress"
                    )));
                }
                Some(_) => {
                    state.remove(model);
                }
            }
        }

        let dir = self.model_dir(model);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Cache removal for '{}' failed: {}", model, e);
            }
        }
        info!("Model '{}' deleted", model);
        Ok(())
    }

    /// Evict a loaded model back to Cached. Rejected while a task for the
    /// model is in flight.
    pub fn unload(&self, model: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let record = state
            .get_mut(model)
            .filter(|r| r.state == ModelState::Loaded)
            .ok_or_else(|| ClusterError::InvalidInput(format!("model '{model}' not loaded")))?;
        if record.in_flight > 0 {
            return Err(ClusterError::ModelBusy(model.to_string()));
        }
        record.adapter = None;
        record.state = ModelState::Cached;
        info!("Model '{}' unloaded", model);
        Ok(())
    }

    /// Mark one task in flight on a model. Fails with `ModelUnavailable`
    /// unless the model is Cached or Loaded.
    pub fn begin_task(self: &Arc<Self>, model: &str) -> Result<TaskGuard, ClusterError> {
        let mut state = self.lock();
        let record = state
            .get_mut(model)
            .filter(|r| matches!(r.state, ModelState::Cached | ModelState::Loaded))
            .ok_or_else(|| ClusterError::ModelUnavailable(model.to_string()))?;
        record.in_flight += 1;
        record.last_used = Instant::now();
        Ok(TaskGuard {
            manager: Arc::clone(self),
            model: model.to_string(),
        })
    }

    /// On-demand load: returns the model's adapter cell, creating it (and
    /// evicting least-recently-used idle models past the ceiling) if the
    /// model is only Cached. The caller must invoke `load()` on the cell
    /// before `infer()` — load is idempotent, so this is cheap for models
    /// that are already resident.
    pub fn ensure_loaded(&self, model: &str) -> Result<AdapterCell, ClusterError> {
        let mut state = self.lock();

        match state.get(model) {
            Some(record) if record.state == ModelState::Loaded => {
                if let Some(cell) = &record.adapter {
                    return Ok(Arc::clone(cell));
                }
            }
            Some(record) if record.state == ModelState::Cached => {}
            _ => return Err(ClusterError::ModelUnavailable(model.to_string())),
        }

        // Approaching the memory ceiling: evict least-recently-used idle
        // models until under it. Busy models are skipped; if everything is
        // busy the load proceeds past the ceiling.
        loop {
            let loaded = state
                .values()
                .filter(|r| r.state == ModelState::Loaded)
                .count();
            if loaded < self.max_loaded {
                break;
            }
            let victim = state
                .iter()
                .filter(|(m, r)| {
                    r.state == ModelState::Loaded && r.in_flight == 0 && m.as_str() != model
                })
                .min_by_key(|(_, r)| r.last_used)
                .map(|(m, _)| m.clone());
            match victim {
                Some(victim) => {
                    if let Some(record) = state.get_mut(&victim) {
                        record.adapter = None;
                        record.state = ModelState::Cached;
                    }
                    info!("Evicted '{}' (memory ceiling reached)", victim);
                }
                None => {
                    warn!(
                        "Loaded ceiling ({}) reached but all loaded models are busy",
                        self.max_loaded
                    );
                    break;
                }
            }
        }

        let record = state
            .get_mut(model)
            .ok_or_else(|| ClusterError::ModelUnavailable(model.to_string()))?;
        let spec = AdapterSpec {
            model_id: model.to_string(),
            model_dir: self.model_dir(model),
            origin: record.origin,
        };
        let adapter = self.factory.make(&spec)?;
        let cell: AdapterCell = Arc::new(AsyncMutex::new(adapter));
        record.adapter = Some(Arc::clone(&cell));
        record.state = ModelState::Loaded;
        record.last_used = Instant::now();
        debug!("Model '{}' loading on demand", model);
        Ok(cell)
    }

    /// Revert a model whose adapter failed to initialize back to Cached.
    pub fn load_failed(&self, model: &str) {
        let mut state = self.lock();
        if let Some(record) = state.get_mut(model) {
            if record.state == ModelState::Loaded {
                record.adapter = None;
                record.state = ModelState::Cached;
            }
        }
    }
}

async fn install_code(dir: &std::path::Path, model: &str, code: &[u8]) -> Result<(), ClusterError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| ClusterError::DownloadError(format!("cache dir create failed: {e}")))?;
    let code_path = dir.join(CUSTOM_CODE_FILE);
    tokio::fs::write(&code_path, code)
        .await
        .map_err(|e| ClusterError::DownloadError(format!("code write failed: {e}")))?;
    tokio::fs::write(dir.join(MODEL_ID_FILE), model.as_bytes())
        .await
        .map_err(|e| ClusterError::DownloadError(format!("cache write failed: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&code_path, perms)
            .map_err(|e| ClusterError::DownloadError(format!("chmod failed: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubAdapter {
        fail_load: bool,
    }

    #[async_trait]
    impl CaptionAdapter for StubAdapter {
        async fn load(&mut self) -> Result<(), ClusterError> {
            if self.fail_load {
                Err(ClusterError::Adapter("stub load failure".into()))
            } else {
                Ok(())
            }
        }

        async fn infer(&mut self, _image: &[u8]) -> Result<String, ClusterError> {
            Ok("stub caption".into())
        }
    }

    struct StubFactory {
        fail_load: bool,
    }

    impl AdapterFactory for StubFactory {
        fn make(&self, _spec: &AdapterSpec) -> Result<Box<dyn CaptionAdapter>, ClusterError> {
            Ok(Box::new(StubAdapter {
                fail_load: self.fail_load,
            }))
        }
    }

    fn manager(dir: &std::path::Path, max_loaded: usize) -> Arc<ModelManager> {
        Arc::new(ModelManager::new(
            dir,
            max_loaded,
            HubClient::new("http://127.0.0.1:1"),
            Arc::new(StubFactory { fail_load: false }),
        ))
    }

    #[tokio::test]
    async fn test_unknown_model_is_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        assert_eq!(mgr.state_of("nope"), ModelState::Unloaded);
        assert!(mgr.cached_models().is_empty());
    }

    #[tokio::test]
    async fn test_install_custom_caches_model() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);

        let state = mgr.install_custom("my-model", b"code").await.unwrap();
        assert_eq!(state, ModelState::Cached);
        assert_eq!(mgr.cached_models(), vec!["my-model"]);
        assert!(mgr.loaded_models().is_empty());

        let code_path =
            HubClient::model_dir(dir.path(), "my-model").join(CUSTOM_CODE_FILE);
        assert_eq!(std::fs::read(code_path).unwrap(), b"code");
    }

    #[tokio::test]
    async fn test_install_custom_rejected_when_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        mgr.install_custom("m", b"code").await.unwrap();

        let err = mgr.install_custom("m", b"other").await.unwrap_err();
        assert!(matches!(err, ClusterError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_download_idempotent_when_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        mgr.install_custom("m", b"code").await.unwrap();

        // The hub here is unreachable, so success proves no fetch happened.
        assert_eq!(mgr.download("m").await.unwrap(), ModelState::Cached);
    }

    #[tokio::test]
    async fn test_download_failure_then_custom_install_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);

        let err = mgr.download("bad-model").await.unwrap_err();
        assert!(matches!(err, ClusterError::DownloadError(_)));
        assert_eq!(mgr.state_of("bad-model"), ModelState::DownloadFailed);

        // Recoverable by supplying custom inference code.
        let state = mgr.install_custom("bad-model", b"code").await.unwrap();
        assert_eq!(state, ModelState::Cached);
    }

    #[tokio::test]
    async fn test_download_retry_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);

        mgr.download("m").await.unwrap_err();
        assert_eq!(mgr.state_of("m"), ModelState::DownloadFailed);

        // Retry re-enters Downloading (and fails again on the dead hub).
        mgr.download("m").await.unwrap_err();
        assert_eq!(mgr.state_of("m"), ModelState::DownloadFailed);
    }

    #[tokio::test]
    async fn test_on_demand_load_and_infer() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        mgr.install_custom("m", b"code").await.unwrap();

        let _guard = mgr.begin_task("m").unwrap();
        let cell = mgr.ensure_loaded("m").unwrap();
        assert_eq!(mgr.state_of("m"), ModelState::Loaded);

        let mut adapter = cell.lock().await;
        adapter.load().await.unwrap();
        assert_eq!(adapter.infer(b"img").await.unwrap(), "stub caption");
    }

    #[tokio::test]
    async fn test_ensure_loaded_requires_cached_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        let err = mgr.ensure_loaded("never-downloaded").err().unwrap();
        assert!(matches!(err, ClusterError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn test_begin_task_requires_cached_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        assert!(matches!(
            mgr.begin_task("nope").err().unwrap(),
            ClusterError::ModelUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_busy_model_rejects_unload_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        mgr.install_custom("m", b"code").await.unwrap();

        let guard = mgr.begin_task("m").unwrap();
        mgr.ensure_loaded("m").unwrap();

        assert!(matches!(
            mgr.unload("m").unwrap_err(),
            ClusterError::ModelBusy(_)
        ));
        assert!(matches!(
            mgr.delete("m").await.unwrap_err(),
            ClusterError::ModelBusy(_)
        ));

        // Once the task resolves, lifecycle operations proceed.
        drop(guard);
        mgr.unload("m").unwrap();
        assert_eq!(mgr.state_of("m"), ModelState::Cached);
        mgr.delete("m").await.unwrap();
        assert_eq!(mgr.state_of("m"), ModelState::Unloaded);
    }

    #[tokio::test]
    async fn test_delete_then_load_requires_redownload() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        mgr.install_custom("m", b"code").await.unwrap();
        mgr.delete("m").await.unwrap();

        // Never jumps straight back to Loaded: the bytes are gone.
        assert!(matches!(
            mgr.ensure_loaded("m").err().unwrap(),
            ClusterError::ModelUnavailable(_)
        ));
        assert!(!HubClient::model_dir(dir.path(), "m").exists());
    }

    #[tokio::test]
    async fn test_unload_not_loaded_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        mgr.install_custom("m", b"code").await.unwrap();
        assert!(matches!(
            mgr.unload("m").unwrap_err(),
            ClusterError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_unknown_model_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        mgr.delete("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_lru_eviction_at_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 1);
        mgr.install_custom("old", b"code").await.unwrap();
        mgr.install_custom("new", b"code").await.unwrap();

        mgr.ensure_loaded("old").unwrap();
        assert_eq!(mgr.loaded_models(), vec!["old"]);

        // Loading past the ceiling evicts the least-recently-used idle model.
        mgr.ensure_loaded("new").unwrap();
        assert_eq!(mgr.loaded_models(), vec!["new"]);
        assert_eq!(mgr.state_of("old"), ModelState::Cached);
    }

    #[tokio::test]
    async fn test_eviction_skips_busy_models() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 1);
        mgr.install_custom("busy", b"code").await.unwrap();
        mgr.install_custom("next", b"code").await.unwrap();

        let _guard = mgr.begin_task("busy").unwrap();
        mgr.ensure_loaded("busy").unwrap();

        // The busy model survives; the ceiling is soft.
        mgr.begin_task("next").unwrap();
        mgr.ensure_loaded("next").unwrap();
        assert_eq!(mgr.loaded_models(), vec!["busy", "next"]);
    }

    #[tokio::test]
    async fn test_load_failed_reverts_to_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 2);
        mgr.install_custom("m", b"code").await.unwrap();
        mgr.ensure_loaded("m").unwrap();
        assert_eq!(mgr.state_of("m"), ModelState::Loaded);

        mgr.load_failed("m");
        assert_eq!(mgr.state_of("m"), ModelState::Cached);
    }

    #[tokio::test]
    async fn test_scan_cache_finds_installed_models() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mgr = manager(dir.path(), 2);
            mgr.install_custom("org/custom", b"code").await.unwrap();
        }

        // A fresh manager over the same directory rediscovers the model.
        let mgr = manager(dir.path(), 2);
        mgr.scan_cache().await.unwrap();
        assert_eq!(mgr.cached_models(), vec!["org/custom"]);
        assert_eq!(mgr.state_of("org/custom"), ModelState::Cached);
    }

    #[tokio::test]
    async fn test_scan_cache_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir.path().join("does-not-exist"), 2);
        mgr.scan_cache().await.unwrap();
        assert!(mgr.cached_models().is_empty());
    }
}
