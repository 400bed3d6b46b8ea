//! Worker runtime: task consumption, control handling, heartbeats.
//!
//! A worker queue-subscribes to one task subject per cached model (so tasks
//! distribute competitively across the fleet), processes tasks strictly one
//! at a time per model channel under a global concurrency bound, and
//! publishes exactly one result per consumed task — success or failure,
//! never a silent drop. Out-of-band control operations (download, custom
//! upload, unload, delete) arrive on the worker's control subject and are
//! handled without blocking heartbeats or task flow for other models.

use crate::metrics::WorkerMetrics;
use crate::model_manager::ModelManager;
use crate::protocol::{
    decode_code_blob, decode_image_data, ControlErrorKind, ControlOp, ControlRequest,
    ControlResponse, HeartbeatMessage, ImageRef, ResultMessage, TaskMessage, WorkerPresence,
};
use crate::registry::WorkerId;
use crate::transport::{
    publish_json, subject_control_wildcard, subject_heartbeat, subject_task, SharedTransport,
    Subscription, TransportMessage, TASK_QUEUE_GROUP,
};
use crate::{health, ClusterError, ModelState};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable worker identity; generated per session when not set.
    pub worker_id: Option<String>,
    /// Maximum concurrent inferences across all model channels.
    pub max_concurrent: usize,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            max_concurrent: 1,
            heartbeat_interval: health::HEARTBEAT_INTERVAL,
        }
    }
}

/// One worker process: subscriptions, lifecycle, heartbeats.
pub struct WorkerRuntime {
    id: WorkerId,
    transport: SharedTransport,
    manager: Arc<ModelManager>,
    metrics: WorkerMetrics,
    semaphore: Arc<Semaphore>,
    heartbeat_interval: Duration,
    http: reqwest::Client,
    consumers: Mutex<HashMap<String, JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl WorkerRuntime {
    pub fn new(
        transport: SharedTransport,
        manager: Arc<ModelManager>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let id = config.worker_id.unwrap_or_else(|| {
            let mut id = uuid::Uuid::new_v4().simple().to_string();
            id.truncate(8);
            id
        });
        Arc::new(Self {
            id: WorkerId(id),
            transport,
            manager,
            metrics: WorkerMetrics::new(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            heartbeat_interval: config.heartbeat_interval,
            http: reqwest::Client::new(),
            consumers: Mutex::new(HashMap::new()),
            heartbeat_task: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Run the worker: scan the cache, start task consumers for every cached
    /// model, heartbeat on the configured interval, and serve control
    /// operations until the transport goes away.
    pub async fn run(self: Arc<Self>) -> Result<(), ClusterError> {
        self.manager.scan_cache().await?;
        for model in self.manager.cached_models() {
            self.start_consumer(&model).await?;
        }

        let heartbeater = Arc::clone(&self);
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeater.heartbeat_interval);
            loop {
                interval.tick().await;
                heartbeater.publish_heartbeat().await;
            }
        });
        *self.heartbeat_task.lock().expect("heartbeat lock") = Some(heartbeat_task);

        let mut control = self
            .transport
            .subscribe(&subject_control_wildcard(&self.id.0))
            .await?;
        info!(
            "Worker {} serving control operations ({} cached models)",
            self.id,
            self.manager.cached_models().len()
        );

        while let Some(msg) = control.next().await {
            // Downloads can run for minutes; never stall the control channel.
            let runtime = Arc::clone(&self);
            tokio::spawn(async move {
                runtime.handle_control(msg).await;
            });
        }
        Ok(())
    }

    /// Announce a clean shutdown and stop consuming.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat_task.lock().expect("heartbeat lock").take() {
            handle.abort();
        }
        let mut consumers = std::mem::take(&mut *self.consumers.lock().expect("consumer lock"));
        for (_, handle) in consumers.drain() {
            handle.abort();
        }
        self.publish_presence(WorkerPresence::Offline).await;
        info!("Worker {} shut down", self.id);
    }

    /// Publish the current inventory as an online heartbeat.
    pub async fn publish_heartbeat(&self) {
        self.publish_presence(WorkerPresence::Online).await;
    }

    async fn publish_presence(&self, status: WorkerPresence) {
        if status == WorkerPresence::Online && self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let cached = self.manager.cached_models();
        let loaded = self.manager.loaded_models();
        self.metrics.models_cached.set(cached.len() as f64);
        self.metrics.models_loaded.set(loaded.len() as f64);

        let hb = HeartbeatMessage {
            worker_id: self.id.0.clone(),
            cached_models: cached,
            loaded_models: loaded,
            timestamp: Utc::now(),
            status,
        };
        if let Err(e) = publish_json(
            self.transport.as_ref(),
            &subject_heartbeat(&self.id.0),
            &hb,
        )
        .await
        {
            warn!("Heartbeat publish failed: {}", e);
        }
    }

    /// Begin consuming tasks for one model. No-op if already consuming.
    async fn start_consumer(self: &Arc<Self>, model: &str) -> Result<(), ClusterError> {
        {
            let consumers = self.consumers.lock().expect("consumer lock");
            if consumers.contains_key(model) {
                return Ok(());
            }
        }
        let sub = self
            .transport
            .queue_subscribe(&subject_task(model), TASK_QUEUE_GROUP)
            .await?;
        info!("Worker {} consuming tasks for model '{}'", self.id, model);

        let runtime = Arc::clone(self);
        let model_name = model.to_string();
        let handle = tokio::spawn(async move {
            runtime.task_loop(model_name, sub).await;
        });
        self.consumers
            .lock()
            .expect("consumer lock")
            .insert(model.to_string(), handle);
        Ok(())
    }

    fn stop_consumer(&self, model: &str) {
        if let Some(handle) = self.consumers.lock().expect("consumer lock").remove(model) {
            handle.abort();
            info!("Worker {} stopped consuming model '{}'", self.id, model);
        }
    }

    /// Sequential task processing for one model channel, bounded globally.
    async fn task_loop(self: Arc<Self>, model: String, mut sub: Subscription) {
        while let Some(msg) = sub.next().await {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.handle_task(&model, msg).await;
            drop(permit);
        }
        debug!("Task channel for '{}' closed", model);
    }

    async fn handle_task(&self, model: &str, msg: TransportMessage) {
        let task: TaskMessage = match serde_json::from_slice(&msg.payload) {
            Ok(task) => task,
            Err(e) => {
                warn!("Malformed task on '{}': {}", msg.subject, e);
                return;
            }
        };
        let Some(reply) = msg.reply else {
            warn!("Task {} carries no reply address, dropping", task.task_id);
            return;
        };
        debug!(
            "Worker {} processing task {} (model '{}')",
            self.id, task.task_id, model
        );

        let result = match self.process_task(&task).await {
            Ok(caption) => {
                self.metrics
                    .tasks_processed_total
                    .with_label_values(&[task.model_id.as_str(), "success"])
                    .inc();
                ResultMessage::success(&task.task_id, caption)
            }
            Err(e) => {
                warn!("Task {} failed: {}", task.task_id, e);
                self.metrics
                    .tasks_processed_total
                    .with_label_values(&[task.model_id.as_str(), "failure"])
                    .inc();
                ResultMessage::failure(&task.task_id, e.to_string())
            }
        };

        // Exactly one result per consumed task.
        if let Err(e) = publish_json(self.transport.as_ref(), &reply, &result).await {
            error!("Result publish for task {} failed: {}", task.task_id, e);
        }
    }

    async fn process_task(&self, task: &TaskMessage) -> Result<String, ClusterError> {
        let image = self.resolve_image(&task.image_ref).await?;

        // The guard keeps the model safe from evict/delete for the whole
        // task, including the on-demand load below.
        let _guard = self.manager.begin_task(&task.model_id)?;
        let cell = self.manager.ensure_loaded(&task.model_id)?;

        let mut adapter = cell.lock().await;
        if let Err(e) = adapter.load().await {
            drop(adapter);
            self.manager.load_failed(&task.model_id);
            return Err(ClusterError::ModelUnavailable(format!(
                "{}: {e}",
                task.model_id
            )));
        }

        let timer = self
            .metrics
            .inference_duration_seconds
            .with_label_values(&[task.model_id.as_str()])
            .start_timer();
        let caption = adapter.infer(&image).await?;
        timer.observe_duration();
        Ok(caption)
    }

    async fn resolve_image(&self, image_ref: &ImageRef) -> Result<Vec<u8>, ClusterError> {
        match image_ref {
            ImageRef::Inline { data } => decode_image_data(data)
                .map_err(|e| ClusterError::InvalidInput(format!("invalid image data: {e}"))),
            ImageRef::Url { url } => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| ClusterError::InvalidInput(format!("image fetch failed: {e}")))?;
                if !resp.status().is_success() {
                    return Err(ClusterError::InvalidInput(format!(
                        "image fetch failed: HTTP {}",
                        resp.status()
                    )));
                }
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| ClusterError::InvalidInput(format!("image read failed: {e}")))?;
                Ok(bytes.to_vec())
            }
        }
    }

    async fn handle_control(self: Arc<Self>, msg: TransportMessage) {
        let response = match serde_json::from_slice::<ControlRequest>(&msg.payload) {
            Ok(req) => {
                info!(
                    "Worker {} control {:?} for model '{}'",
                    self.id, req.op, req.model_id
                );
                self.dispatch_control(req).await
            }
            Err(e) => {
                warn!("Malformed control request on '{}': {}", msg.subject, e);
                ControlResponse::error(ControlErrorKind::Invalid, format!("bad request: {e}"))
            }
        };

        if let Some(reply) = msg.reply {
            if let Err(e) = publish_json(self.transport.as_ref(), &reply, &response).await {
                error!("Control reply failed: {}", e);
            }
        }
    }

    async fn dispatch_control(self: &Arc<Self>, req: ControlRequest) -> ControlResponse {
        let outcome = match req.op {
            ControlOp::Download => match self.manager.download(&req.model_id).await {
                Ok(state) => self
                    .start_consumer(&req.model_id)
                    .await
                    .map(|()| state),
                Err(e) => Err(e),
            },
            ControlOp::DownloadCustom => {
                let code = match req.code.as_deref().map(decode_code_blob) {
                    Some(Ok(code)) => code,
                    Some(Err(e)) => {
                        return ControlResponse::error(
                            ControlErrorKind::Invalid,
                            format!("bad code blob: {e}"),
                        )
                    }
                    None => {
                        return ControlResponse::error(
                            ControlErrorKind::Invalid,
                            "custom download without code".to_string(),
                        )
                    }
                };
                match self.manager.install_custom(&req.model_id, &code).await {
                    Ok(state) => self
                        .start_consumer(&req.model_id)
                        .await
                        .map(|()| state),
                    Err(e) => Err(e),
                }
            }
            ControlOp::Delete => self.manager.delete(&req.model_id).await.map(|()| {
                self.stop_consumer(&req.model_id);
                ModelState::Unloaded
            }),
            ControlOp::Unload => self.manager.unload(&req.model_id).map(|()| ModelState::Cached),
        };

        match outcome {
            Ok(state) => {
                // Inventory changed (or was confirmed); tell the registry now
                // rather than waiting out the heartbeat interval.
                self.publish_heartbeat().await;
                ControlResponse::ok(state)
            }
            Err(e) => ControlResponse::error(control_error_kind(&e), e.to_string()),
        }
    }
}

fn control_error_kind(e: &ClusterError) -> ControlErrorKind {
    match e {
        ClusterError::DownloadError(_) => ControlErrorKind::DownloadError,
        ClusterError::ModelBusy(_) => ControlErrorKind::ModelBusy,
        ClusterError::ModelUnavailable(_) => ControlErrorKind::ModelUnavailable,
        _ => ControlErrorKind::Invalid,
    }
}
