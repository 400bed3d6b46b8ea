//! Task coordinator: job fan-out, result correlation, control plane.
//!
//! The coordinator owns job state. Submitting a job publishes one task per
//! (image, model) pair on the model's task subject with this coordinator's
//! result inbox as the reply address; a background dispatcher correlates
//! incoming results purely by task id and applies them idempotently, so
//! broker redelivery is harmless. Jobs resolve when every pair has a result
//! or when their deadline fires — every job terminates.
//!
//! Job state is serialized per job (one mutex per job, never a global lock
//! across jobs), so different jobs make progress fully in parallel.

use crate::health::{expiry_sweep, expiry_timeout, HEARTBEAT_INTERVAL};
use crate::hub::HubClient;
use crate::job::{CaptionOutcome, Job, JobId, JobResult, JobStatus};
use crate::metrics::CoordinatorMetrics;
use crate::protocol::{
    encode_code_blob, ControlErrorKind, ControlOp, ControlRequest, ControlResponse, ControlStatus,
    HeartbeatMessage, ImageRef, ResultMessage, ResultStatus, TaskMessage,
};
use crate::registry::{WorkerId, WorkerInfo, WorkerRegistry};
use crate::transport::{
    request_json, subject_control, subject_results, subject_task, SharedTransport,
    SUBJECT_HEARTBEAT_WILDCARD,
};
use crate::{ClusterError, ModelState, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tracing::{debug, error, info, warn};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline after which a job's unresolved pairs become `Timeout`.
    pub job_deadline: Duration,
    /// Per-request timeout for control operations on a worker.
    pub control_timeout: Duration,
    /// How often the expiry sweep runs.
    pub sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            job_deadline: Duration::from_secs(60),
            control_timeout: Duration::from_secs(30),
            sweep_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// One image in a batch submission.
#[derive(Debug, Clone)]
pub struct SubmittedImage {
    pub id: String,
    pub image: ImageRef,
}

impl SubmittedImage {
    pub fn inline(id: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            id: id.into(),
            image: ImageRef::inline(bytes),
        }
    }
}

struct JobSlot {
    job: AsyncMutex<Job>,
    status_tx: watch::Sender<JobStatus>,
}

#[derive(Debug, Clone)]
struct TaskKey {
    job: JobId,
    image: String,
    model: String,
}

/// Central coordinator: jobs, result correlation, worker registry, control
/// plane.
pub struct Coordinator {
    transport: SharedTransport,
    hub: HubClient,
    config: CoordinatorConfig,
    metrics: CoordinatorMetrics,
    /// Unique result-inbox token for this coordinator instance.
    inbox: String,
    jobs: RwLock<HashMap<JobId, Arc<JobSlot>>>,
    tasks: RwLock<HashMap<String, TaskKey>>,
    registry: Mutex<WorkerRegistry>,
}

impl Coordinator {
    pub fn new(transport: SharedTransport, hub: HubClient, config: CoordinatorConfig) -> Arc<Self> {
        let mut inbox = uuid::Uuid::new_v4().simple().to_string();
        inbox.truncate(12);
        Arc::new(Self {
            transport,
            hub,
            config,
            metrics: CoordinatorMetrics::new(),
            inbox,
            jobs: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            registry: Mutex::new(WorkerRegistry::new()),
        })
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    /// Start the background listeners: result dispatcher, heartbeat
    /// ingestion, expiry sweep. Call once after construction.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClusterError> {
        let mut results = self
            .transport
            .subscribe(&subject_results(&self.inbox))
            .await?;
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = results.next().await {
                match serde_json::from_slice::<ResultMessage>(&msg.payload) {
                    Ok(result) => dispatcher.on_result(result).await,
                    Err(e) => warn!("Malformed result message: {}", e),
                }
            }
        });

        let mut heartbeats = self.transport.subscribe(SUBJECT_HEARTBEAT_WILDCARD).await?;
        let ingester = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = heartbeats.next().await {
                match serde_json::from_slice::<HeartbeatMessage>(&msg.payload) {
                    Ok(hb) => ingester.ingest_heartbeat(&hb),
                    Err(e) => warn!("Malformed heartbeat on '{}': {}", msg.subject, e),
                }
            }
        });

        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweeper.config.sweep_interval);
            loop {
                interval.tick().await;
                let live = {
                    let mut registry = sweeper.registry.lock().expect("registry lock");
                    let swept = expiry_sweep(&mut registry, expiry_timeout());
                    if !swept.workers_expired.is_empty() {
                        info!("Expired {} workers", swept.workers_expired.len());
                    }
                    registry.live_workers().count()
                };
                sweeper.metrics.workers_live.set(live as f64);
            }
        });

        info!(
            "Coordinator listening on result inbox '{}'",
            subject_results(&self.inbox)
        );
        Ok(())
    }

    fn ingest_heartbeat(&self, hb: &HeartbeatMessage) {
        let mut registry = self.registry.lock().expect("registry lock");
        registry.ingest(hb);
        self.metrics
            .workers_live
            .set(registry.live_workers().count() as f64);
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Submit a batch: one task per (image, model) pair. Publishing is not
    /// awaited for task completion; the job id returns immediately and the
    /// aggregate response becomes available via [`wait_job_result`].
    ///
    /// [`wait_job_result`]: Coordinator::wait_job_result
    pub async fn submit_job(
        &self,
        images: Vec<SubmittedImage>,
        models: Vec<String>,
    ) -> Result<JobId, ClusterError> {
        let image_ids: Vec<String> = images.iter().map(|i| i.id.clone()).collect();
        {
            let mut deduped = image_ids.clone();
            deduped.sort();
            deduped.dedup();
            if deduped.len() != image_ids.len() {
                return Err(ClusterError::InvalidInput("duplicate image id".into()));
            }
        }

        let job_id = JobId(uuid::Uuid::new_v4().to_string());
        let mut job = Job::new(
            job_id.clone(),
            image_ids,
            models.clone(),
            self.config.job_deadline,
        )?;

        // Fan out: one task per (image, model) pair.
        let mut index = Vec::new();
        let mut outgoing = Vec::new();
        for image in &images {
            for model in &models {
                let task_id = uuid::Uuid::new_v4().to_string();
                job.task_ids.push(task_id.clone());
                index.push((
                    task_id.clone(),
                    TaskKey {
                        job: job_id.clone(),
                        image: image.id.clone(),
                        model: model.clone(),
                    },
                ));
                outgoing.push(TaskMessage {
                    task_id,
                    job_id: job_id.0.clone(),
                    image_ref: image.image.clone(),
                    model_id: model.clone(),
                });
            }
        }

        let expected = job.expected();
        let slot = Arc::new(JobSlot {
            job: AsyncMutex::new(job),
            status_tx: watch::channel(JobStatus::Dispatching).0,
        });
        self.jobs
            .write()
            .await
            .insert(job_id.clone(), Arc::clone(&slot));
        self.tasks.write().await.extend(index);
        self.metrics.jobs_submitted_total.inc();
        info!(
            "Job {} submitted: {} images x {} models = {} tasks",
            job_id,
            images.len(),
            models.len(),
            expected
        );

        let reply = subject_results(&self.inbox);
        for task in outgoing {
            let subject = subject_task(&task.model_id);
            let payload = serde_json::to_vec(&task).map_err(TransportError::Serialize)?;
            if let Err(e) = self
                .transport
                .publish_with_reply(&subject, &reply, payload.into())
                .await
            {
                // A task that never left the coordinator still gets an
                // outcome; the pair is failed instead of left dangling.
                error!("Task {} publish failed: {}", task.task_id, e);
                let mut job = slot.job.lock().await;
                job.apply_result(
                    &self.tasks.read().await[&task.task_id].image,
                    &task.model_id,
                    CaptionOutcome::Failure(format!("dispatch failed: {e}")),
                );
            }
        }

        {
            let mut job = slot.job.lock().await;
            job.mark_awaiting();
            let _ = slot.status_tx.send_replace(job.status());
        }

        // Deadline timer: unresolved pairs become Timeout when it fires.
        let deadline_slot = Arc::clone(&slot);
        let deadline = self.config.job_deadline;
        let finished = self.metrics.jobs_finished_total.clone();
        let timed_out_id = job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let mut job = deadline_slot.job.lock().await;
            if job.mark_timed_out() {
                warn!(
                    "Job {} timed out with {}/{} results",
                    timed_out_id,
                    job.resolved(),
                    job.expected()
                );
                finished.with_label_values(&["timed_out"]).inc();
                let _ = deadline_slot.status_tx.send_replace(JobStatus::TimedOut);
            }
        });

        Ok(job_id)
    }

    /// Apply one incoming result. Unknown task ids (already-retrieved jobs,
    /// duplicates of resolved pairs, results arriving after the deadline)
    /// are discarded.
    async fn on_result(&self, result: ResultMessage) {
        let key = { self.tasks.read().await.get(&result.task_id).cloned() };
        let Some(key) = key else {
            debug!("Discarding result for unknown task {}", result.task_id);
            self.metrics
                .results_received_total
                .with_label_values(&["discarded"])
                .inc();
            return;
        };
        let slot = { self.jobs.read().await.get(&key.job).cloned() };
        let Some(slot) = slot else {
            debug!("Discarding result for retrieved job {}", key.job);
            return;
        };

        let outcome = match result.status {
            ResultStatus::Success => CaptionOutcome::Success(result.payload),
            ResultStatus::Failure => CaptionOutcome::Failure(result.payload),
        };

        let mut job = slot.job.lock().await;
        let applied = job.apply_result(&key.image, &key.model, outcome);
        self.metrics
            .results_received_total
            .with_label_values(&[if applied { "applied" } else { "discarded" }])
            .inc();
        if applied && job.status() == JobStatus::Complete {
            info!("Job {} complete ({} results)", key.job, job.expected());
            self.metrics
                .jobs_finished_total
                .with_label_values(&["complete"])
                .inc();
            let _ = slot.status_tx.send_replace(JobStatus::Complete);
        }
    }

    /// Non-blocking snapshot of a job's aggregate response.
    pub async fn get_job_result(&self, job_id: &JobId) -> Result<JobResult, ClusterError> {
        let slot = self
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| ClusterError::JobNotFound(job_id.0.clone()))?;
        let job = slot.job.lock().await;
        Ok(job.to_result())
    }

    /// Await the job's terminal state (Complete or TimedOut) and return the
    /// aggregate response. The job's own deadline guarantees termination.
    pub async fn wait_job_result(&self, job_id: &JobId) -> Result<JobResult, ClusterError> {
        let slot = self
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| ClusterError::JobNotFound(job_id.0.clone()))?;

        let mut status_rx = slot.status_tx.subscribe();
        loop {
            {
                let job = slot.job.lock().await;
                if job.status().is_terminal() {
                    return Ok(job.to_result());
                }
            }
            if status_rx.changed().await.is_err() {
                let job = slot.job.lock().await;
                return Ok(job.to_result());
            }
        }
    }

    /// Retrieve a finished job's response and drop the job's state. Late
    /// results for it are discarded from then on.
    pub async fn take_job_result(&self, job_id: &JobId) -> Result<JobResult, ClusterError> {
        let slot = self
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| ClusterError::JobNotFound(job_id.0.clone()))?;

        let (result, task_ids) = {
            let job = slot.job.lock().await;
            if !job.status().is_terminal() {
                return Err(ClusterError::InvalidInput(format!(
                    "job {job_id} still in flight"
                )));
            }
            (job.to_result(), job.task_ids.clone())
        };

        self.jobs.write().await.remove(job_id);
        let mut tasks = self.tasks.write().await;
        for task_id in task_ids {
            tasks.remove(&task_id);
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Control plane
    // -----------------------------------------------------------------------

    async fn control(
        &self,
        worker: &WorkerId,
        request: ControlRequest,
    ) -> Result<ModelState, ClusterError> {
        if !self.registry.lock().expect("registry lock").is_live(worker) {
            return Err(ClusterError::WorkerNotFound(worker.0.clone()));
        }

        let subject = subject_control(&worker.0, request.op.as_str());
        let response: ControlResponse = request_json(
            self.transport.as_ref(),
            &subject,
            &request,
            self.config.control_timeout,
        )
        .await
        .map_err(|e| match e {
            TransportError::Timeout | TransportError::NoResponders => {
                ClusterError::WorkerUnreachable(worker.0.clone())
            }
            other => ClusterError::Transport(other),
        })?;

        match response.status {
            ControlStatus::Ok => Ok(response.model_state.unwrap_or(ModelState::Unloaded)),
            ControlStatus::Error => {
                let message = response.message.unwrap_or_else(|| "unknown error".into());
                Err(match response.kind {
                    Some(ControlErrorKind::DownloadError) => ClusterError::DownloadError(message),
                    Some(ControlErrorKind::ModelBusy) => ClusterError::ModelBusy(message),
                    Some(ControlErrorKind::ModelUnavailable) => {
                        ClusterError::ModelUnavailable(message)
                    }
                    _ => ClusterError::InvalidInput(message),
                })
            }
        }
    }

    /// Ask one worker to fetch a model from the hub into its cache.
    /// Validated against the hub catalog first, so unknown names fail fast
    /// with `DownloadError` — recoverable by uploading custom code instead.
    pub async fn request_download(
        &self,
        worker: &WorkerId,
        model: &str,
    ) -> Result<ModelState, ClusterError> {
        if !self.hub.model_exists(model).await? {
            return Err(ClusterError::DownloadError(format!(
                "model '{model}' not in hub catalog"
            )));
        }
        self.control(
            worker,
            ControlRequest {
                op: ControlOp::Download,
                model_id: model.to_string(),
                code: None,
            },
        )
        .await
    }

    /// Install caller-supplied inference code on one worker, in place of a
    /// hub download.
    pub async fn request_custom_download(
        &self,
        worker: &WorkerId,
        model: &str,
        code: &[u8],
    ) -> Result<ModelState, ClusterError> {
        self.control(
            worker,
            ControlRequest {
                op: ControlOp::DownloadCustom,
                model_id: model.to_string(),
                code: Some(encode_code_blob(code)),
            },
        )
        .await
    }

    /// Remove a model's bytes from one worker.
    pub async fn request_delete(
        &self,
        worker: &WorkerId,
        model: &str,
    ) -> Result<ModelState, ClusterError> {
        self.control(
            worker,
            ControlRequest {
                op: ControlOp::Delete,
                model_id: model.to_string(),
                code: None,
            },
        )
        .await
    }

    /// Evict a model from one worker's memory, keeping its cached bytes.
    pub async fn request_unload(
        &self,
        worker: &WorkerId,
        model: &str,
    ) -> Result<ModelState, ClusterError> {
        self.control(
            worker,
            ControlRequest {
                op: ControlOp::Unload,
                model_id: model.to_string(),
                code: None,
            },
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Live workers with their model inventories.
    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        self.registry.lock().expect("registry lock").list()
    }

    /// The hub's model catalog (registry-hosted, not worker-specific).
    pub async fn list_hub_models(&self) -> Result<Vec<String>, ClusterError> {
        self.hub.list_models().await
    }

    /// Models cached somewhere in the live fleet.
    pub fn cluster_models(&self) -> Vec<String> {
        self.registry.lock().expect("registry lock").known_models()
    }
}
