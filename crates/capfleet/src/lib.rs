//! # Capfleet
//!
//! Task distribution and model-lifecycle orchestration for a fleet of
//! image-captioning workers.
//!
//! A caller submits a batch of images and a set of named models; Capfleet
//! fans the batch out into per-(image, model) tasks, routes each task over
//! the broker to a worker that can serve that model, tracks every worker's
//! model inventory and lifecycle (download, load, evict, delete), and
//! correlates asynchronous results back into a per-job aggregate response
//! without letting partial failures discard unrelated results.
//!
//! ## Architecture
//!
//! - **Coordinator**: owns job state. Fans jobs out into tasks, collects
//!   results on a private inbox subject, resolves each job when all tasks
//!   arrive or its deadline fires. Also the control plane for per-worker
//!   model operations (download, custom upload, unload, delete).
//! - **Workers**: subscribe to one task subject per cached model (competing
//!   consumers), drive the model lifecycle state machine locally, and
//!   publish exactly one result per consumed task. Heartbeats carry the
//!   cached/loaded inventory.
//! - **Registry**: heartbeat-fed view of live workers and the aggregate
//!   model availability across them; workers that stop heartbeating expire.
//!
//! ## Usage
//!
//! ```bash
//! # Start a worker
//! capfleet worker --nats-url nats://localhost:4222 --cache-dir ./models
//!
//! # Submit a batch from any process
//! capfleet submit --image a.jpg --image b.jpg --model Salesforce/blip
//! ```

pub mod adapter;
pub mod coordinator;
pub mod health;
pub mod hub;
pub mod job;
pub mod memory_transport;
pub mod metrics;
pub mod model_manager;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod worker;

// Re-exports
pub use adapter::{AdapterFactory, AdapterSpec, CaptionAdapter, ModelOrigin, ProcessAdapterFactory};
pub use coordinator::{Coordinator, CoordinatorConfig, SubmittedImage};
pub use health::{
    expiry_sweep, expiry_timeout, SweepResult, EXPIRY_MISSED_INTERVALS, HEARTBEAT_INTERVAL,
};
pub use hub::HubClient;
pub use job::{CaptionOutcome, ImageCaptions, Job, JobId, JobResult, JobStatus, ModelCaption};
pub use memory_transport::MemoryTransport;
pub use metrics::{CoordinatorMetrics, WorkerMetrics};
pub use model_manager::ModelManager;
pub use protocol::{
    ControlErrorKind, ControlOp, ControlRequest, ControlResponse, ControlStatus, HeartbeatMessage,
    ImageRef, ResultMessage, ResultStatus, TaskMessage, WorkerPresence,
};
pub use registry::{Liveness, ModelAvailability, WorkerEntry, WorkerId, WorkerInfo, WorkerRegistry};
pub use transport::{NatsTransport, SharedTransport, Subscription, Transport, TransportError};
pub use worker::{WorkerConfig, WorkerRuntime};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a model on one worker.
///
/// A model is never `Loaded` without being `Cached` first: `Cached` means the
/// artifact bytes exist in the worker's local store, `Loaded` means the model
/// is additionally resident in memory and ready for immediate inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Downloading,
    Cached,
    Loaded,
    DownloadFailed,
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Downloading => write!(f, "downloading"),
            Self::Cached => write!(f, "cached"),
            Self::Loaded => write!(f, "loaded"),
            Self::DownloadFailed => write!(f, "download_failed"),
        }
    }
}

/// Errors that can occur in the cluster.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("model download failed: {0}")]
    DownloadError(String),

    #[error("model busy: {0}")]
    ModelBusy(String),

    #[error("worker unreachable: {0}")]
    WorkerUnreachable(String),

    #[error("deadline elapsed")]
    Timeout,

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("adapter error: {0}")]
    Adapter(String),
}
