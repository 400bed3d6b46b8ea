//! Prometheus metrics for cluster operations.
//!
//! These are read-only taps on runtime events; exposition is left to the
//! embedding process.

use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Worker-side metrics.
#[derive(Clone)]
pub struct WorkerMetrics {
    registry: Arc<Registry>,
    /// Tasks processed, by model and outcome (success, failure).
    pub tasks_processed_total: CounterVec,
    /// Inference duration in seconds, by model.
    pub inference_duration_seconds: HistogramVec,
    /// Models with bytes in the local cache.
    pub models_cached: Gauge,
    /// Models resident in memory.
    pub models_loaded: Gauge,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let tasks_processed_total = CounterVec::new(
            Opts::new(
                "capfleet_worker_tasks_processed_total",
                "Tasks processed by model and outcome",
            ),
            &["model", "outcome"],
        )
        .expect("failed to create tasks_processed_total counter");

        let inference_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "capfleet_worker_inference_duration_seconds",
                "Inference duration in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["model"],
        )
        .expect("failed to create inference_duration_seconds histogram");

        let models_cached = Gauge::new(
            "capfleet_worker_models_cached",
            "Models with bytes in the local cache",
        )
        .expect("failed to create models_cached gauge");

        let models_loaded = Gauge::new(
            "capfleet_worker_models_loaded",
            "Models resident in memory",
        )
        .expect("failed to create models_loaded gauge");

        registry
            .register(Box::new(tasks_processed_total.clone()))
            .expect("failed to register tasks_processed_total");
        registry
            .register(Box::new(inference_duration_seconds.clone()))
            .expect("failed to register inference_duration_seconds");
        registry
            .register(Box::new(models_cached.clone()))
            .expect("failed to register models_cached");
        registry
            .register(Box::new(models_loaded.clone()))
            .expect("failed to register models_loaded");

        Self {
            registry: Arc::new(registry),
            tasks_processed_total,
            inference_duration_seconds,
            models_cached,
            models_loaded,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator-side metrics.
#[derive(Clone)]
pub struct CoordinatorMetrics {
    registry: Arc<Registry>,
    /// Jobs submitted.
    pub jobs_submitted_total: Counter,
    /// Jobs finished, by final status (complete, timed_out).
    pub jobs_finished_total: CounterVec,
    /// Results received, by application outcome (applied, discarded).
    pub results_received_total: CounterVec,
    /// Live workers currently in the registry.
    pub workers_live: Gauge,
}

impl CoordinatorMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_submitted_total = Counter::new("capfleet_jobs_submitted_total", "Jobs submitted")
            .expect("failed to create jobs_submitted_total counter");

        let jobs_finished_total = CounterVec::new(
            Opts::new(
                "capfleet_jobs_finished_total",
                "Jobs finished by final status",
            ),
            &["status"],
        )
        .expect("failed to create jobs_finished_total counter");

        let results_received_total = CounterVec::new(
            Opts::new(
                "capfleet_results_received_total",
                "Task results received by application outcome",
            ),
            &["outcome"],
        )
        .expect("failed to create results_received_total counter");

        let workers_live = Gauge::new("capfleet_workers_live", "Live workers in the registry")
            .expect("failed to create workers_live gauge");

        registry
            .register(Box::new(jobs_submitted_total.clone()))
            .expect("failed to register jobs_submitted_total");
        registry
            .register(Box::new(jobs_finished_total.clone()))
            .expect("failed to register jobs_finished_total");
        registry
            .register(Box::new(results_received_total.clone()))
            .expect("failed to register results_received_total");
        registry
            .register(Box::new(workers_live.clone()))
            .expect("failed to register workers_live");

        Self {
            registry: Arc::new(registry),
            jobs_submitted_total,
            jobs_finished_total,
            results_received_total,
            workers_live,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
