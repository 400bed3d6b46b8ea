//! Heartbeat cadence and worker expiry.

use crate::registry::{Liveness, WorkerId, WorkerRegistry};
use std::time::Duration;
use tracing::warn;

/// Workers send heartbeats this often.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Missed intervals before a worker is considered gone.
pub const EXPIRY_MISSED_INTERVALS: u32 = 3;

/// Silence threshold after which a worker expires.
pub fn expiry_timeout() -> Duration {
    HEARTBEAT_INTERVAL * EXPIRY_MISSED_INTERVALS
}

/// Result of an expiry sweep across all workers.
#[derive(Debug, Default)]
pub struct SweepResult {
    pub workers_checked: usize,
    pub workers_expired: Vec<WorkerId>,
}

/// Mark Live workers Expired when their last heartbeat is older than
/// `timeout`. Returns the workers newly expired in this sweep.
pub fn expiry_sweep(registry: &mut WorkerRegistry, timeout: Duration) -> SweepResult {
    let mut result = SweepResult::default();

    for worker in registry.workers.values_mut() {
        result.workers_checked += 1;

        if worker.liveness == Liveness::Live && worker.last_heartbeat.elapsed() > timeout {
            warn!(
                "Worker {} expired (no heartbeat for {:?})",
                worker.id,
                worker.last_heartbeat.elapsed()
            );
            worker.liveness = Liveness::Expired;
            result.workers_expired.push(worker.id.clone());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HeartbeatMessage, WorkerPresence};
    use chrono::Utc;
    use std::time::Instant;

    fn heartbeat(worker: &str) -> HeartbeatMessage {
        HeartbeatMessage {
            worker_id: worker.into(),
            cached_models: vec![],
            loaded_models: vec![],
            timestamp: Utc::now(),
            status: WorkerPresence::Online,
        }
    }

    fn age(registry: &mut WorkerRegistry, worker: &str, by: Duration) {
        registry
            .workers
            .get_mut(&WorkerId(worker.into()))
            .unwrap()
            .last_heartbeat = Instant::now() - by;
    }

    #[test]
    fn test_sweep_keeps_fresh_workers() {
        let mut registry = WorkerRegistry::new();
        registry.ingest(&heartbeat("w1"));

        let result = expiry_sweep(&mut registry, Duration::from_secs(15));
        assert_eq!(result.workers_checked, 1);
        assert!(result.workers_expired.is_empty());
        assert!(registry.is_live(&WorkerId("w1".into())));
    }

    #[test]
    fn test_sweep_expires_stale_worker() {
        let mut registry = WorkerRegistry::new();
        registry.ingest(&heartbeat("w1"));
        age(&mut registry, "w1", Duration::from_secs(20));

        let result = expiry_sweep(&mut registry, Duration::from_secs(15));
        assert_eq!(result.workers_expired, vec![WorkerId("w1".into())]);
        assert!(!registry.is_live(&WorkerId("w1".into())));
    }

    #[test]
    fn test_sweep_idempotent_on_second_pass() {
        let mut registry = WorkerRegistry::new();
        registry.ingest(&heartbeat("w1"));
        age(&mut registry, "w1", Duration::from_secs(20));

        let first = expiry_sweep(&mut registry, Duration::from_secs(15));
        assert_eq!(first.workers_expired.len(), 1);

        let second = expiry_sweep(&mut registry, Duration::from_secs(15));
        assert!(second.workers_expired.is_empty());
        assert_eq!(second.workers_checked, 1);
    }

    #[test]
    fn test_sweep_empty_registry() {
        let mut registry = WorkerRegistry::new();
        let result = expiry_sweep(&mut registry, Duration::from_secs(15));
        assert_eq!(result.workers_checked, 0);
        assert!(result.workers_expired.is_empty());
    }

    #[test]
    fn test_sweep_mixed_fresh_and_stale() {
        let mut registry = WorkerRegistry::new();
        registry.ingest(&heartbeat("w1"));
        registry.ingest(&heartbeat("w2"));
        registry.ingest(&heartbeat("w3"));
        age(&mut registry, "w2", Duration::from_secs(30));
        age(&mut registry, "w3", Duration::from_secs(30));

        let result = expiry_sweep(&mut registry, Duration::from_secs(15));
        assert_eq!(result.workers_checked, 3);
        assert_eq!(result.workers_expired.len(), 2);
        assert!(registry.is_live(&WorkerId("w1".into())));
    }

    #[test]
    fn test_expired_worker_rejoins_via_heartbeat() {
        let mut registry = WorkerRegistry::new();
        registry.ingest(&heartbeat("w1"));
        age(&mut registry, "w1", Duration::from_secs(30));
        expiry_sweep(&mut registry, Duration::from_secs(15));
        assert!(!registry.is_live(&WorkerId("w1".into())));

        registry.ingest(&heartbeat("w1"));
        assert!(registry.is_live(&WorkerId("w1".into())));
        let result = expiry_sweep(&mut registry, Duration::from_secs(15));
        assert!(result.workers_expired.is_empty());
    }

    #[test]
    fn test_expiry_timeout_covers_missed_intervals() {
        assert_eq!(expiry_timeout(), HEARTBEAT_INTERVAL * EXPIRY_MISSED_INTERVALS);
        assert!(expiry_timeout() > HEARTBEAT_INTERVAL);
    }
}
