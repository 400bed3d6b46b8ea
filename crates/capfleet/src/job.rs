//! Job state: one client-submitted batch of images × models.
//!
//! A job owns the result map for its (image, model) pairs. Result
//! application is idempotent so at-least-once delivery from the broker is
//! harmless, and the aggregate response always contains exactly
//! `images × models` entries — resolved pairs carry their outcome, and on
//! timeout the remainder is back-filled as `Timeout`.

use crate::ClusterError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Dispatching,
    Awaiting,
    Complete,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::TimedOut)
    }
}

/// Final outcome for one (image, model) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "text", rename_all = "snake_case")]
pub enum CaptionOutcome {
    Success(String),
    Failure(String),
    Timeout,
}

/// One model's caption (or error) for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCaption {
    pub model: String,
    #[serde(flatten)]
    pub outcome: CaptionOutcome,
}

/// All captions for one image, in model submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCaptions {
    pub image: String,
    pub captions: Vec<ModelCaption>,
}

/// Aggregate response for a finished (or snapshotted) job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub images: Vec<ImageCaptions>,
}

/// One batch of images × models awaiting aggregate captions.
///
/// Owned exclusively by the coordinator; mutated only by result arrivals and
/// the deadline timer.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    images: Vec<String>,
    models: Vec<String>,
    expected: usize,
    results: HashMap<(String, String), CaptionOutcome>,
    status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: Duration,
    /// Task ids this job fanned out, kept for index cleanup on retrieval.
    pub task_ids: Vec<String>,
}

impl Job {
    /// Create a job. Fails with `InvalidInput` if either list is empty.
    pub fn new(
        id: JobId,
        images: Vec<String>,
        models: Vec<String>,
        deadline: Duration,
    ) -> Result<Self, ClusterError> {
        if images.is_empty() {
            return Err(ClusterError::InvalidInput("empty image list".into()));
        }
        if models.is_empty() {
            return Err(ClusterError::InvalidInput("empty model list".into()));
        }
        let expected = images.len() * models.len();
        Ok(Self {
            id,
            images,
            models,
            expected,
            results: HashMap::new(),
            status: JobStatus::Dispatching,
            created_at: Utc::now(),
            deadline,
            task_ids: Vec::new(),
        })
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn resolved(&self) -> usize {
        self.results.len()
    }

    pub fn images(&self) -> &[String] {
        &self.images
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    /// All tasks published; results may now arrive.
    pub fn mark_awaiting(&mut self) {
        if self.status == JobStatus::Dispatching {
            self.status = JobStatus::Awaiting;
        }
    }

    /// Deadline fired. No-op if the job already completed.
    pub fn mark_timed_out(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::TimedOut;
        true
    }

    /// Apply one result. Returns `true` if the result was recorded.
    ///
    /// Idempotent: duplicates for an already-resolved pair, results for
    /// unknown pairs, and results arriving after the job reached a terminal
    /// state are all discarded.
    pub fn apply_result(&mut self, image: &str, model: &str, outcome: CaptionOutcome) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if !self.images.iter().any(|i| i == image) || !self.models.iter().any(|m| m == model) {
            return false;
        }
        let key = (image.to_string(), model.to_string());
        if self.results.contains_key(&key) {
            return false;
        }
        self.results.insert(key, outcome);
        if self.results.len() == self.expected {
            self.status = JobStatus::Complete;
        }
        true
    }

    /// Build the aggregate response: every (image, model) pair exactly once,
    /// in submission order. For timed-out jobs, unresolved pairs are
    /// reported as `Timeout`; for jobs still in flight they are omitted.
    pub fn to_result(&self) -> JobResult {
        let images = self
            .images
            .iter()
            .map(|image| {
                let captions = self
                    .models
                    .iter()
                    .filter_map(|model| {
                        let key = (image.clone(), model.clone());
                        match self.results.get(&key) {
                            Some(outcome) => Some(ModelCaption {
                                model: model.clone(),
                                outcome: outcome.clone(),
                            }),
                            None if self.status == JobStatus::TimedOut => Some(ModelCaption {
                                model: model.clone(),
                                outcome: CaptionOutcome::Timeout,
                            }),
                            None => None,
                        }
                    })
                    .collect();
                ImageCaptions {
                    image: image.clone(),
                    captions,
                }
            })
            .collect();
        JobResult {
            job_id: self.id.clone(),
            status: self.status,
            images,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(images: &[&str], models: &[&str]) -> Job {
        Job::new(
            JobId("j1".into()),
            images.iter().map(|s| s.to_string()).collect(),
            models.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(60),
        )
        .unwrap()
    }

    #[test]
    fn test_new_job_rejects_empty_images() {
        let err = Job::new(
            JobId("j1".into()),
            vec![],
            vec!["m1".into()],
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidInput(_)));
    }

    #[test]
    fn test_new_job_rejects_empty_models() {
        let err = Job::new(
            JobId("j1".into()),
            vec!["a".into()],
            vec![],
            Duration::from_secs(60),
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidInput(_)));
    }

    #[test]
    fn test_expected_task_count() {
        let j = job(&["a", "b", "c"], &["m1", "m2"]);
        assert_eq!(j.expected(), 6);
        assert_eq!(j.status(), JobStatus::Dispatching);
    }

    #[test]
    fn test_completes_when_all_results_arrive() {
        let mut j = job(&["a", "b"], &["m1"]);
        j.mark_awaiting();

        assert!(j.apply_result("a", "m1", CaptionOutcome::Success("cat".into())));
        assert_eq!(j.status(), JobStatus::Awaiting);
        assert!(j.apply_result("b", "m1", CaptionOutcome::Failure("boom".into())));
        assert_eq!(j.status(), JobStatus::Complete);
    }

    #[test]
    fn test_apply_result_idempotent() {
        let mut j = job(&["a"], &["m1", "m2"]);
        j.mark_awaiting();

        assert!(j.apply_result("a", "m1", CaptionOutcome::Success("first".into())));
        // Redelivered duplicate leaves the aggregate unchanged.
        assert!(!j.apply_result("a", "m1", CaptionOutcome::Success("second".into())));
        assert_eq!(j.resolved(), 1);

        let result = {
            j.apply_result("a", "m2", CaptionOutcome::Success("x".into()));
            j.to_result()
        };
        assert_eq!(
            result.images[0].captions[0].outcome,
            CaptionOutcome::Success("first".into())
        );
    }

    #[test]
    fn test_apply_result_unknown_pair_discarded() {
        let mut j = job(&["a"], &["m1"]);
        j.mark_awaiting();
        assert!(!j.apply_result("z", "m1", CaptionOutcome::Success("x".into())));
        assert!(!j.apply_result("a", "m9", CaptionOutcome::Success("x".into())));
        assert_eq!(j.resolved(), 0);
    }

    #[test]
    fn test_late_result_after_timeout_discarded() {
        let mut j = job(&["a"], &["m1"]);
        j.mark_awaiting();
        assert!(j.mark_timed_out());
        assert!(!j.apply_result("a", "m1", CaptionOutcome::Success("late".into())));
        assert_eq!(j.status(), JobStatus::TimedOut);
    }

    #[test]
    fn test_mark_timed_out_noop_after_complete() {
        let mut j = job(&["a"], &["m1"]);
        j.mark_awaiting();
        j.apply_result("a", "m1", CaptionOutcome::Success("cat".into()));
        assert_eq!(j.status(), JobStatus::Complete);
        assert!(!j.mark_timed_out());
        assert_eq!(j.status(), JobStatus::Complete);
    }

    #[test]
    fn test_timeout_backfill_exact_counts() {
        let mut j = job(&["a", "b"], &["m1", "m2"]);
        j.mark_awaiting();
        j.apply_result("a", "m1", CaptionOutcome::Success("cat".into()));
        j.mark_timed_out();

        let result = j.to_result();
        let total: usize = result.images.iter().map(|i| i.captions.len()).sum();
        assert_eq!(total, 4);

        let timeouts = result
            .images
            .iter()
            .flat_map(|i| &i.captions)
            .filter(|c| c.outcome == CaptionOutcome::Timeout)
            .count();
        assert_eq!(timeouts, 3);
    }

    #[test]
    fn test_result_preserves_submission_order() {
        let mut j = job(&["b", "a"], &["m2", "m1"]);
        j.mark_awaiting();
        for image in ["a", "b"] {
            for model in ["m1", "m2"] {
                j.apply_result(image, model, CaptionOutcome::Success(format!("{image}-{model}")));
            }
        }
        let result = j.to_result();
        assert_eq!(result.images[0].image, "b");
        assert_eq!(result.images[1].image, "a");
        assert_eq!(result.images[0].captions[0].model, "m2");
        assert_eq!(result.images[0].captions[1].model, "m1");
    }

    #[test]
    fn test_snapshot_while_awaiting_omits_pending() {
        let mut j = job(&["a"], &["m1", "m2"]);
        j.mark_awaiting();
        j.apply_result("a", "m1", CaptionOutcome::Success("cat".into()));

        let snapshot = j.to_result();
        assert_eq!(snapshot.status, JobStatus::Awaiting);
        assert_eq!(snapshot.images[0].captions.len(), 1);
    }

    #[test]
    fn test_caption_outcome_serde_shape() {
        let json = serde_json::to_value(CaptionOutcome::Success("a dog".into())).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["text"], "a dog");

        let json = serde_json::to_value(CaptionOutcome::Timeout).unwrap();
        assert_eq!(json["outcome"], "timeout");
    }

    #[test]
    fn test_model_caption_flattens_outcome() {
        let mc = ModelCaption {
            model: "m1".into(),
            outcome: CaptionOutcome::Failure("boom".into()),
        };
        let json = serde_json::to_value(&mc).unwrap();
        assert_eq!(json["model"], "m1");
        assert_eq!(json["outcome"], "failure");
        assert_eq!(json["text"], "boom");
    }
}
