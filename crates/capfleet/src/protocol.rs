//! Wire protocol between the coordinator and worker runtimes.
//!
//! These messages are the cross-deployment contract and must stay
//! bit-compatible: additive fields use `#[serde(default)]` /
//! `skip_serializing_if` so older peers keep interoperating.

use crate::ModelState;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of work: caption one image with one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub job_id: String,
    pub image_ref: ImageRef,
    pub model_id: String,
}

/// Opaque image handle, resolved to bytes by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageRef {
    /// Image bytes shipped inline, base64-encoded.
    Inline { data: String },
    /// Image fetched by the worker over HTTP.
    Url { url: String },
}

impl ImageRef {
    pub fn inline(bytes: &[u8]) -> Self {
        Self::Inline {
            data: BASE64.encode(bytes),
        }
    }

    pub fn url(url: impl Into<String>) -> Self {
        Self::Url { url: url.into() }
    }
}

/// Outcome of one task, published to the task's reply address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: String,
    pub status: ResultStatus,
    /// The caption on success, the failure reason otherwise.
    pub payload: String,
}

impl ResultMessage {
    pub fn success(task_id: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ResultStatus::Success,
            payload: caption.into(),
        }
    }

    pub fn failure(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: ResultStatus::Failure,
            payload: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Model-lifecycle operation requested of one specific worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub op: ControlOp,
    pub model_id: String,
    /// Caller-supplied inference code, base64-encoded. Only for
    /// [`ControlOp::DownloadCustom`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    Download,
    DownloadCustom,
    Delete,
    Unload,
}

impl ControlOp {
    /// Subject token for this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::DownloadCustom => "download_custom",
            Self::Delete => "delete",
            Self::Unload => "unload",
        }
    }
}

/// Response to a [`ControlRequest`], correlated via the request's reply
/// address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: ControlStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ControlErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_state: Option<ModelState>,
}

impl ControlResponse {
    pub fn ok(state: ModelState) -> Self {
        Self {
            status: ControlStatus::Ok,
            kind: None,
            message: None,
            model_state: Some(state),
        }
    }

    pub fn error(kind: ControlErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: ControlStatus::Error,
            kind: Some(kind),
            message: Some(message.into()),
            model_state: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlErrorKind {
    DownloadError,
    ModelBusy,
    ModelUnavailable,
    Invalid,
}

/// Periodic worker self-report: identity plus model inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub worker_id: String,
    pub cached_models: Vec<String>,
    pub loaded_models: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// `offline` announces a clean shutdown; the registry drops the worker
    /// immediately instead of waiting for expiry.
    #[serde(default)]
    pub status: WorkerPresence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPresence {
    Online,
    Offline,
}

impl Default for WorkerPresence {
    fn default() -> Self {
        Self::Online
    }
}

/// Decode inline image data.
pub fn decode_image_data(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data)
}

/// Encode a custom-code blob for a [`ControlRequest`].
pub fn encode_code_blob(code: &[u8]) -> String {
    BASE64.encode(code)
}

/// Decode a custom-code blob from a [`ControlRequest`].
pub fn decode_code_blob(code: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_message_serde() {
        let task = TaskMessage {
            task_id: "t1".into(),
            job_id: "j1".into(),
            image_ref: ImageRef::inline(b"\x89PNG"),
            model_id: "Salesforce/blip".into(),
        };
        let json = serde_json::to_string(&task).unwrap();
        let parsed: TaskMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id, "t1");
        assert_eq!(parsed.job_id, "j1");
        assert_eq!(parsed.model_id, "Salesforce/blip");
        assert_eq!(parsed.image_ref, task.image_ref);
    }

    #[test]
    fn test_image_ref_inline_roundtrip() {
        let original = b"not really a jpeg";
        let image_ref = ImageRef::inline(original);
        match &image_ref {
            ImageRef::Inline { data } => {
                assert_eq!(decode_image_data(data).unwrap(), original);
            }
            _ => panic!("expected inline"),
        }
    }

    #[test]
    fn test_image_ref_tagged_json_shape() {
        let json = serde_json::to_value(ImageRef::url("http://example/a.jpg")).unwrap();
        assert_eq!(json["kind"], "url");
        assert_eq!(json["url"], "http://example/a.jpg");
    }

    #[test]
    fn test_result_message_constructors() {
        let ok = ResultMessage::success("t1", "a cat on a mat");
        assert_eq!(ok.status, ResultStatus::Success);
        assert_eq!(ok.payload, "a cat on a mat");

        let err = ResultMessage::failure("t1", "model unavailable");
        assert_eq!(err.status, ResultStatus::Failure);
        assert_eq!(err.payload, "model unavailable");
    }

    #[test]
    fn test_control_request_code_skipped_when_none() {
        let req = ControlRequest {
            op: ControlOp::Download,
            model_id: "m".into(),
            code: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("code"));
        assert!(json.contains("\"download\""));
    }

    #[test]
    fn test_control_op_subject_tokens() {
        assert_eq!(ControlOp::Download.as_str(), "download");
        assert_eq!(ControlOp::DownloadCustom.as_str(), "download_custom");
        assert_eq!(ControlOp::Delete.as_str(), "delete");
        assert_eq!(ControlOp::Unload.as_str(), "unload");
    }

    #[test]
    fn test_control_op_serde_matches_subject_token() {
        // Wire form and subject token must agree for every op.
        for op in [
            ControlOp::Download,
            ControlOp::DownloadCustom,
            ControlOp::Delete,
            ControlOp::Unload,
        ] {
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{}\"", op.as_str()));
        }
    }

    #[test]
    fn test_control_response_ok() {
        let resp = ControlResponse::ok(ModelState::Cached);
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"ok\""));
        assert!(json.contains("\"cached\""));
        assert!(!json.contains("message"));
    }

    #[test]
    fn test_control_response_error_roundtrip() {
        let resp = ControlResponse::error(ControlErrorKind::ModelBusy, "task in flight");
        let parsed: ControlResponse =
            serde_json::from_str(&serde_json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(parsed.status, ControlStatus::Error);
        assert_eq!(parsed.kind, Some(ControlErrorKind::ModelBusy));
        assert_eq!(parsed.message.as_deref(), Some("task in flight"));
    }

    #[test]
    fn test_heartbeat_serde() {
        let hb = HeartbeatMessage {
            worker_id: "w1".into(),
            cached_models: vec!["m1".into(), "m2".into()],
            loaded_models: vec!["m1".into()],
            timestamp: Utc::now(),
            status: WorkerPresence::Online,
        };
        let parsed: HeartbeatMessage =
            serde_json::from_str(&serde_json::to_string(&hb).unwrap()).unwrap();
        assert_eq!(parsed.worker_id, "w1");
        assert_eq!(parsed.cached_models, vec!["m1", "m2"]);
        assert_eq!(parsed.loaded_models, vec!["m1"]);
        assert_eq!(parsed.status, WorkerPresence::Online);
    }

    #[test]
    fn test_heartbeat_backward_compat_missing_status() {
        // Heartbeats without a status field default to online.
        let json = r#"{"worker_id":"w1","cached_models":[],"loaded_models":[],
                       "timestamp":"2026-01-01T00:00:00Z"}"#;
        let parsed: HeartbeatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.status, WorkerPresence::Online);
    }

    #[test]
    fn test_code_blob_roundtrip() {
        let code = b"#!/bin/sh\necho hi\n";
        let encoded = encode_code_blob(code);
        assert_eq!(decode_code_blob(&encoded).unwrap(), code);
    }
}
