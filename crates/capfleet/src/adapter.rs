//! Inference adapters: the seam between task orchestration and the actual
//! captioning computation.
//!
//! Every adapter satisfies the same two-method contract (`load()` is
//! idempotent initialization, `infer(image)` returns a caption), with two
//! origins: hosted models resolved by name from the hub, and custom models
//! whose caller-uploaded code is installed next to the cache and executed.
//! The forward pass itself is an external collaborator: adapters talk to a
//! runner process over a line-delimited JSON protocol.

use crate::ClusterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

/// File name under a model's cache directory where caller-uploaded custom
/// inference code is installed.
pub const CUSTOM_CODE_FILE: &str = "adapter.py";

/// Where a model's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelOrigin {
    /// Resolved by name against the model hub.
    Hosted,
    /// Caller-uploaded inference code.
    Custom,
}

/// Everything a factory needs to build an adapter for one model.
#[derive(Debug, Clone)]
pub struct AdapterSpec {
    pub model_id: String,
    pub model_dir: PathBuf,
    pub origin: ModelOrigin,
}

/// The load/infer contract consumed by the worker runtime.
#[async_trait]
pub trait CaptionAdapter: Send {
    /// Idempotent initialization; brings the model into memory.
    async fn load(&mut self) -> Result<(), ClusterError>;

    /// Caption one image.
    async fn infer(&mut self, image: &[u8]) -> Result<String, ClusterError>;
}

/// Builds adapters per model; injected into the worker runtime.
pub trait AdapterFactory: Send + Sync {
    fn make(&self, spec: &AdapterSpec) -> Result<Box<dyn CaptionAdapter>, ClusterError>;
}

// ---------------------------------------------------------------------------
// Runner protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RunnerRequest {
    Load,
    Infer { image: String },
}

#[derive(Debug, Deserialize)]
struct RunnerResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

// ---------------------------------------------------------------------------
// Process adapter
// ---------------------------------------------------------------------------

/// Adapter that delegates load/infer to a child process speaking
/// line-delimited JSON on stdin/stdout. One child per loaded model; the
/// child dies with the adapter (eviction frees its memory).
pub struct ProcessAdapter {
    command: Vec<String>,
    io: Option<ChildIo>,
}

struct ChildIo {
    // Held so the child is killed when the adapter drops.
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessAdapter {
    pub fn new(command: Vec<String>) -> Self {
        Self { command, io: None }
    }

    async fn call(io: &mut ChildIo, request: &RunnerRequest) -> Result<RunnerResponse, ClusterError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| ClusterError::Adapter(e.to_string()))?;
        line.push('\n');
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ClusterError::Adapter(format!("runner write failed: {e}")))?;
        io.stdin
            .flush()
            .await
            .map_err(|e| ClusterError::Adapter(format!("runner write failed: {e}")))?;

        let mut response = String::new();
        let read = io
            .stdout
            .read_line(&mut response)
            .await
            .map_err(|e| ClusterError::Adapter(format!("runner read failed: {e}")))?;
        if read == 0 {
            return Err(ClusterError::Adapter("runner exited".into()));
        }
        serde_json::from_str(&response)
            .map_err(|e| ClusterError::Adapter(format!("bad runner response: {e}")))
    }
}

#[async_trait]
impl CaptionAdapter for ProcessAdapter {
    async fn load(&mut self) -> Result<(), ClusterError> {
        if self.io.is_some() {
            return Ok(());
        }
        let program = self
            .command
            .first()
            .ok_or_else(|| ClusterError::Adapter("empty runner command".into()))?;
        debug!("Spawning runner: {:?}", self.command);

        let mut child = Command::new(program)
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClusterError::Adapter(format!("runner spawn failed: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClusterError::Adapter("runner stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterError::Adapter("runner stdout unavailable".into()))?;
        let mut io = ChildIo {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let resp = Self::call(&mut io, &RunnerRequest::Load).await?;
        if !resp.ok {
            return Err(ClusterError::Adapter(
                resp.error.unwrap_or_else(|| "load failed".into()),
            ));
        }
        self.io = Some(io);
        Ok(())
    }

    async fn infer(&mut self, image: &[u8]) -> Result<String, ClusterError> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| ClusterError::Adapter("adapter not loaded".into()))?;
        let request = RunnerRequest::Infer {
            image: crate::protocol::encode_code_blob(image),
        };
        let resp = Self::call(io, &request).await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                // A dead runner stays dead until the next load().
                self.io = None;
                return Err(e);
            }
        };
        if !resp.ok {
            return Err(ClusterError::Adapter(
                resp.error.unwrap_or_else(|| "inference failed".into()),
            ));
        }
        resp.caption
            .ok_or_else(|| ClusterError::Adapter("runner returned no caption".into()))
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Default factory: hosted models run through a deployment-configured runner
/// command (the model directory is appended as the last argument); custom
/// models run their installed code file through the custom runner.
pub struct ProcessAdapterFactory {
    hosted_runner: Vec<String>,
    custom_runner: Vec<String>,
}

impl ProcessAdapterFactory {
    pub fn new(hosted_runner: Vec<String>, custom_runner: Vec<String>) -> Self {
        Self {
            hosted_runner,
            custom_runner,
        }
    }
}

impl AdapterFactory for ProcessAdapterFactory {
    fn make(&self, spec: &AdapterSpec) -> Result<Box<dyn CaptionAdapter>, ClusterError> {
        let command = match spec.origin {
            ModelOrigin::Hosted => {
                if self.hosted_runner.is_empty() {
                    return Err(ClusterError::ModelUnavailable(format!(
                        "no hosted runner configured for '{}'",
                        spec.model_id
                    )));
                }
                let mut cmd = self.hosted_runner.clone();
                cmd.push(spec.model_dir.display().to_string());
                cmd
            }
            ModelOrigin::Custom => {
                let code = spec.model_dir.join(CUSTOM_CODE_FILE).display().to_string();
                if self.custom_runner.is_empty() {
                    vec![code]
                } else {
                    let mut cmd = self.custom_runner.clone();
                    cmd.push(code);
                    cmd
                }
            }
        };
        Ok(Box::new(ProcessAdapter::new(command)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shell runner implementing the line protocol with canned answers.
    const ECHO_RUNNER: &str = r#"
        while IFS= read -r line; do
          case "$line" in
            *'"op":"load"'*) echo '{"ok":true}' ;;
            *'"op":"infer"'*) echo '{"ok":true,"caption":"a test caption"}' ;;
            *) echo '{"ok":false,"error":"bad request"}' ;;
          esac
        done
    "#;

    const FAILING_RUNNER: &str = r#"
        while IFS= read -r line; do
          echo '{"ok":false,"error":"weights corrupt"}'
        done
    "#;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_process_adapter_load_and_infer() {
        let mut adapter = ProcessAdapter::new(sh(ECHO_RUNNER));
        adapter.load().await.unwrap();
        let caption = adapter.infer(b"image-bytes").await.unwrap();
        assert_eq!(caption, "a test caption");
    }

    #[tokio::test]
    async fn test_process_adapter_load_idempotent() {
        let mut adapter = ProcessAdapter::new(sh(ECHO_RUNNER));
        adapter.load().await.unwrap();
        adapter.load().await.unwrap();
        assert!(adapter.infer(b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_process_adapter_load_failure() {
        let mut adapter = ProcessAdapter::new(sh(FAILING_RUNNER));
        let err = adapter.load().await.unwrap_err();
        assert!(err.to_string().contains("weights corrupt"));
    }

    #[tokio::test]
    async fn test_process_adapter_infer_before_load() {
        let mut adapter = ProcessAdapter::new(sh(ECHO_RUNNER));
        let err = adapter.infer(b"x").await.unwrap_err();
        assert!(err.to_string().contains("not loaded"));
    }

    #[tokio::test]
    async fn test_process_adapter_spawn_failure() {
        let mut adapter = ProcessAdapter::new(vec!["/nonexistent/runner".into()]);
        assert!(adapter.load().await.is_err());
    }

    #[test]
    fn test_factory_hosted_requires_runner() {
        let factory = ProcessAdapterFactory::new(vec![], vec!["python3".into()]);
        let spec = AdapterSpec {
            model_id: "m".into(),
            model_dir: "/cache/m".into(),
            origin: ModelOrigin::Hosted,
        };
        let err = factory.make(&spec).err().unwrap();
        assert!(matches!(err, ClusterError::ModelUnavailable(_)));
    }

    #[test]
    fn test_factory_builds_custom_adapter() {
        let factory = ProcessAdapterFactory::new(vec![], vec!["python3".into()]);
        let spec = AdapterSpec {
            model_id: "m".into(),
            model_dir: "/cache/m".into(),
            origin: ModelOrigin::Custom,
        };
        assert!(factory.make(&spec).is_ok());
    }
}
