//! Model hub client.
//!
//! The hub is the registry-hosted catalog of caption models. Workers fetch
//! artifacts from it into their local cache; the coordinator consults it for
//! the available-model catalog and to validate download requests before
//! dispatching them.

use crate::transport::encode_model_token;
use crate::ClusterError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the artifact file inside a model's cache directory.
pub const ARTIFACT_FILE: &str = "model.bin";

#[derive(Debug, Deserialize)]
struct ModelCatalog {
    models: Vec<String>,
}

/// HTTP client for the model hub.
#[derive(Clone)]
pub struct HubClient {
    base_url: String,
    client: reqwest::Client,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap_or_default(),
        }
    }

    /// The hub's model catalog (not worker-specific).
    pub async fn list_models(&self) -> Result<Vec<String>, ClusterError> {
        let url = format!("{}/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClusterError::DownloadError(format!("hub unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClusterError::DownloadError(format!(
                "hub catalog request failed: HTTP {}",
                resp.status()
            )));
        }
        let catalog: ModelCatalog = resp
            .json()
            .await
            .map_err(|e| ClusterError::DownloadError(format!("bad hub catalog: {e}")))?;
        Ok(catalog.models)
    }

    /// Whether the hub hosts this model.
    pub async fn model_exists(&self, model_id: &str) -> Result<bool, ClusterError> {
        Ok(self.list_models().await?.iter().any(|m| m == model_id))
    }

    /// Fetch a model's artifact into `dest_dir`. Returns the artifact path.
    pub async fn download(&self, model_id: &str, dest_dir: &Path) -> Result<PathBuf, ClusterError> {
        let url = format!("{}/artifact", self.base_url);
        debug!("Fetching artifact for '{}' from {}", model_id, url);

        let resp = self
            .client
            .get(&url)
            .query(&[("model", model_id)])
            .send()
            .await
            .map_err(|e| ClusterError::DownloadError(format!("hub unreachable: {e}")))?;
        if !resp.status().is_success() {
            return Err(ClusterError::DownloadError(format!(
                "artifact fetch for '{}' failed: HTTP {}",
                model_id,
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ClusterError::DownloadError(format!("artifact read failed: {e}")))?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| ClusterError::DownloadError(format!("cache dir create failed: {e}")))?;
        let path = dest_dir.join(ARTIFACT_FILE);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ClusterError::DownloadError(format!("artifact write failed: {e}")))?;

        info!(
            "Downloaded '{}' ({} bytes) into {}",
            model_id,
            bytes.len(),
            dest_dir.display()
        );
        Ok(path)
    }

    /// Directory a model's artifacts live in under a worker cache root.
    pub fn model_dir(cache_dir: &Path, model_id: &str) -> PathBuf {
        cache_dir.join(encode_model_token(model_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use warp::Filter;

    /// Mock hub: a catalog plus per-model artifact bytes.
    async fn start_mock_hub(models: HashMap<String, Vec<u8>>) -> u16 {
        let models = Arc::new(models);

        let catalog_models = models.clone();
        let catalog = warp::path("models").and(warp::get()).map(move || {
            let names: Vec<&String> = catalog_models.keys().collect();
            warp::reply::json(&serde_json::json!({ "models": names }))
        });

        let artifact_models = models.clone();
        let artifact = warp::path("artifact")
            .and(warp::get())
            .and(warp::query::<HashMap<String, String>>())
            .map(move |query: HashMap<String, String>| {
                let name = query.get("model").cloned().unwrap_or_default();
                match artifact_models.get(&name) {
                    Some(bytes) => warp::http::Response::builder()
                        .status(200)
                        .body(bytes.clone()),
                    None => warp::http::Response::builder().status(404).body(Vec::new()),
                }
            });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
            warp::serve(catalog.or(artifact)).run_incoming(incoming).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        port
    }

    #[tokio::test]
    async fn test_list_models() {
        let mut models = HashMap::new();
        models.insert("m1".to_string(), b"weights".to_vec());
        let port = start_mock_hub(models).await;

        let hub = HubClient::new(format!("http://127.0.0.1:{port}"));
        let listed = hub.list_models().await.unwrap();
        assert_eq!(listed, vec!["m1"]);
    }

    #[tokio::test]
    async fn test_model_exists() {
        let mut models = HashMap::new();
        models.insert("good".to_string(), vec![1, 2, 3]);
        let port = start_mock_hub(models).await;

        let hub = HubClient::new(format!("http://127.0.0.1:{port}"));
        assert!(hub.model_exists("good").await.unwrap());
        assert!(!hub.model_exists("bad-model").await.unwrap());
    }

    #[tokio::test]
    async fn test_download_writes_artifact() {
        let mut models = HashMap::new();
        models.insert("org/model".to_string(), b"artifact-bytes".to_vec());
        let port = start_mock_hub(models).await;

        let hub = HubClient::new(format!("http://127.0.0.1:{port}"));
        let dir = tempfile::tempdir().unwrap();
        let dest = HubClient::model_dir(dir.path(), "org/model");

        let path = hub.download("org/model", &dest).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"artifact-bytes");
    }

    #[tokio::test]
    async fn test_download_missing_model_is_download_error() {
        let port = start_mock_hub(HashMap::new()).await;
        let hub = HubClient::new(format!("http://127.0.0.1:{port}"));
        let dir = tempfile::tempdir().unwrap();

        let err = hub
            .download("bad-model", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::DownloadError(_)));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_hub_unreachable_is_download_error() {
        // Port 1 is essentially never listening.
        let hub = HubClient::new("http://127.0.0.1:1");
        let err = hub.list_models().await.unwrap_err();
        assert!(matches!(err, ClusterError::DownloadError(_)));
    }

    #[test]
    fn test_model_dir_is_token_encoded() {
        let dir = HubClient::model_dir(Path::new("/cache"), "org/model");
        let name = dir.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("org_model-"));
        assert!(!name.contains('/'));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let hub = HubClient::new("http://localhost:8080/");
        assert_eq!(hub.base_url, "http://localhost:8080");
    }
}
