//! Worker backend speaking the worker's HTTP protocol.

use super::{ContainerLease, ContainerRequest, Task, WorkerBackend};
use crate::config::EngineConfig;
use crate::errors::{PipegraphError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RequestResponse {
    uuid: String,
}

#[derive(Debug, Serialize)]
struct UuidRequest<'a> {
    uuid: &'a str,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    ready: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    base_url: String,
    #[serde(default)]
    parallelism: usize,
}

#[derive(Debug, Serialize)]
struct ExecTaskRequest<'a> {
    task: &'a Task,
}

/// Allocates containers through a worker's `/container/*` endpoints and
/// posts tasks to the container's `/exec/task`.
#[derive(Debug, Clone)]
pub struct HttpWorkerBackend {
    client: reqwest::Client,
    worker_url: String,
    poll_interval: Duration,
}

impl HttpWorkerBackend {
    /// Creates a backend for the worker at `worker_url`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built.
    pub fn new(
        worker_url: impl Into<String>,
        request_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(transport)?;
        Ok(Self {
            client,
            worker_url: worker_url.into().trim_end_matches('/').to_string(),
            poll_interval,
        })
    }

    /// Creates a backend if the configuration names a worker.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the HTTP client cannot be built.
    pub fn from_config(config: &EngineConfig) -> Result<Option<Self>> {
        config
            .worker_url
            .as_ref()
            .map(|url| {
                Self::new(url.clone(), config.request_timeout(), config.container_poll_interval())
            })
            .transpose()
    }

    async fn post<B, R>(&self, base: &str, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.post_raw(base, path, body).await?;
        response.json::<R>().await.map_err(transport)
    }

    async fn post_raw<B>(&self, base: &str, path: &str, body: &B) -> Result<reqwest::Response>
    where
        B: Serialize + Sync + ?Sized,
    {
        let url = format!("{}{path}", base.trim_end_matches('/'));
        let response = self.client.post(&url).json(body).send().await.map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(PipegraphError::Transport(format!("POST {url} returned {status}: {}", text.trim())))
    }
}

fn transport(err: reqwest::Error) -> PipegraphError {
    PipegraphError::Transport(err.to_string())
}

#[async_trait]
impl WorkerBackend for HttpWorkerBackend {
    async fn acquire_container(&self, request: ContainerRequest) -> Result<ContainerLease> {
        let RequestResponse { uuid } =
            self.post(&self.worker_url, "/container/request", &request).await?;
        debug!(node = %request.node, container = %uuid, "container requested");

        loop {
            let status: StatusResponse = self
                .post(&self.worker_url, "/container/status", &UuidRequest { uuid: &uuid })
                .await?;
            if status.ready {
                return Ok(ContainerLease {
                    uuid,
                    base_url: status.base_url,
                    parallelism: status.parallelism,
                });
            }
            debug!(container = %uuid, message = %status.message, "still waiting for container");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn exec_task(&self, lease: &ContainerLease, task: &Task) -> Result<()> {
        self.post_raw(&lease.base_url, "/exec/task", &ExecTaskRequest { task })
            .await
            .map(|_| ())
    }

    async fn release_container(&self, lease: &ContainerLease) -> Result<()> {
        self.post_raw(&self.worker_url, "/container/end", &UuidRequest { uuid: &lease.uuid })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_without_worker() {
        assert!(HttpWorkerBackend::from_config(&EngineConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_from_config_trims_url() {
        let config = EngineConfig::default().with_worker_url("http://worker:8081/");
        let backend = HttpWorkerBackend::from_config(&config).unwrap().unwrap();
        assert_eq!(backend.worker_url, "http://worker:8081");
        assert_eq!(backend.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_status_response_defaults() {
        let status: StatusResponse =
            serde_json::from_str(r#"{"ready": false, "message": "pulling"}"#).unwrap();
        assert!(!status.ready);
        assert_eq!(status.parallelism, 0);
        assert_eq!(status.message, "pulling");
    }

    #[test]
    fn test_exec_task_body_shape() {
        let task = Task::new("k1");
        let body = serde_json::to_value(ExecTaskRequest { task: &task }).unwrap();
        assert_eq!(body["task"]["key"], "k1");
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_transport_error() {
        let backend = HttpWorkerBackend::new(
            "http://127.0.0.1:9",
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
        .unwrap();
        let lease = ContainerLease {
            uuid: "c1".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            parallelism: 1,
        };
        let err = backend.release_container(&lease).await.unwrap_err();
        assert!(matches!(err, PipegraphError::Transport(_)));
    }
}
