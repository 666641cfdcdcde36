use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::api::types::{
    CompleteRequest, ErrorBody, ExecutionStatusResponse, ExecutionView, FailRequest,
    HeartbeatRequest, HeartbeatResponse, SubmitExecutionRequest, SubmitExecutionResponse,
};
use crate::error::{JobExecutionError, OrchestratorError, Result};
use crate::orchestrator::engine::{Dispatch, HealthReport, Progress};
use crate::scheduler::job::JobNode;
use crate::scheduler::pool::WorkerRecord;
use crate::scheduler::queue::{DeadLetter, QueueStats};
use crate::worker::runtime::{ControlPlane, WorkerRegistration};

/// JSON client for a server node's HTTP API. Used by the CLI and by remote
/// workers as their [`ControlPlane`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Ok(check(response).await?.json().await?)
    }

    /// POST expecting an empty body back.
    async fn post_empty<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        check(response).await?;
        Ok(())
    }

    // =========================================================================
    // Submission API
    // =========================================================================

    pub async fn submit(&self, workflow_id: &str, nodes: Vec<JobNode>) -> Result<Uuid> {
        let request = SubmitExecutionRequest {
            workflow_id: workflow_id.to_string(),
            nodes,
        };
        let response: SubmitExecutionResponse = self.post("/executions", &request).await?;
        Ok(response.execution_id)
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionView> {
        self.get(&format!("/executions/{execution_id}")).await
    }

    pub async fn list_executions(&self) -> Result<Vec<ExecutionView>> {
        self.get("/executions").await
    }

    pub async fn cancel(&self, execution_id: Uuid) -> Result<ExecutionStatusResponse> {
        self.post(&format!("/executions/{execution_id}/cancel"), &Value::Null)
            .await
    }

    pub async fn pause(&self, execution_id: Uuid) -> Result<ExecutionStatusResponse> {
        self.post(&format!("/executions/{execution_id}/pause"), &Value::Null)
            .await
    }

    pub async fn resume(&self, execution_id: Uuid) -> Result<ExecutionStatusResponse> {
        self.post(&format!("/executions/{execution_id}/resume"), &Value::Null)
            .await
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.get("/queue/stats").await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.get("/queue/dead-letters").await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerRecord>> {
        self.get("/workers").await
    }

    /// Health is reported with 503 when degraded; both carry the report.
    pub async fn health(&self) -> Result<HealthReport> {
        let response = self.http.get(self.url("/health")).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::SERVICE_UNAVAILABLE => Ok(response.json().await?),
            _ => Err(error_from(response).await),
        }
    }
}

async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(error_from(response).await)
    }
}

async fn error_from(response: Response) -> OrchestratorError {
    let status = response.status().as_u16();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => format!("HTTP {status}"),
    };
    OrchestratorError::Api { status, message }
}

/// Restore the typed error for the cases a worker reacts to.
fn worker_error(err: OrchestratorError, worker_id: &str) -> OrchestratorError {
    match err {
        OrchestratorError::Api { status: 404, .. } => {
            OrchestratorError::WorkerNotFound(worker_id.to_string())
        }
        other => other,
    }
}

fn dispatch_error(err: OrchestratorError, token: Uuid) -> OrchestratorError {
    match err {
        OrchestratorError::Api { status: 401, .. } => OrchestratorError::InvalidDispatchToken(token),
        other => other,
    }
}

#[async_trait]
impl ControlPlane for ApiClient {
    async fn register(&self, registration: &WorkerRegistration) -> Result<()> {
        let _: WorkerRecord = self.post("/workers/register", registration).await?;
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, current_load: u32) -> Result<Vec<Uuid>> {
        let response: HeartbeatResponse = self
            .post(
                &format!("/workers/{worker_id}/heartbeat"),
                &HeartbeatRequest { current_load },
            )
            .await
            .map_err(|e| worker_error(e, worker_id))?;
        Ok(response.cancelled)
    }

    async fn deregister(&self, worker_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/workers/{worker_id}")))
            .send()
            .await?;
        check(response)
            .await
            .map(|_| ())
            .map_err(|e| worker_error(e, worker_id))
    }

    async fn poll(&self, worker_id: &str) -> Result<Option<Dispatch>> {
        let response = self
            .http
            .post(self.url(&format!("/workers/{worker_id}/poll")))
            .send()
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = check(response)
            .await
            .map_err(|e| worker_error(e, worker_id))?;
        Ok(Some(response.json().await?))
    }

    async fn started(&self, token: Uuid) -> Result<()> {
        self.post_empty(&format!("/dispatches/{token}/start"), &Value::Null)
            .await
            .map_err(|e| dispatch_error(e, token))
    }

    async fn progress(&self, token: Uuid, progress: Progress) -> Result<()> {
        self.post_empty(&format!("/dispatches/{token}/progress"), &progress)
            .await
            .map_err(|e| dispatch_error(e, token))
    }

    async fn completed(&self, token: Uuid, output: Value) -> Result<()> {
        self.post_empty(
            &format!("/dispatches/{token}/complete"),
            &CompleteRequest { output },
        )
        .await
        .map_err(|e| dispatch_error(e, token))
    }

    async fn failed(&self, token: Uuid, error: &JobExecutionError) -> Result<()> {
        let request = FailRequest {
            error: error.message.clone(),
            retryable: error.retryable,
        };
        self.post_empty(&format!("/dispatches/{token}/fail"), &request)
            .await
            .map_err(|e| dispatch_error(e, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client = ApiClient::new("http://127.0.0.1:8080/");
        assert_eq!(client.base_url(), "http://127.0.0.1:8080");
        assert_eq!(client.url("/health"), "http://127.0.0.1:8080/health");
    }

    #[test]
    fn not_found_maps_to_worker_not_found() {
        let err = worker_error(
            OrchestratorError::Api {
                status: 404,
                message: "gone".to_string(),
            },
            "w1",
        );
        assert!(matches!(err, OrchestratorError::WorkerNotFound(id) if id == "w1"));
    }
}
