use super::auth::Credentials;
use super::types::{TriggerRequest, TriggerResponse};
use super::WorkflowApi;
use crate::model::{ContentWorkflowStatus, NodeRun, NodeStatus, WorkflowRun};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::sync::Arc;
use std::time::Duration;

pub struct RestClient {
    client: Client,
    auth: Arc<Credentials>,
    base_url: String,
}

impl RestClient {
    pub fn new(auth: Arc<Credentials>, base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(4)
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_auth(&self, mut req: RequestBuilder) -> RequestBuilder {
        for (k, v) in self.auth.headers() {
            req = req.header(k, v);
        }
        req
    }

    /// Authenticated GET request.
    async fn get_authed<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let req = self.with_auth(self.client.get(self.url(path)).query(query));
        let resp = req
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET {} failed ({}): {}", path, status, body);
        }
        resp.json()
            .await
            .with_context(|| format!("failed to parse {} response", path))
    }
}

/// `GET /workflow-runs/{runId}` is keyed by the run's string id.
fn run_path(run_id: &str) -> String {
    format!("/workflow-runs/{}", run_id)
}

#[async_trait]
impl WorkflowApi for RestClient {
    async fn fetch_content_workflow_status(
        &self,
        content_id: &str,
    ) -> Result<ContentWorkflowStatus> {
        let path = format!("/content/{}/workflow-status", content_id);
        self.get_authed(&path, &[]).await
    }

    async fn fetch_workflow_runs_by_content_id(&self, content_id: &str) -> Result<Vec<WorkflowRun>> {
        self.get_authed("/workflow-runs", &[("contentId", content_id.to_string())])
            .await
    }

    async fn fetch_node_runs_by_content_id(
        &self,
        content_id: &str,
        status: Option<NodeStatus>,
    ) -> Result<Vec<NodeRun>> {
        let mut query = vec![("contentId", content_id.to_string())];
        if let Some(status) = status {
            query.push(("status", status.as_str().to_string()));
        }
        self.get_authed("/node-runs", &query).await
    }

    async fn fetch_latest_node_run_by_content_id(&self, content_id: &str) -> Result<Option<NodeRun>> {
        let path = "/node-runs/latest";
        let req = self.with_auth(
            self.client
                .get(self.url(path))
                .query(&[("contentId", content_id)]),
        );
        let resp = req.send().await.context("GET latest node run failed")?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET {} failed ({}): {}", path, status, body);
        }
        resp.json()
            .await
            .context("failed to parse latest node run response")
    }

    async fn fetch_all_workflow_runs(&self) -> Result<Vec<WorkflowRun>> {
        self.get_authed("/workflow-runs", &[]).await
    }

    async fn fetch_workflow_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.get_authed(&run_path(run_id), &[]).await
    }

    async fn trigger_workflow(
        &self,
        content_id: &str,
        payload: &serde_json::Value,
    ) -> Result<TriggerResponse> {
        let path = format!("/content/{}/trigger", content_id);
        let req = self.with_auth(
            self.client
                .post(self.url(&path))
                .json(&TriggerRequest { payload }),
        );

        let resp = req.send().await.context("trigger request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("trigger failed ({}): {}", status, body);
        }
        let response: TriggerResponse = resp
            .json()
            .await
            .context("failed to parse trigger response")?;

        tracing::info!(
            content_id,
            run_id = %response.run_id,
            id = response.id,
            "workflow triggered"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let auth = Arc::new(Credentials::new("u".to_string(), None));
        let rest = RestClient::new(auth, "http://localhost:8080/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(rest.url("/workflow-runs"), "http://localhost:8080/api/workflow-runs");
    }

    #[test]
    fn test_single_run_route_uses_run_id() {
        let run: WorkflowRun =
            serde_json::from_value(serde_json::json!({ "id": 42, "runId": "run-abc", "status": "RUNNING" }))
                .unwrap();
        assert_eq!(run_path(&run.run_id), "/workflow-runs/run-abc");
        assert!(!run_path(&run.run_id).contains("42"));
    }

    /// Integration test: hits a running backend.
    /// Run with: EXEC_SYNC_API_BASE=... cargo test backend_live --ignored -- --nocapture
    #[tokio::test]
    #[ignore]
    async fn backend_live_fetch_runs() {
        let base = std::env::var("EXEC_SYNC_API_BASE").unwrap_or_default();
        let auth = Arc::new(Credentials::new("live-test".to_string(), None));
        let rest = RestClient::new(auth, &base, Duration::from_secs(10)).unwrap();
        match rest.fetch_all_workflow_runs().await {
            Ok(runs) => {
                println!("Got {} runs", runs.len());
                for r in &runs {
                    println!("  {} {} {}", r.run_id, r.workflow_key, r.status);
                }
            }
            Err(e) => println!("fetch error: {:#}", e),
        }
    }
}
