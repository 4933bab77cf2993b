pub mod auth;
pub mod rest;
pub mod types;
pub mod ws;

use crate::model::{ContentWorkflowStatus, NodeRun, NodeStatus, WorkflowRun};
use anyhow::Result;
use async_trait::async_trait;
use types::{PushLink, TriggerResponse};

/// Request/response access to the workflow backend.
///
/// Errors carry a human-readable message; callers surface them as text and
/// retry on the next poll.
#[async_trait]
pub trait WorkflowApi: Send + Sync {
    async fn fetch_content_workflow_status(&self, content_id: &str)
        -> Result<ContentWorkflowStatus>;
    async fn fetch_workflow_runs_by_content_id(&self, content_id: &str)
        -> Result<Vec<WorkflowRun>>;
    async fn fetch_node_runs_by_content_id(
        &self,
        content_id: &str,
        status: Option<NodeStatus>,
    ) -> Result<Vec<NodeRun>>;
    async fn fetch_latest_node_run_by_content_id(&self, content_id: &str)
        -> Result<Option<NodeRun>>;
    async fn fetch_all_workflow_runs(&self) -> Result<Vec<WorkflowRun>>;
    /// Single run by its `runId`, the identifier push events and triggers
    /// carry. The numeric `id` is never used to address a run.
    async fn fetch_workflow_run(&self, run_id: &str) -> Result<WorkflowRun>;
    async fn trigger_workflow(
        &self,
        content_id: &str,
        payload: &serde_json::Value,
    ) -> Result<TriggerResponse>;
}

/// Opens the single real-time channel to the backend.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, user_id: &str) -> Result<PushLink>;
}
