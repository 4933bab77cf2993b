use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reported state of a single workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Waiting,
    Running,
    Success,
    Failed,
}

impl NodeStatus {
    /// Parse a backend status string. Accepts the aliases the orchestrator
    /// has emitted over time, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "waiting" | "pending" | "queued" => Some(Self::Waiting),
            "running" | "in_progress" | "started" => Some(Self::Running),
            "success" | "succeeded" | "completed" | "done" => Some(Self::Success),
            "failed" | "failure" | "error" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Test,
    #[default]
    Production,
}

impl Mode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "test" | "manual" => Some(Self::Test),
            "production" | "prod" | "live" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Aggregate status of an execution, derived from its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Backend run status. Unknown values are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Other(String),
}

impl RunStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "QUEUED" | "PENDING" | "WAITING" | "SCHEDULED" => Self::Queued,
            "RUNNING" | "IN_PROGRESS" | "STARTED" => Self::Running,
            "COMPLETED" | "SUCCESS" | "SUCCEEDED" | "DONE" => Self::Completed,
            "FAILED" | "FAILURE" | "ERROR" => Self::Failed,
            "CANCELLED" | "CANCELED" | "ABORTED" => Self::Cancelled,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for RunStatus {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical state of one node of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeUpdate {
    pub execution_id: String,
    pub workflow_id: Option<String>,
    pub workflow_name: String,
    pub node_name: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub mode: Mode,
    pub timestamp: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub content_id: Option<String>,
    pub result: Option<serde_json::Value>,
}

/// One run of a workflow, with its node timeline sorted by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub execution_id: String,
    pub workflow_id: Option<String>,
    pub workflow_name: String,
    pub content_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub nodes: Vec<NodeUpdate>,
    /// Status the backend reported for the run itself, if any.
    pub run_status: Option<RunStatus>,
}

impl Execution {
    pub fn node(&self, node_name: &str) -> Option<&NodeUpdate> {
        self.nodes.iter().find(|n| n.node_name == node_name)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node_name.as_str()).collect()
    }
}

/// Compact view of an execution for list displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_name: String,
    pub content_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub node_count: usize,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id.clone(),
            workflow_name: execution.workflow_name.clone(),
            content_id: execution.content_id.clone(),
            status: execution.status,
            started_at: execution.started_at,
            last_updated: execution.last_updated,
            node_count: execution.nodes.len(),
        }
    }
}

/// Backend row describing one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(alias = "run_id")]
    pub run_id: String,
    #[serde(default, alias = "workflow_key")]
    pub workflow_key: String,
    pub status: RunStatus,
    #[serde(default, alias = "started_at")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "finished_at")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default, alias = "content_id")]
    pub content_id: Option<String>,
    /// True while this run is the one receiving push updates.
    #[serde(skip)]
    pub is_live: bool,
    #[serde(skip)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Partial run update. Only `Some` fields overwrite a stored run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunPatch {
    pub id: Option<i64>,
    pub run_id: Option<String>,
    pub workflow_key: Option<String>,
    pub status: Option<RunStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub content_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<WorkflowRun> for RunPatch {
    fn from(run: WorkflowRun) -> Self {
        Self {
            id: run.id,
            run_id: Some(run.run_id),
            workflow_key: Some(run.workflow_key).filter(|k| !k.is_empty()),
            status: Some(run.status),
            started_at: run.started_at,
            finished_at: run.finished_at,
            output: run.output,
            content_id: run.content_id,
            timestamp: None,
        }
    }
}

/// Aggregate workflow status for one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentWorkflowStatus {
    #[serde(alias = "content_id")]
    pub content_id: String,
    pub status: RunStatus,
    #[serde(default, alias = "current_node")]
    pub current_node: Option<String>,
    #[serde(default, alias = "latest_run_id")]
    pub latest_run_id: Option<String>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "completed_nodes")]
    pub completed_nodes: u32,
    #[serde(default, alias = "total_nodes")]
    pub total_nodes: u32,
}

/// Backend row for one node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRun {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(alias = "run_id")]
    pub run_id: String,
    #[serde(alias = "node_name")]
    pub node_name: String,
    #[serde(default, alias = "node_type")]
    pub node_type: Option<String>,
    pub status: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, alias = "started_at")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "finished_at")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default, alias = "content_id")]
    pub content_id: Option<String>,
    #[serde(default, alias = "workflow_id")]
    pub workflow_id: Option<String>,
    #[serde(default, alias = "workflow_name")]
    pub workflow_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_aliases() {
        assert_eq!(RunStatus::parse("succeeded"), RunStatus::Completed);
        assert_eq!(RunStatus::parse("Pending"), RunStatus::Queued);
        assert_eq!(RunStatus::parse("canceled"), RunStatus::Cancelled);
        assert_eq!(RunStatus::parse("PAUSED"), RunStatus::Other("PAUSED".to_string()));
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Other("PAUSED".to_string()).is_terminal());
    }

    #[test]
    fn test_node_status_parse() {
        assert_eq!(NodeStatus::parse("RUNNING"), Some(NodeStatus::Running));
        assert_eq!(NodeStatus::parse("completed"), Some(NodeStatus::Success));
        assert_eq!(NodeStatus::parse("exploded"), None);
    }

    #[test]
    fn test_workflow_run_deserializes_both_casings() {
        let camel: WorkflowRun = serde_json::from_str(
            r#"{"id": 7, "runId": "r-7", "workflowKey": "publish", "status": "running",
                "startedAt": "2026-03-01T10:00:00Z"}"#,
        )
        .unwrap();
        let snake: WorkflowRun = serde_json::from_str(
            r#"{"id": 7, "run_id": "r-7", "workflow_key": "publish", "status": "RUNNING",
                "started_at": "2026-03-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.status, RunStatus::Running);
        assert!(!camel.is_live);
    }
}
