#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use exec_sync::backend::types::{InboundFrame, OutboundFrame, PushLink, TriggerResponse};
use exec_sync::backend::{PushTransport, WorkflowApi};
use exec_sync::facade::{FacadeContext, SyncSettings};
use exec_sync::model::{ContentWorkflowStatus, NodeRun, NodeStatus, RunStatus, WorkflowRun};
use exec_sync::sync::ConnectionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const WAIT: Duration = Duration::from_secs(300);

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn ts_str(secs: i64) -> String {
    ts(secs).to_rfc3339()
}

pub fn run(run_id: &str, status: RunStatus, content_id: &str, started: i64) -> WorkflowRun {
    WorkflowRun {
        id: None,
        run_id: run_id.to_string(),
        workflow_key: "publish-post".to_string(),
        status,
        started_at: Some(ts(started)),
        finished_at: None,
        output: None,
        content_id: Some(content_id.to_string()),
        is_live: false,
        last_updated: None,
    }
}

pub fn node_row(run_id: &str, node: &str, status: &str, content_id: &str, at: i64) -> NodeRun {
    NodeRun {
        id: None,
        run_id: run_id.to_string(),
        node_name: node.to_string(),
        node_type: Some("task".to_string()),
        status: status.to_string(),
        mode: Some("production".to_string()),
        started_at: Some(ts(at)),
        finished_at: None,
        updated_at: Some(ts(at)),
        result: None,
        content_id: Some(content_id.to_string()),
        workflow_id: Some("wf-1".to_string()),
        workflow_name: Some("Publish post".to_string()),
    }
}

pub fn content_status(content_id: &str, status: RunStatus) -> ContentWorkflowStatus {
    ContentWorkflowStatus {
        content_id: content_id.to_string(),
        status,
        current_node: None,
        latest_run_id: None,
        updated_at: None,
        completed_nodes: 0,
        total_nodes: 0,
    }
}

/// Scriptable backend. Every call is counted; `fail` makes every call error.
#[derive(Default)]
pub struct FakeApi {
    pub status: Mutex<Option<ContentWorkflowStatus>>,
    pub runs: Mutex<Vec<WorkflowRun>>,
    pub nodes: Mutex<Vec<NodeRun>>,
    pub trigger: Mutex<Option<TriggerResponse>>,
    pub fail: AtomicBool,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FakeApi {
    pub fn set_runs(&self, runs: Vec<WorkflowRun>) {
        *self.runs.lock().unwrap() = runs;
    }

    pub fn set_nodes(&self, nodes: Vec<NodeRun>) {
        *self.nodes.lock().unwrap() = nodes;
    }

    pub fn set_status(&self, status: ContentWorkflowStatus) {
        *self.status.lock().unwrap() = Some(status);
    }

    pub fn set_trigger(&self, response: TriggerResponse) {
        *self.trigger.lock().unwrap() = Some(response);
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn record(&self, name: &'static str) -> Result<()> {
        *self.calls.lock().unwrap().entry(name).or_default() += 1;
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("backend unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowApi for FakeApi {
    async fn fetch_content_workflow_status(&self, content_id: &str) -> Result<ContentWorkflowStatus> {
        self.record("status")?;
        match self.status.lock().unwrap().clone() {
            Some(status) if status.content_id == content_id => Ok(status),
            _ => anyhow::bail!("no workflow status for content {}", content_id),
        }
    }

    async fn fetch_workflow_runs_by_content_id(&self, content_id: &str) -> Result<Vec<WorkflowRun>> {
        self.record("runs_by_content")?;
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.content_id.as_deref() == Some(content_id))
            .cloned()
            .collect())
    }

    async fn fetch_node_runs_by_content_id(
        &self,
        content_id: &str,
        status: Option<NodeStatus>,
    ) -> Result<Vec<NodeRun>> {
        self.record("nodes_by_content")?;
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.content_id.as_deref() == Some(content_id))
            .filter(|n| status.is_none() || NodeStatus::parse(&n.status) == status)
            .cloned()
            .collect())
    }

    async fn fetch_latest_node_run_by_content_id(&self, content_id: &str) -> Result<Option<NodeRun>> {
        let rows = self.fetch_node_runs_by_content_id(content_id, None).await?;
        Ok(rows.into_iter().max_by_key(|n| n.updated_at))
    }

    async fn fetch_all_workflow_runs(&self) -> Result<Vec<WorkflowRun>> {
        self.record("all_runs")?;
        Ok(self.runs.lock().unwrap().clone())
    }

    async fn fetch_workflow_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.record("run")?;
        match self.runs.lock().unwrap().iter().find(|r| r.run_id == run_id) {
            Some(run) => Ok(run.clone()),
            None => anyhow::bail!("run {} not found", run_id),
        }
    }

    async fn trigger_workflow(
        &self,
        content_id: &str,
        _payload: &serde_json::Value,
    ) -> Result<TriggerResponse> {
        self.record("trigger")?;
        match self.trigger.lock().unwrap().clone() {
            Some(response) => Ok(response),
            None => anyhow::bail!("trigger rejected for content {}", content_id),
        }
    }
}

/// Server side of one opened push link.
pub struct Remote {
    pub frames: mpsc::UnboundedReceiver<OutboundFrame>,
    pub inbound: mpsc::Sender<InboundFrame>,
}

impl Remote {
    pub async fn push(&self, name: &str, data: serde_json::Value) {
        self.inbound
            .send(InboundFrame::Event {
                name: name.to_string(),
                data,
            })
            .await
            .expect("link closed");
    }

    pub async fn drop_link(&self, reason: &str) {
        self.inbound
            .send(InboundFrame::Closed(Some(reason.to_string())))
            .await
            .expect("link closed");
    }

    pub async fn next_frame(&mut self) -> OutboundFrame {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("no frame sent")
            .expect("frame channel closed")
    }
}

pub struct FakeTransport {
    pub fail: AtomicBool,
    pub opens: AtomicUsize,
    remotes: mpsc::UnboundedSender<Remote>,
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn open(&self, _user_id: &str) -> Result<PushLink> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(64);
        let _ = self.remotes.send(Remote {
            frames: out_rx,
            inbound: in_tx,
        });
        Ok(PushLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

pub struct Harness {
    pub api: Arc<FakeApi>,
    pub transport: Arc<FakeTransport>,
    pub ctx: FacadeContext,
    remotes: mpsc::UnboundedReceiver<Remote>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SyncSettings::default())
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        let (tx, remotes) = mpsc::unbounded_channel();
        let api = Arc::new(FakeApi::default());
        let transport = Arc::new(FakeTransport {
            fail: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            remotes: tx,
        });
        let connection = ConnectionManager::new(transport.clone(), "user-1");
        let ctx = FacadeContext::new(connection, api.clone(), settings);
        Self {
            api,
            transport,
            ctx,
            remotes,
        }
    }

    pub async fn next_remote(&mut self) -> Remote {
        tokio::time::timeout(WAIT, self.remotes.recv())
            .await
            .expect("push link never opened")
            .expect("transport dropped")
    }
}

/// Wait until `predicate` holds for the published state and return it.
pub async fn wait_until<T: Clone>(rx: &mut watch::Receiver<T>, predicate: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("state never reached")
        .expect("view stopped")
        .clone()
}
