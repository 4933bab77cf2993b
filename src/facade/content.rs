//! Workflow status of a single content item.

use super::{degraded_after, FacadeContext, FetchSlot};
use crate::backend::types::{Room, TriggerResponse};
use crate::backend::WorkflowApi;
use crate::model::{ContentWorkflowStatus, NodeRun, NodeUpdate, RunPatch, RunStatus, WorkflowRun};
use crate::sync::normalize::{self, CanonicalUpdate};
use crate::sync::{
    ConnectionStatus, ExecutionStore, FallbackPoller, PollReason, PushEvent, RunStore, SyncEvent,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentWorkflowState {
    pub status: Option<ContentWorkflowStatus>,
    pub runs: Vec<WorkflowRun>,
    /// Timeline of the latest execution for this content.
    pub nodes: Vec<NodeUpdate>,
    pub loading: bool,
    pub error: Option<String>,
    pub connection_status: ConnectionStatus,
    pub degraded: bool,
}

#[derive(Debug)]
enum Command {
    Refresh,
    Triggered(TriggerResponse),
    Shutdown,
}

#[derive(Debug)]
enum Fetched {
    /// Aggregate status only, after a push event.
    Status(Result<ContentWorkflowStatus>),
    Full(Result<FullSnapshot>),
}

#[derive(Debug)]
struct FullSnapshot {
    status: ContentWorkflowStatus,
    runs: Vec<WorkflowRun>,
    nodes: Vec<NodeRun>,
}

pub struct ContentWorkflowView {
    content_id: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ContentWorkflowState>,
    api: Arc<dyn WorkflowApi>,
    task: JoinHandle<()>,
}

impl ContentWorkflowView {
    pub fn spawn(ctx: FacadeContext, content_id: &str) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ContentWorkflowState::default());
        let api = ctx.api.clone();
        let actor = ContentActor {
            content_id: content_id.to_string(),
            status: None,
            runs: RunStore::new(),
            executions: ExecutionStore::new(ctx.settings.history_limit),
            poller: FallbackPoller::new(ctx.settings.poll),
            ctx,
            live: false,
            status_dirty: false,
            loading: false,
            error: None,
            degraded: false,
            state_tx,
            fetch: FetchSlot::new(),
        };
        let task = tokio::spawn(actor.run(command_rx));
        Self {
            content_id: content_id.to_string(),
            commands,
            state,
            api,
            task,
        }
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn state(&self) -> ContentWorkflowState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ContentWorkflowState> {
        self.state.clone()
    }

    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    pub async fn trigger(&self, payload: &serde_json::Value) -> Result<TriggerResponse> {
        let response = self
            .api
            .trigger_workflow(&self.content_id, payload)
            .await
            .with_context(|| format!("failed to trigger workflow for content {}", self.content_id))?;
        self.send(Command::Triggered(response.clone()));
        Ok(response)
    }

    pub async fn shutdown(self) {
        self.send(Command::Shutdown);
        let _ = self.task.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("content view already stopped");
        }
    }
}

struct ContentActor {
    ctx: FacadeContext,
    content_id: String,
    status: Option<ContentWorkflowStatus>,
    runs: RunStore,
    executions: ExecutionStore,
    poller: FallbackPoller,
    /// Joined the content room.
    live: bool,
    /// A push event arrived while a fetch was running.
    status_dirty: bool,
    loading: bool,
    error: Option<String>,
    degraded: bool,
    state_tx: watch::Sender<ContentWorkflowState>,
    fetch: FetchSlot<Fetched>,
}

impl ContentActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut events = self.ctx.connection.subscribe();
        let mut conn_state = self.ctx.connection.watch_state();
        let mut timer = self.ctx.sample_timer();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.on_command(command),
                    }
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => self.on_event(event),
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "content view fell behind push events, refreshing");
                            self.status_dirty = true;
                            self.fetch_status();
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                Some(fetched) = self.fetch.recv() => self.on_fetched(fetched),
                changed = conn_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = timer.tick() => {
                    if !self.fetch.busy() {
                        let connected = self.ctx.connection.status() == ConnectionStatus::Connected;
                        let reason = self.poller.begin(Instant::now(), connected, self.is_active());
                        self.start_full_fetch(reason);
                    }
                }
            }
            self.publish();
        }

        self.fetch.abort();
        if self.live {
            self.ctx.connection.release_room(&self.room());
        }
        tracing::debug!(content_id = %self.content_id, "content view stopped");
    }

    fn room(&self) -> Room {
        Room::Content(self.content_id.clone())
    }

    fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| !s.status.is_terminal())
            || self.runs.any_active()
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Refresh => {
                if self.fetch.busy() {
                    self.status_dirty = true;
                } else {
                    let reason = self.poller.begin_forced();
                    self.start_full_fetch(reason);
                }
            }
            Command::Triggered(response) => {
                self.runs.upsert(RunPatch {
                    id: Some(response.id),
                    run_id: Some(response.run_id),
                    status: Some(RunStatus::Queued),
                    content_id: Some(self.content_id.clone()),
                    ..Default::default()
                });
                self.go_live();
                self.status_dirty = true;
                self.fetch_status();
            }
            Command::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: SyncEvent) {
        self.degraded = degraded_after(self.degraded, &event);
        if let SyncEvent::Push(push) = event {
            if self.on_push(&push) {
                self.status_dirty = true;
                self.fetch_status();
            }
        }
    }

    /// Apply a push event; true if it concerns this content item.
    fn on_push(&mut self, push: &PushEvent) -> bool {
        let update = match normalize::normalize(push) {
            Ok(Some(update)) => update,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(event = %push.name, error = %format!("{:#}", e), "dropping push event");
                return false;
            }
        };
        match update {
            CanonicalUpdate::Node(mut node) => {
                let ours = node.content_id.as_deref() == Some(self.content_id.as_str())
                    || self.runs.contains_run_id(&node.execution_id)
                    || self.executions.contains(&node.execution_id);
                if ours {
                    node.content_id.get_or_insert_with(|| self.content_id.clone());
                    self.executions.apply(node);
                }
                ours
            }
            CanonicalUpdate::Run(mut patch) => {
                let ours = patch.content_id.as_deref() == Some(self.content_id.as_str())
                    || patch
                        .run_id
                        .as_deref()
                        .is_some_and(|id| self.runs.contains_run_id(id));
                if ours {
                    patch.content_id.get_or_insert_with(|| self.content_id.clone());
                    self.executions.apply_run(&patch);
                    self.runs.upsert(patch);
                }
                ours
            }
        }
    }

    /// Status-only refetch, coalesced while another fetch runs.
    fn fetch_status(&mut self) {
        if self.fetch.busy() || !self.status_dirty {
            return;
        }
        self.status_dirty = false;
        let api = self.ctx.api.clone();
        let content_id = self.content_id.clone();
        self.fetch.spawn(async move {
            Fetched::Status(api.fetch_content_workflow_status(&content_id).await)
        });
    }

    fn start_full_fetch(&mut self, reason: Option<PollReason>) {
        let Some(reason) = reason else {
            return;
        };
        tracing::debug!(reason = reason.as_str(), content_id = %self.content_id, "polling content workflow");
        self.loading = true;
        let api = self.ctx.api.clone();
        let content_id = self.content_id.clone();
        self.fetch.spawn(async move {
            Fetched::Full(fetch_full(api, &content_id).await)
        });
    }

    fn on_fetched(&mut self, fetched: Fetched) {
        match fetched {
            Fetched::Status(Ok(status)) => {
                self.error = None;
                self.set_status(status);
            }
            Fetched::Full(Ok(snapshot)) => {
                self.loading = false;
                self.poller.finish(Instant::now(), true);
                self.error = None;
                self.runs.apply_snapshot(snapshot.runs);
                let now = Utc::now();
                for row in &snapshot.nodes {
                    match normalize::node_from_node_run(row, now) {
                        Ok(mut update) => {
                            update.content_id.get_or_insert_with(|| self.content_id.clone());
                            self.executions.apply(update);
                        }
                        Err(e) => tracing::warn!(run_id = %row.run_id, error = %format!("{:#}", e), "skipping node row"),
                    }
                }
                for run in self.runs.runs().to_vec() {
                    self.executions.apply_run(&RunPatch::from(run));
                }
                self.set_status(snapshot.status);
            }
            Fetched::Status(Err(e)) => self.on_error(e),
            Fetched::Full(Err(e)) => {
                self.loading = false;
                self.poller.finish(Instant::now(), false);
                self.on_error(e);
            }
        }
        self.fetch_status();
    }

    fn on_error(&mut self, e: anyhow::Error) {
        let message = format!("{:#}", e);
        tracing::warn!(content_id = %self.content_id, error = %message, "content refresh failed");
        self.error = Some(message);
    }

    fn set_status(&mut self, status: ContentWorkflowStatus) {
        let running = !status.status.is_terminal();
        self.status = Some(status);
        if running {
            self.go_live();
        } else if self.live {
            tracing::info!(content_id = %self.content_id, "content workflow settled");
            self.live = false;
            self.ctx.connection.release_room(&self.room());
        }
    }

    fn go_live(&mut self) {
        if self.live {
            return;
        }
        tracing::info!(content_id = %self.content_id, "content workflow running, joining room");
        self.live = true;
        self.ctx.connection.connect();
        self.ctx.connection.join_room(self.room());
    }

    fn publish(&self) {
        let nodes = self
            .executions
            .latest_for_content(&self.content_id)
            .map(|e| e.nodes.clone())
            .unwrap_or_default();
        let next = ContentWorkflowState {
            status: self.status.clone(),
            runs: self.runs.runs().to_vec(),
            nodes,
            loading: self.loading,
            error: self.error.clone(),
            connection_status: self.ctx.connection.status(),
            degraded: self.degraded,
        };
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }
}

async fn fetch_full(api: Arc<dyn WorkflowApi>, content_id: &str) -> Result<FullSnapshot> {
    let (status, runs, nodes) = tokio::join!(
        api.fetch_content_workflow_status(content_id),
        api.fetch_workflow_runs_by_content_id(content_id),
        api.fetch_node_runs_by_content_id(content_id, None),
    );
    Ok(FullSnapshot {
        status: status?,
        runs: runs?,
        nodes: nodes?,
    })
}
