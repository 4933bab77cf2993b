//! Node timeline of one execution, or of the latest execution for a
//! content item.

use super::{degraded_after, FacadeContext, FetchSlot};
use crate::backend::types::Room;
use crate::backend::WorkflowApi;
use crate::model::{Execution, ExecutionSummary, NodeRun, RunPatch, WorkflowRun};
use crate::sync::normalize::{self, CanonicalUpdate};
use crate::sync::{ConnectionStatus, ExecutionStore, FallbackPoller, PollReason, SyncEvent};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineTarget {
    Execution(String),
    /// Follows the most recent execution touching this content item.
    Content(String),
}

impl TimelineTarget {
    fn room(&self) -> Room {
        match self {
            Self::Execution(id) => Room::Execution(id.clone()),
            Self::Content(id) => Room::Content(id.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimelineState {
    /// Most recently updated first.
    pub executions: Vec<ExecutionSummary>,
    pub selected: Option<Execution>,
    pub loading: bool,
    pub error: Option<String>,
    pub connection_status: ConnectionStatus,
    pub degraded: bool,
}

#[derive(Debug)]
enum Command {
    Select(String),
    ClearHistory,
    Refresh,
    Shutdown,
}

/// Authoritative rows fetched over REST.
#[derive(Debug, Default)]
struct Snapshot {
    nodes: Vec<NodeRun>,
    runs: Vec<WorkflowRun>,
}

pub struct ExecutionTimelineView {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TimelineState>,
    target: TimelineTarget,
    task: JoinHandle<()>,
}

impl ExecutionTimelineView {
    pub fn spawn(ctx: FacadeContext, target: TimelineTarget) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(TimelineState::default());
        let actor = TimelineActor {
            store: ExecutionStore::new(ctx.settings.history_limit),
            poller: FallbackPoller::new(ctx.settings.poll),
            ctx,
            target: target.clone(),
            manual_selection: false,
            loading: false,
            error: None,
            degraded: false,
            state_tx,
            fetch: FetchSlot::new(),
        };
        let task = tokio::spawn(actor.run(command_rx));
        Self {
            commands,
            state,
            target,
            task,
        }
    }

    pub fn target(&self) -> &TimelineTarget {
        &self.target
    }

    pub fn state(&self) -> TimelineState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TimelineState> {
        self.state.clone()
    }

    /// Pin the spotlight to a known execution.
    pub fn select(&self, execution_id: &str) {
        self.send(Command::Select(execution_id.to_string()));
    }

    pub fn clear_history(&self) {
        self.send(Command::ClearHistory);
    }

    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    pub async fn shutdown(self) {
        self.send(Command::Shutdown);
        let _ = self.task.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("timeline view already stopped");
        }
    }
}

struct TimelineActor {
    ctx: FacadeContext,
    target: TimelineTarget,
    store: ExecutionStore,
    poller: FallbackPoller,
    manual_selection: bool,
    loading: bool,
    error: Option<String>,
    degraded: bool,
    state_tx: watch::Sender<TimelineState>,
    fetch: FetchSlot<Result<Snapshot>>,
}

impl TimelineActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut events = self.ctx.connection.subscribe();
        let mut conn_state = self.ctx.connection.watch_state();
        let mut timer = self.ctx.sample_timer();

        self.ctx.connection.connect();
        self.ctx.connection.join_room(self.target.room());
        tracing::debug!(room = %self.target.room(), "timeline view started");

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
                            tracing::warn!(skipped = n, "timeline fell behind push events, refreshing");
                            let reason = self.poller.begin_forced();
                            self.start_fetch(reason);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                Some(result) = self.fetch.recv() => self.on_fetched(result),
                changed = conn_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = timer.tick() => {
                    let connected = self.ctx.connection.status() == ConnectionStatus::Connected;
                    let reason = self.poller.begin(Instant::now(), connected, self.any_active());
                    self.start_fetch(reason);
                }
            }
            self.publish();
        }

        self.fetch.abort();
        self.ctx.connection.release_room(&self.target.room());
        tracing::debug!("timeline view stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Select(id) => {
                if self.store.select(&id) {
                    self.manual_selection = true;
                } else {
                    tracing::debug!(execution_id = %id, "cannot select unknown execution");
                }
            }
            Command::ClearHistory => {
                self.store.clear_history();
                self.manual_selection = false;
            }
            Command::Refresh => {
                let reason = self.poller.begin_forced();
                self.start_fetch(reason);
            }
            Command::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: SyncEvent) {
        self.degraded = degraded_after(self.degraded, &event);
        let SyncEvent::Push(push) = event else {
            return;
        };
        match normalize::normalize(&push) {
            Ok(Some(CanonicalUpdate::Node(update))) => {
                if self.accepts(&update.execution_id, update.content_id.as_deref()) {
                    self.store.apply(update);
                    self.follow();
                }
            }
            Ok(Some(CanonicalUpdate::Run(patch))) => {
                let accepted = patch
                    .run_id
                    .as_deref()
                    .is_some_and(|id| self.accepts(id, patch.content_id.as_deref()));
                if accepted && self.store.apply_run(&patch).changed() {
                    self.follow();
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(event = %push.name, error = %format!("{:#}", e), "dropping push event");
            }
        }
    }

    fn accepts(&self, execution_id: &str, content_id: Option<&str>) -> bool {
        match &self.target {
            TimelineTarget::Execution(id) => id == execution_id,
            TimelineTarget::Content(id) => {
                content_id == Some(id.as_str()) || self.store.contains(execution_id)
            }
        }
    }

    fn any_active(&self) -> bool {
        match &self.target {
            // Nothing seen yet still means something to wait for.
            TimelineTarget::Execution(id) => self
                .store
                .get(id)
                .map_or(true, |e| !e.status.is_terminal()),
            TimelineTarget::Content(_) => self
                .store
                .executions()
                .iter()
                .any(|e| !e.status.is_terminal()),
        }
    }

    /// Keep the spotlight on the target unless the user picked one.
    fn follow(&mut self) {
        if self.manual_selection && self.store.selected().is_some() {
            return;
        }
        self.manual_selection = false;
        let latest = match &self.target {
            TimelineTarget::Execution(id) => Some(id.clone()),
            TimelineTarget::Content(id) => self
                .store
                .latest_for_content(id)
                .map(|e| e.execution_id.clone()),
        };
        if let Some(id) = latest {
            self.store.select(&id);
        }
    }

    fn start_fetch(&mut self, reason: Option<PollReason>) {
        let Some(reason) = reason else {
            return;
        };
        tracing::debug!(reason = reason.as_str(), target = ?self.target, "polling timeline");
        self.loading = true;
        let api = self.ctx.api.clone();
        let target = self.target.clone();
        self.fetch.spawn(fetch_snapshot(api, target));
    }

    fn on_fetched(&mut self, result: Result<Snapshot>) {
        self.loading = false;
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.poller.finish(Instant::now(), false);
                let message = format!("{:#}", e);
                tracing::warn!(error = %message, "timeline refresh failed");
                self.error = Some(message);
                return;
            }
        };
        self.poller.finish(Instant::now(), true);
        self.error = None;

        let now = Utc::now();
        for row in &snapshot.nodes {
            match normalize::node_from_node_run(row, now) {
                Ok(update) => {
                    if self.accepts(&update.execution_id, update.content_id.as_deref()) {
                        self.store.apply(update);
                    }
                }
                Err(e) => tracing::warn!(run_id = %row.run_id, error = %format!("{:#}", e), "skipping node row"),
            }
        }
        for run in snapshot.runs {
            self.store.apply_run(&RunPatch::from(run));
        }
        self.follow();
    }

    fn publish(&self) {
        let next = TimelineState {
            executions: self
                .store
                .executions()
                .into_iter()
                .map(ExecutionSummary::from)
                .collect(),
            selected: self.store.selected().cloned(),
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

async fn fetch_snapshot(api: Arc<dyn WorkflowApi>, target: TimelineTarget) -> Result<Snapshot> {
    match target {
        TimelineTarget::Execution(id) => {
            let run = api.fetch_workflow_run(&id).await?;
            let nodes = match run.content_id.as_deref() {
                Some(content_id) => api
                    .fetch_node_runs_by_content_id(content_id, None)
                    .await?
                    .into_iter()
                    .filter(|row| row.run_id == id)
                    .collect(),
                None => Vec::new(),
            };
            Ok(Snapshot {
                nodes,
                runs: vec![run],
            })
        }
        TimelineTarget::Content(id) => {
            let (nodes, runs) = tokio::try_join!(
                api.fetch_node_runs_by_content_id(&id, None),
                api.fetch_workflow_runs_by_content_id(&id),
            )?;
            Ok(Snapshot { nodes, runs })
        }
    }
}
