//! List of workflow runs with one run watched live.

use super::{degraded_after, FacadeContext, FetchSlot};
use crate::backend::types::{Room, TriggerResponse};
use crate::model::{RunPatch, RunStatus, WorkflowRun};
use crate::sync::normalize::{self, CanonicalUpdate};
use crate::sync::{ConnectionStatus, FallbackPoller, PollReason, PushEvent, RunStore, SyncEvent};
use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunListState {
    pub runs: Vec<WorkflowRun>,
    pub loading: bool,
    pub error: Option<String>,
    /// Run currently receiving push updates.
    pub connected_execution_id: Option<String>,
    pub connection_status: ConnectionStatus,
    pub degraded: bool,
}

#[derive(Debug)]
enum Command {
    ConnectToExecution(String),
    Disconnect,
    Refresh,
    Triggered {
        content_id: String,
        response: TriggerResponse,
    },
    Shutdown,
}

pub struct RunListView {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<RunListState>,
    ctx: FacadeContext,
    task: JoinHandle<()>,
}

impl RunListView {
    /// With `auto_watch`, the most recently started active run is followed
    /// whenever nothing else is watched.
    pub fn spawn(ctx: FacadeContext, auto_watch: bool) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(RunListState::default());
        let actor = RunListActor {
            poller: FallbackPoller::new(ctx.settings.poll),
            ctx: ctx.clone(),
            runs: RunStore::new(),
            watched: None,
            auto_watch,
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
            ctx,
            task,
        }
    }

    pub fn state(&self) -> RunListState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RunListState> {
        self.state.clone()
    }

    /// Watch `execution_id` live, replacing any previous one.
    pub fn connect_to_execution(&self, execution_id: &str) {
        self.send(Command::ConnectToExecution(execution_id.to_string()));
    }

    /// Stop watching and close the push channel.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    pub fn refresh(&self) {
        self.send(Command::Refresh);
    }

    /// Start a workflow for `content_id` and watch the new run.
    pub async fn trigger(&self, content_id: &str, payload: &serde_json::Value) -> Result<TriggerResponse> {
        let response = self
            .ctx
            .api
            .trigger_workflow(content_id, payload)
            .await
            .with_context(|| format!("failed to trigger workflow for content {}", content_id))?;
        self.send(Command::Triggered {
            content_id: content_id.to_string(),
            response: response.clone(),
        });
        Ok(response)
    }

    pub async fn shutdown(self) {
        self.send(Command::Shutdown);
        let _ = self.task.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("run list view already stopped");
        }
    }
}

struct RunListActor {
    ctx: FacadeContext,
    runs: RunStore,
    poller: FallbackPoller,
    watched: Option<String>,
    auto_watch: bool,
    loading: bool,
    error: Option<String>,
    degraded: bool,
    state_tx: watch::Sender<RunListState>,
    fetch: FetchSlot<Result<Vec<WorkflowRun>>>,
}

impl RunListActor {
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
                            tracing::warn!(skipped = n, "run list fell behind push events, refreshing");
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
                    let reason = self.poller.begin(Instant::now(), connected, self.runs.any_active());
                    self.start_fetch(reason);
                }
            }
            self.publish();
        }

        self.fetch.abort();
        if let Some(id) = self.watched.take() {
            self.ctx.connection.release_room(&Room::Execution(id));
        }
        tracing::debug!("run list view stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::ConnectToExecution(id) => {
                self.auto_watch = true;
                self.watch_run(&id);
            }
            Command::Disconnect => {
                self.auto_watch = false;
                self.watched = None;
                self.degraded = false;
                self.runs.clear_live();
                self.ctx.connection.disconnect();
            }
            Command::Refresh => {
                let reason = self.poller.begin_forced();
                self.start_fetch(reason);
            }
            Command::Triggered {
                content_id,
                response,
            } => {
                self.runs.upsert(RunPatch {
                    id: Some(response.id),
                    run_id: Some(response.run_id.clone()),
                    status: Some(RunStatus::Queued),
                    content_id: Some(content_id),
                    ..Default::default()
                });
                self.auto_watch = true;
                self.watch_run(&response.run_id);
            }
            Command::Shutdown => {}
        }
    }

    fn on_event(&mut self, event: SyncEvent) {
        self.degraded = degraded_after(self.degraded, &event);
        match event {
            SyncEvent::Push(push) => self.on_push(&push),
            SyncEvent::ConnectionLost(reason) => {
                tracing::info!(reason = %reason, "run list degraded to polling");
            }
            SyncEvent::Connected | SyncEvent::ConnectionError(_) => {}
        }
    }

    fn on_push(&mut self, push: &PushEvent) {
        let update = match normalize::normalize(push) {
            Ok(Some(update)) => update,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(event = %push.name, error = %format!("{:#}", e), "dropping push event");
                return;
            }
        };
        let changed = match update {
            CanonicalUpdate::Run(patch) => self.runs.upsert(patch).changed(),
            CanonicalUpdate::Node(node) => {
                // A node moving means its run left the queue.
                let queued = self
                    .runs
                    .get_by_run_id(&node.execution_id)
                    .map_or(true, |run| run.status == RunStatus::Queued);
                if queued {
                    self.runs
                        .upsert(RunPatch {
                            run_id: Some(node.execution_id.clone()),
                            status: Some(RunStatus::Running),
                            content_id: node.content_id.clone(),
                            timestamp: Some(node.timestamp),
                            ..Default::default()
                        })
                        .changed()
                } else {
                    false
                }
            }
        };
        if changed {
            self.reconcile_watch();
        }
    }

    fn on_fetched(&mut self, result: Result<Vec<WorkflowRun>>) {
        self.loading = false;
        match result {
            Ok(runs) => {
                self.poller.finish(Instant::now(), true);
                self.error = None;
                let changed = self.runs.apply_snapshot(runs);
                tracing::debug!(changed, total = self.runs.len(), "runs refreshed");
                self.reconcile_watch();
            }
            Err(e) => {
                self.poller.finish(Instant::now(), false);
                let message = format!("{:#}", e);
                tracing::warn!(error = %message, "run list refresh failed");
                self.error = Some(message);
            }
        }
    }

    fn start_fetch(&mut self, reason: Option<PollReason>) {
        let Some(reason) = reason else {
            return;
        };
        tracing::debug!(reason = reason.as_str(), "polling workflow runs");
        self.loading = true;
        let api = self.ctx.api.clone();
        self.fetch.spawn(async move { api.fetch_all_workflow_runs().await });
    }

    fn watch_run(&mut self, run_id: &str) {
        if self.watched.as_deref() == Some(run_id) {
            return;
        }
        tracing::info!(run_id, "watching run");
        if let Some(previous) = self.watched.replace(run_id.to_string()) {
            self.ctx.connection.release_room(&Room::Execution(previous));
        }
        self.runs.mark_live(run_id);
        self.ctx.connection.connect();
        self.ctx.connection.join_execution_room(run_id);
    }

    /// Release a finished watched run, then pick the next one if following.
    fn reconcile_watch(&mut self) {
        if let Some(id) = self.watched.clone() {
            let finished = self
                .runs
                .get_by_run_id(&id)
                .is_some_and(|run| run.status.is_terminal());
            if finished {
                tracing::info!(run_id = %id, "watched run finished");
                self.watched = None;
                self.runs.clear_live();
                self.ctx.connection.release_room(&Room::Execution(id));
                // Other views may still be listening on the shared channel.
                if !self.runs.any_active() && !self.ctx.connection.is_held() {
                    self.ctx.connection.disconnect();
                }
            }
        }
        if self.watched.is_none() && self.auto_watch {
            if let Some(next) = self.runs.most_recent_active().map(|r| r.run_id.clone()) {
                self.watch_run(&next);
            }
        }
    }

    fn publish(&self) {
        let next = RunListState {
            runs: self.runs.runs().to_vec(),
            loading: self.loading,
            error: self.error.clone(),
            connected_execution_id: self.watched.clone(),
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
