use anyhow::Result;
use exec_sync::backend::{auth::Credentials, rest::RestClient, ws::WsTransport, WorkflowApi};
use exec_sync::config::Config;
use exec_sync::facade::{
    ContentWorkflowView, ExecutionTimelineView, FacadeContext, RunListView, TimelineTarget,
};
use exec_sync::sync::reconnect::spawn_reconnector;
use exec_sync::sync::{ConnectionManager, SyncEvent};
use exec_sync::tui::{self, state::AppState, TuiCommand};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Views driven by the terminal monitor.
struct Views {
    ctx: FacadeContext,
    run_list: RunListView,
    content: Option<ContentWorkflowView>,
    timeline: Option<ExecutionTimelineView>,
    /// Timeline follows the watched run instead of a content item.
    follow_watched: bool,
}

impl Views {
    fn refresh(&self) {
        self.run_list.refresh();
        if let Some(content) = &self.content {
            content.refresh();
        }
        if let Some(timeline) = &self.timeline {
            timeline.refresh();
        }
    }

    /// Point the timeline at a newly watched run. A run that stops being
    /// watched keeps its timeline on screen.
    async fn follow(&mut self, watched: Option<&str>) {
        let Some(id) = watched else {
            return;
        };
        let target = TimelineTarget::Execution(id.to_string());
        if self.timeline.as_ref().map(|t| t.target()) == Some(&target) {
            return;
        }
        if let Some(old) = self.timeline.take() {
            old.shutdown().await;
        }
        tracing::debug!(execution_id = id, "timeline following watched run");
        self.timeline = Some(ExecutionTimelineView::spawn(self.ctx.clone(), target));
    }

    async fn shutdown(self) {
        self.run_list.shutdown().await;
        if let Some(content) = self.content {
            content.shutdown().await;
        }
        if let Some(timeline) = self.timeline {
            timeline.shutdown().await;
        }
    }
}

async fn changed<T>(rx: &mut Option<watch::Receiver<T>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

/// Bridge view states into the TUI state and apply TUI commands.
async fn run_controller(
    mut views: Views,
    connection: ConnectionManager,
    state_tx: watch::Sender<AppState>,
    mut cmd_rx: mpsc::Receiver<TuiCommand>,
) {
    let mut events = connection.subscribe();
    let mut runs_rx = views.run_list.watch();
    let mut content_rx = views.content.as_ref().map(|c| c.watch());
    let mut timeline_rx = views.timeline.as_ref().map(|t| t.watch());

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(TuiCommand::Quit) | None => break,
                    Some(TuiCommand::Refresh) => {
                        views.refresh();
                        state_tx.send_modify(|s| s.push_log("INFO", "refresh requested".to_string()));
                    }
                    Some(TuiCommand::SelectNext) => state_tx.send_modify(|s| s.select_next()),
                    Some(TuiCommand::SelectPrev) => state_tx.send_modify(|s| s.select_prev()),
                    Some(TuiCommand::WatchSelected) => {
                        let selected = state_tx.borrow().selected_run_id().map(str::to_string);
                        if let Some(id) = selected {
                            views.run_list.connect_to_execution(&id);
                        }
                    }
                    Some(TuiCommand::Disconnect) => {
                        views.run_list.disconnect();
                        state_tx.send_modify(|s| s.push_log("WARN", "push channel disconnected by user".to_string()));
                    }
                    Some(TuiCommand::ClearHistory) => {
                        if let Some(timeline) = &views.timeline {
                            timeline.clear_history();
                        }
                    }
                }
            }
            ok = runs_rx.changed() => {
                if ok.is_err() {
                    break;
                }
                let runs = runs_rx.borrow_and_update().clone();
                if views.follow_watched {
                    views.follow(runs.connected_execution_id.as_deref()).await;
                    timeline_rx = views.timeline.as_ref().map(|t| t.watch());
                    if let Some(rx) = &timeline_rx {
                        let timeline = rx.borrow().clone();
                        state_tx.send_modify(|s| s.timeline = timeline);
                    }
                }
                state_tx.send_modify(|s| s.set_runs(runs));
            }
            ok = changed(&mut content_rx) => {
                if ok {
                    if let Some(rx) = &content_rx {
                        let content = rx.borrow().clone();
                        state_tx.send_modify(|s| s.content = Some(content));
                    }
                }
            }
            ok = changed(&mut timeline_rx) => {
                if ok {
                    if let Some(rx) = &timeline_rx {
                        let timeline = rx.borrow().clone();
                        state_tx.send_modify(|s| s.timeline = timeline);
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SyncEvent::Connected) => {
                        state_tx.send_modify(|s| s.push_log("SYNC", "push channel connected".to_string()));
                    }
                    Ok(SyncEvent::ConnectionLost(reason)) => {
                        state_tx.send_modify(|s| s.push_log("WARN", format!("push channel lost: {}", reason)));
                    }
                    Ok(SyncEvent::ConnectionError(message)) => {
                        state_tx.send_modify(|s| s.push_log("ERROR", format!("push channel error: {}", message)));
                    }
                    Ok(SyncEvent::Push(push)) => {
                        tracing::trace!(event = %push.name, "push event");
                    }
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    views.shutdown().await;
    connection.disconnect();
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_file = std::fs::File::create("exec-sync.log")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("exec_sync=info")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .init();

    let config_path = Path::new("config.toml");
    let config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        tracing::warn!("config.toml not found, using defaults");
        Config::default()
    };

    // Load saved credentials from .env (real env vars take precedence)
    Config::load_env_file();

    println!();
    println!("  Execution Sync v{}", env!("CARGO_PKG_VERSION"));
    println!("  ====================");
    println!();
    println!("  Loading credentials (.env / env vars / interactive prompt):");
    println!();

    let user_id = Config::user_id()?;
    let auth = Arc::new(Credentials::new(user_id.clone(), Config::api_token()));
    let api: Arc<dyn WorkflowApi> = Arc::new(RestClient::new(
        auth.clone(),
        &config.backend.api_base,
        Duration::from_millis(config.backend.request_timeout_ms),
    )?);
    let transport = Arc::new(WsTransport::new(auth.clone(), &config.backend.ws_url));
    let connection = ConnectionManager::new(transport, &user_id);
    let reconnector = spawn_reconnector(connection.clone(), config.sync.reconnect_policy());
    let ctx = FacadeContext::new(connection.clone(), api, config.sync.settings());

    tracing::info!(
        user_id = %user_id,
        api_base = %config.backend.api_base,
        content_id = ?config.monitor.content_id,
        "starting monitor"
    );

    let content_id = config.monitor.content_id.clone();
    let run_list = RunListView::spawn(ctx.clone(), content_id.is_none());
    if let Some(id) = &config.monitor.execution_id {
        run_list.connect_to_execution(id);
    }
    let views = Views {
        content: content_id
            .as_deref()
            .map(|id| ContentWorkflowView::spawn(ctx.clone(), id)),
        timeline: content_id
            .as_ref()
            .map(|id| ExecutionTimelineView::spawn(ctx.clone(), TimelineTarget::Content(id.clone()))),
        follow_watched: content_id.is_none(),
        run_list,
        ctx,
    };

    let (state_tx, state_rx) = watch::channel({
        let mut s = AppState::new(&user_id);
        s.push_log("INFO", format!("monitoring as {}", user_id));
        s
    });
    let (cmd_tx, cmd_rx) = mpsc::channel::<TuiCommand>(16);

    let controller = tokio::spawn(run_controller(views, connection, state_tx, cmd_rx));

    // Blocks until quit
    let result = tui::run_tui(state_rx, cmd_tx).await;

    if let Err(e) = controller.await {
        tracing::error!("controller task failed: {:#}", e);
    }
    reconnector.abort();
    tracing::debug!("shutting down");
    result
}
