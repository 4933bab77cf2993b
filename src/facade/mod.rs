//! Consumer-facing views over the synchronized state.
//!
//! Each view is an actor task that owns its stores. Handles send commands
//! over an `mpsc` channel and read state through a `watch` channel.

pub mod content;
pub mod run_list;
pub mod timeline;

use crate::backend::WorkflowApi;
use crate::sync::{ConnectionManager, PollPolicy, SyncEvent};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

pub use content::{ContentWorkflowState, ContentWorkflowView};
pub use run_list::{RunListState, RunListView};
pub use timeline::{ExecutionTimelineView, TimelineState, TimelineTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub poll: PollPolicy,
    /// How often views sample the connection and consult the poller.
    pub connection_sample: Duration,
    /// Executions kept per timeline; 0 keeps everything.
    pub history_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            connection_sample: Duration::from_secs(1),
            history_limit: 50,
        }
    }
}

/// Everything a view needs from the application.
#[derive(Clone)]
pub struct FacadeContext {
    pub connection: ConnectionManager,
    pub api: Arc<dyn WorkflowApi>,
    pub settings: SyncSettings,
}

impl FacadeContext {
    pub fn new(connection: ConnectionManager, api: Arc<dyn WorkflowApi>, settings: SyncSettings) -> Self {
        Self {
            connection,
            api,
            settings,
        }
    }

    pub(crate) fn sample_timer(&self) -> Interval {
        let mut timer = tokio::time::interval(self.settings.connection_sample);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    }
}

/// Degraded while the link is known to be down; cleared once it is back.
pub(crate) fn degraded_after(current: bool, event: &SyncEvent) -> bool {
    match event {
        SyncEvent::Connected => false,
        SyncEvent::ConnectionLost(_) | SyncEvent::ConnectionError(_) => true,
        SyncEvent::Push(_) => current,
    }
}

/// At most one background fetch, reporting back over a channel.
pub(crate) struct FetchSlot<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: mpsc::UnboundedReceiver<T>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> FetchSlot<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, task: None }
    }

    pub(crate) fn busy(&self) -> bool {
        self.task.is_some()
    }

    pub(crate) fn spawn<F>(&mut self, fetch: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let tx = self.tx.clone();
        self.task = Some(tokio::spawn(async move {
            let _ = tx.send(fetch.await);
        }));
    }

    /// Pending forever while idle.
    pub(crate) async fn recv(&mut self) -> Option<T> {
        let out = self.rx.recv().await;
        self.task = None;
        out
    }

    pub(crate) fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        while self.rx.try_recv().is_ok() {}
    }
}
