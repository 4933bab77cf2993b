use crate::facade::{ContentWorkflowState, RunListState, TimelineState};
use crate::sync::ConnectionStatus;
use std::collections::VecDeque;
use std::time::Instant;

const MAX_LOGS: usize = 200;

#[derive(Debug, Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub user_id: String,
    pub runs: RunListState,
    pub timeline: TimelineState,
    /// Present when following a single content item.
    pub content: Option<ContentWorkflowState>,
    /// Cursor into `runs.runs`.
    pub selected_run: usize,
    pub logs: VecDeque<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: String,
    pub level: String,
    pub message: String,
}

impl AppState {
    pub fn new(user_id: &str) -> Self {
        Self {
            start_time: Instant::now(),
            user_id: user_id.to_string(),
            runs: RunListState::default(),
            timeline: TimelineState::default(),
            content: None,
            selected_run: 0,
            logs: VecDeque::with_capacity(MAX_LOGS),
        }
    }

    pub fn push_log(&mut self, level: &str, message: String) {
        let time = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
        if self.logs.len() >= MAX_LOGS {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            time,
            level: level.to_string(),
            message,
        });
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        match &self.content {
            Some(content) => content.connection_status,
            None => self.runs.connection_status,
        }
    }

    pub fn degraded(&self) -> bool {
        self.runs.degraded
            || self.timeline.degraded
            || self.content.as_ref().is_some_and(|c| c.degraded)
    }

    /// Replace the run list, keeping the cursor in range.
    pub fn set_runs(&mut self, runs: RunListState) {
        self.runs = runs;
        self.selected_run = self
            .selected_run
            .min(self.runs.runs.len().saturating_sub(1));
    }

    pub fn select_next(&mut self) {
        if self.selected_run + 1 < self.runs.runs.len() {
            self.selected_run += 1;
        }
    }

    pub fn select_prev(&mut self) {
        self.selected_run = self.selected_run.saturating_sub(1);
    }

    pub fn selected_run_id(&self) -> Option<&str> {
        self.runs
            .runs
            .get(self.selected_run)
            .map(|r| r.run_id.as_str())
    }

    pub fn uptime(&self) -> String {
        let secs = self.start_time.elapsed().as_secs();
        let h = secs / 3600;
        let m = (secs % 3600) / 60;
        format!("{}h {:02}m", h, m)
    }
}
