//! Merges canonical updates into per-entity state.
//!
//! Push and poll paths both land here. Two orderings coexist: same-name node
//! updates overwrite in arrival order (guarded against stale timestamps),
//! while the displayed node order is always by timestamp.

use crate::model::{
    Execution, ExecutionStatus, NodeStatus, NodeUpdate, RunPatch, RunStatus, WorkflowRun,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// Identical to what is stored; nothing changed.
    Unchanged,
    /// Older than what is stored for the same node; ignored.
    Stale,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// Aggregate status from node statuses: any failed, else any running,
/// else completed. A waiting-only set counts as completed.
pub fn derive_status(nodes: &[NodeUpdate]) -> ExecutionStatus {
    if nodes.iter().any(|n| n.status == NodeStatus::Failed) {
        ExecutionStatus::Failed
    } else if nodes.iter().any(|n| n.status == NodeStatus::Running) {
        ExecutionStatus::Running
    } else {
        ExecutionStatus::Completed
    }
}

/// Node-derived status, overridden by a terminal status the backend
/// reported for the run. A failed node still wins over a completed run.
/// With no nodes yet, the run status alone decides.
fn effective_status(nodes: &[NodeUpdate], run_status: Option<&RunStatus>) -> ExecutionStatus {
    if nodes.is_empty() {
        return match run_status {
            Some(RunStatus::Failed | RunStatus::Cancelled) => ExecutionStatus::Failed,
            Some(RunStatus::Completed) => ExecutionStatus::Completed,
            _ => ExecutionStatus::Running,
        };
    }
    let derived = derive_status(nodes);
    match run_status {
        Some(RunStatus::Failed | RunStatus::Cancelled) => ExecutionStatus::Failed,
        Some(RunStatus::Completed) if derived != ExecutionStatus::Failed => {
            ExecutionStatus::Completed
        }
        _ => derived,
    }
}

/// Incoming fields win; optional fields it lacks keep the stored value.
fn merge_node(existing: &NodeUpdate, incoming: NodeUpdate) -> NodeUpdate {
    let finished_at = if incoming.status.is_terminal() {
        incoming.finished_at.or(existing.finished_at)
    } else {
        incoming.finished_at
    };
    NodeUpdate {
        workflow_id: incoming.workflow_id.or_else(|| existing.workflow_id.clone()),
        workflow_name: if incoming.workflow_name.is_empty() {
            existing.workflow_name.clone()
        } else {
            incoming.workflow_name
        },
        node_type: if incoming.node_type == "unknown" {
            existing.node_type.clone()
        } else {
            incoming.node_type
        },
        content_id: incoming.content_id.or_else(|| existing.content_id.clone()),
        result: incoming.result.or_else(|| existing.result.clone()),
        finished_at,
        ..incoming
    }
}

/// In-memory map of executions with bounded history.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStore {
    executions: HashMap<String, Execution>,
    selected: Option<String>,
    /// 0 means unbounded.
    history_limit: usize,
}

impl ExecutionStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            executions: HashMap::new(),
            selected: None,
            history_limit,
        }
    }

    pub fn apply(&mut self, update: NodeUpdate) -> ApplyOutcome {
        let Some(execution) = self.executions.get_mut(&update.execution_id) else {
            let id = update.execution_id.clone();
            self.executions.insert(id.clone(), new_execution(update));
            self.enforce_limit(&id);
            return ApplyOutcome::Created;
        };

        let timestamp = update.timestamp;
        match execution
            .nodes
            .iter_mut()
            .find(|n| n.node_name == update.node_name)
        {
            Some(existing) => {
                if update.timestamp < existing.timestamp {
                    tracing::debug!(
                        execution_id = %update.execution_id,
                        node = %update.node_name,
                        "ignoring stale node update"
                    );
                    return ApplyOutcome::Stale;
                }
                let merged = merge_node(existing, update);
                if *existing == merged {
                    return ApplyOutcome::Unchanged;
                }
                *existing = merged;
            }
            None => execution.nodes.push(update),
        }

        // sort_by_key is stable: equal timestamps keep arrival order
        execution.nodes.sort_by_key(|n| n.timestamp);
        backfill_identity(execution);
        execution.status = effective_status(&execution.nodes, execution.run_status.as_ref());
        execution.started_at = execution.started_at.min(timestamp);
        execution.last_updated = execution.last_updated.max(timestamp);
        ApplyOutcome::Updated
    }

    /// Record the backend's own status for an execution. A run reported
    /// before any of its nodes starts an execution with an empty timeline.
    pub fn apply_run(&mut self, patch: &RunPatch) -> ApplyOutcome {
        let (Some(run_id), Some(status)) = (patch.run_id.as_deref(), patch.status.as_ref()) else {
            return ApplyOutcome::Unchanged;
        };
        let Some(execution) = self.executions.get_mut(run_id) else {
            let started_at = patch.started_at.or(patch.timestamp).unwrap_or_else(Utc::now);
            let last_updated = patch
                .finished_at
                .or(patch.timestamp)
                .map_or(started_at, |t| t.max(started_at));
            self.executions.insert(
                run_id.to_string(),
                Execution {
                    execution_id: run_id.to_string(),
                    workflow_id: None,
                    workflow_name: patch.workflow_key.clone().unwrap_or_default(),
                    content_id: patch.content_id.clone(),
                    status: effective_status(&[], Some(status)),
                    started_at,
                    last_updated,
                    nodes: Vec::new(),
                    run_status: Some(status.clone()),
                },
            );
            self.enforce_limit(run_id);
            return ApplyOutcome::Created;
        };

        let mut changed = false;
        if execution.content_id.is_none() && patch.content_id.is_some() {
            execution.content_id = patch.content_id.clone();
            changed = true;
        }
        if execution.run_status.as_ref() != Some(status) {
            execution.run_status = Some(status.clone());
            execution.status = effective_status(&execution.nodes, execution.run_status.as_ref());
            changed = true;
        }
        if changed {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::Unchanged
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<&Execution> {
        self.executions.get(execution_id)
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.executions.contains_key(execution_id)
    }

    /// Select a known execution as the spotlighted one.
    pub fn select(&mut self, execution_id: &str) -> bool {
        if self.executions.contains_key(execution_id) {
            self.selected = Some(execution_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn selected(&self) -> Option<&Execution> {
        self.selected.as_deref().and_then(|id| self.executions.get(id))
    }

    /// Most recently updated first.
    pub fn executions(&self) -> Vec<&Execution> {
        let mut all: Vec<&Execution> = self.executions.values().collect();
        all.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        all
    }

    /// The most recently started execution touching `content_id`.
    pub fn latest_for_content(&self, content_id: &str) -> Option<&Execution> {
        self.executions
            .values()
            .filter(|e| e.content_id.as_deref() == Some(content_id))
            .max_by(|a, b| {
                a.started_at
                    .cmp(&b.started_at)
                    .then_with(|| a.last_updated.cmp(&b.last_updated))
            })
    }

    pub fn clear_history(&mut self) {
        self.executions.clear();
        self.selected = None;
    }

    pub fn len(&self) -> usize {
        self.executions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    fn enforce_limit(&mut self, keep: &str) {
        if self.history_limit == 0 {
            return;
        }
        while self.executions.len() > self.history_limit {
            let victim = self
                .executions
                .values()
                .filter(|e| e.execution_id != keep && Some(&e.execution_id) != self.selected.as_ref())
                .min_by_key(|e| e.last_updated)
                .map(|e| e.execution_id.clone());
            match victim {
                Some(id) => {
                    tracing::debug!(execution_id = %id, "evicting execution from history");
                    self.executions.remove(&id);
                }
                None => break,
            }
        }
    }
}

fn new_execution(update: NodeUpdate) -> Execution {
    let status = if update.status == NodeStatus::Failed {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Running
    };
    Execution {
        execution_id: update.execution_id.clone(),
        workflow_id: update.workflow_id.clone(),
        workflow_name: update.workflow_name.clone(),
        content_id: update.content_id.clone(),
        status,
        started_at: update.timestamp,
        last_updated: update.timestamp,
        nodes: vec![update],
        run_status: None,
    }
}

fn backfill_identity(execution: &mut Execution) {
    for node in &execution.nodes {
        if execution.workflow_id.is_none() {
            execution.workflow_id = node.workflow_id.clone();
        }
        if execution.content_id.is_none() {
            execution.content_id = node.content_id.clone();
        }
        if execution.workflow_name.is_empty() {
            execution.workflow_name = node.workflow_name.clone();
        }
    }
}

/// Run rows, unique by `id` when present, else by `run_id`.
#[derive(Debug, Clone, Default)]
pub struct RunStore {
    runs: Vec<WorkflowRun>,
}

impl RunStore {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    /// Merge a partial update. Only fields present in `patch` overwrite.
    pub fn upsert(&mut self, patch: RunPatch) -> ApplyOutcome {
        let position = patch
            .id
            .and_then(|id| self.runs.iter().position(|r| r.id == Some(id)))
            .or_else(|| {
                patch
                    .run_id
                    .as_deref()
                    .and_then(|run_id| self.runs.iter().position(|r| r.run_id == run_id))
            });

        let outcome = match position {
            Some(idx) => {
                let run = &mut self.runs[idx];
                let before = run.clone();
                apply_patch(run, patch);
                if *run == before {
                    return ApplyOutcome::Unchanged;
                }
                if run.last_updated == before.last_updated {
                    run.last_updated = Some(Utc::now());
                }
                ApplyOutcome::Updated
            }
            None => {
                let Some(run) = new_run(patch) else {
                    tracing::warn!("run update with no identity, dropped");
                    return ApplyOutcome::Unchanged;
                };
                self.runs.push(run);
                ApplyOutcome::Created
            }
        };
        self.sort();
        outcome
    }

    /// Feed a polled snapshot through the same upsert path.
    /// Returns how many rows changed.
    pub fn apply_snapshot(&mut self, runs: Vec<WorkflowRun>) -> usize {
        runs.into_iter()
            .map(|run| self.upsert(RunPatch::from(run)))
            .filter(|o| o.changed())
            .count()
    }

    /// Newest start first; runs without a start time last.
    pub fn runs(&self) -> &[WorkflowRun] {
        &self.runs
    }

    pub fn get_by_run_id(&self, run_id: &str) -> Option<&WorkflowRun> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    pub fn contains_run_id(&self, run_id: &str) -> bool {
        self.get_by_run_id(run_id).is_some()
    }

    pub fn any_active(&self) -> bool {
        self.runs.iter().any(|r| !r.status.is_terminal())
    }

    pub fn most_recent_active(&self) -> Option<&WorkflowRun> {
        self.runs.iter().find(|r| !r.status.is_terminal())
    }

    /// Flag exactly one run as the live one.
    pub fn mark_live(&mut self, run_id: &str) {
        for run in &mut self.runs {
            run.is_live = run.run_id == run_id;
        }
    }

    pub fn clear_live(&mut self) {
        for run in &mut self.runs {
            run.is_live = false;
        }
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn sort(&mut self) {
        self.runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    }
}

fn apply_patch(run: &mut WorkflowRun, patch: RunPatch) {
    if let Some(id) = patch.id {
        run.id = Some(id);
    }
    if let Some(run_id) = patch.run_id {
        run.run_id = run_id;
    }
    if let Some(key) = patch.workflow_key {
        run.workflow_key = key;
    }
    if let Some(status) = patch.status {
        run.status = status;
    }
    if let Some(started_at) = patch.started_at {
        run.started_at = Some(started_at);
    }
    if let Some(finished_at) = patch.finished_at {
        run.finished_at = Some(finished_at);
    }
    if let Some(output) = patch.output {
        run.output = Some(output);
    }
    if let Some(content_id) = patch.content_id {
        run.content_id = Some(content_id);
    }
    if let Some(ts) = patch.timestamp {
        run.last_updated = Some(max_ts(run.last_updated, ts));
    }
}

fn max_ts(current: Option<DateTime<Utc>>, ts: DateTime<Utc>) -> DateTime<Utc> {
    current.map_or(ts, |c| c.max(ts))
}

fn new_run(patch: RunPatch) -> Option<WorkflowRun> {
    let run_id = patch
        .run_id
        .or_else(|| patch.id.map(|id| id.to_string()))?;
    Some(WorkflowRun {
        id: patch.id,
        run_id,
        workflow_key: patch.workflow_key.unwrap_or_default(),
        status: patch.status.unwrap_or(RunStatus::Queued),
        started_at: patch.started_at,
        finished_at: patch.finished_at,
        output: patch.output,
        content_id: patch.content_id,
        is_live: false,
        last_updated: Some(patch.timestamp.unwrap_or_else(Utc::now)),
    })
}
