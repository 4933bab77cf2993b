mod common;

use common::{node_row, run, ts_str, wait_until, Harness};
use exec_sync::backend::types::{OutboundFrame, Room};
use exec_sync::facade::{ExecutionTimelineView, SyncSettings, TimelineTarget};
use exec_sync::model::{ExecutionStatus, NodeStatus, RunStatus};
use exec_sync::sync::ConnectionStatus;
use serde_json::json;
use tokio::time::Instant;

fn node_event(execution_id: &str, node: &str, status: &str, at: i64) -> serde_json::Value {
    json!({
        "executionId": execution_id,
        "workflowId": "wf-1",
        "workflowName": "Publish post",
        "nodeName": node,
        "nodeType": "task",
        "status": status,
        "contentId": "post-1",
        "timestamp": ts_str(at),
    })
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeline_tracks_nodes_to_completion() {
    let mut h = Harness::new();
    h.api
        .set_runs(vec![run("exec-1", RunStatus::Running, "post-1", 0)]);
    h.api
        .set_nodes(vec![node_row("exec-1", "fetch", "running", "post-1", 0)]);

    let view = ExecutionTimelineView::spawn(
        h.ctx.clone(),
        TimelineTarget::Execution("exec-1".to_string()),
    );
    let mut state = view.watch();

    let s = wait_until(&mut state, |s| s.selected.is_some()).await;
    let selected = s.selected.unwrap();
    assert_eq!(selected.execution_id, "exec-1");
    assert_eq!(selected.status, ExecutionStatus::Running);
    assert_eq!(selected.workflow_name, "Publish post");

    let mut remote = h.next_remote().await;
    assert_eq!(
        remote.next_frame().await,
        OutboundFrame::Join(Room::Execution("exec-1".to_string()))
    );

    remote.push("node-update", node_event("exec-1", "fetch", "success", 5)).await;
    remote.push("node-update", node_event("exec-1", "publish", "running", 6)).await;
    // other executions never leak into this timeline
    remote.push("node-update", node_event("exec-2", "fetch", "failed", 7)).await;

    let s = wait_until(&mut state, |s| {
        s.selected.as_ref().is_some_and(|e| e.nodes.len() == 2)
    })
    .await;
    let selected = s.selected.unwrap();
    assert_eq!(selected.node_names(), vec!["fetch", "publish"]);
    assert_eq!(selected.status, ExecutionStatus::Running);
    assert_eq!(s.executions.len(), 1);

    remote.push("node-update", node_event("exec-1", "publish", "success", 9)).await;
    let s = wait_until(&mut state, |s| {
        s.selected
            .as_ref()
            .is_some_and(|e| e.status == ExecutionStatus::Completed)
    })
    .await;
    assert_eq!(
        s.selected.unwrap().node("publish").map(|n| n.status),
        Some(NodeStatus::Success)
    );

    view.shutdown().await;
    assert_eq!(
        remote.next_frame().await,
        OutboundFrame::Leave(Room::Execution("exec-1".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_recovers_final_state_by_polling() {
    let settings = SyncSettings::default();
    let mut h = Harness::with_settings(settings);
    h.api
        .set_runs(vec![run("exec-1", RunStatus::Running, "post-1", 0)]);
    h.api
        .set_nodes(vec![node_row("exec-1", "fetch", "running", "post-1", 0)]);

    let view = ExecutionTimelineView::spawn(
        h.ctx.clone(),
        TimelineTarget::Execution("exec-1".to_string()),
    );
    let mut state = view.watch();
    wait_until(&mut state, |s| {
        s.selected.is_some() && s.connection_status == ConnectionStatus::Connected
    })
    .await;

    let remote = h.next_remote().await;
    remote.drop_link("connection reset").await;
    let lost_at = Instant::now();
    let s = wait_until(&mut state, |s| s.degraded).await;
    assert_eq!(s.connection_status, ConnectionStatus::Disconnected);

    // the run finishes while nobody is listening
    h.api.set_runs(vec![run("exec-1", RunStatus::Failed, "post-1", 0)]);
    h.api.set_nodes(vec![
        node_row("exec-1", "fetch", "success", "post-1", 5),
        node_row("exec-1", "publish", "failed", "post-1", 20),
    ]);

    let s = wait_until(&mut state, |s| {
        s.selected
            .as_ref()
            .is_some_and(|e| e.status == ExecutionStatus::Failed)
    })
    .await;
    let waited = Instant::now().duration_since(lost_at);
    assert!(
        waited <= settings.poll.interval + settings.connection_sample,
        "recovered after {:?}",
        waited
    );
    let selected = s.selected.unwrap();
    assert_eq!(selected.run_status, Some(RunStatus::Failed));
    assert_eq!(selected.node("publish").map(|n| n.status), Some(NodeStatus::Failed));
    assert!(s.error.is_none());

    // the room is remembered for the next connect
    assert_eq!(
        h.ctx.connection.state().pending_room,
        Some(Room::Execution("exec-1".to_string()))
    );

    view.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_content_timeline_follows_latest_execution() {
    let mut h = Harness::new();
    h.api.set_runs(vec![
        run("exec-1", RunStatus::Completed, "post-1", 0),
        run("exec-other", RunStatus::Running, "post-9", 0),
    ]);
    h.api.set_nodes(vec![
        node_row("exec-1", "fetch", "success", "post-1", 0),
        node_row("exec-other", "fetch", "running", "post-9", 0),
    ]);

    let view = ExecutionTimelineView::spawn(
        h.ctx.clone(),
        TimelineTarget::Content("post-1".to_string()),
    );
    let mut state = view.watch();
    let s = wait_until(&mut state, |s| s.selected.is_some()).await;
    assert_eq!(s.selected.unwrap().execution_id, "exec-1");
    assert_eq!(s.executions.len(), 1);

    let mut remote = h.next_remote().await;
    assert_eq!(
        remote.next_frame().await,
        OutboundFrame::Join(Room::Content("post-1".to_string()))
    );

    remote.push("node-update", node_event("exec-2", "fetch", "running", 60)).await;
    let s = wait_until(&mut state, |s| {
        s.selected.as_ref().is_some_and(|e| e.execution_id == "exec-2")
    })
    .await;
    assert_eq!(s.executions.len(), 2);
    assert_eq!(s.executions[0].execution_id, "exec-2");

    // a manual pick sticks until history is cleared
    view.select("exec-1");
    wait_until(&mut state, |s| {
        s.selected.as_ref().is_some_and(|e| e.execution_id == "exec-1")
    })
    .await;
    remote.push("node-update", node_event("exec-2", "publish", "running", 61)).await;
    let s = wait_until(&mut state, |s| {
        s.executions.first().is_some_and(|e| e.node_count == 2)
    })
    .await;
    assert_eq!(s.selected.unwrap().execution_id, "exec-1");

    view.clear_history();
    let s = wait_until(&mut state, |s| s.executions.is_empty()).await;
    assert!(s.selected.is_none());

    view.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_run_failing_before_any_node_is_shown() {
    let h = Harness::new();
    let mut failed = run("exec-1", RunStatus::Failed, "post-1", 0);
    failed.content_id = None;
    h.api.set_runs(vec![failed]);

    let view = ExecutionTimelineView::spawn(
        h.ctx.clone(),
        TimelineTarget::Execution("exec-1".to_string()),
    );
    let mut state = view.watch();
    let s = wait_until(&mut state, |s| s.selected.is_some()).await;
    let selected = s.selected.unwrap();
    assert_eq!(selected.status, ExecutionStatus::Failed);
    assert_eq!(selected.run_status, Some(RunStatus::Failed));
    assert!(selected.nodes.is_empty());
    assert_eq!(h.api.calls("nodes_by_content"), 0);

    view.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pushed_run_failure_before_nodes_is_shown() {
    let mut h = Harness::new();
    let view = ExecutionTimelineView::spawn(
        h.ctx.clone(),
        TimelineTarget::Execution("exec-1".to_string()),
    );
    let mut state = view.watch();
    // the run is not known to the backend yet
    wait_until(&mut state, |s| s.error.is_some()).await;

    let remote = h.next_remote().await;
    remote
        .push("run-update", json!({ "runId": "exec-2", "status": "FAILED" }))
        .await;
    remote
        .push(
            "run-update",
            json!({ "runId": "exec-1", "status": "CANCELLED", "timestamp": ts_str(3) }),
        )
        .await;

    let s = wait_until(&mut state, |s| s.selected.is_some()).await;
    let selected = s.selected.unwrap();
    assert_eq!(selected.execution_id, "exec-1");
    assert_eq!(selected.status, ExecutionStatus::Failed);
    assert_eq!(s.executions.len(), 1, "other runs stay out of this timeline");

    view.shutdown().await;
}
