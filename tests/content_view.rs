mod common;

use common::{content_status, node_row, run, ts_str, wait_until, Harness};
use exec_sync::backend::types::{OutboundFrame, Room, TriggerResponse};
use exec_sync::facade::{ContentWorkflowView, ExecutionTimelineView, TimelineTarget};
use exec_sync::model::{NodeStatus, RunStatus};
use exec_sync::sync::ConnectionStatus;
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_running_content_goes_live_and_settles() {
    let mut h = Harness::new();
    h.api.set_status(content_status("post-1", RunStatus::Running));
    h.api
        .set_runs(vec![run("run-1", RunStatus::Running, "post-1", 0)]);
    h.api
        .set_nodes(vec![node_row("run-1", "fetch", "running", "post-1", 0)]);

    let view = ContentWorkflowView::spawn(h.ctx.clone(), "post-1");
    assert_eq!(view.content_id(), "post-1");
    let mut state = view.watch();

    let s = wait_until(&mut state, |s| s.status.is_some() && !s.nodes.is_empty()).await;
    assert_eq!(s.runs.len(), 1);
    assert_eq!(s.nodes[0].status, NodeStatus::Running);

    let mut remote = h.next_remote().await;
    assert_eq!(
        remote.next_frame().await,
        OutboundFrame::Join(Room::Content("post-1".to_string()))
    );

    h.api.set_status(content_status("post-1", RunStatus::Completed));
    remote
        .push(
            "content-update",
            json!({
                "executionId": "run-1",
                "nodeName": "fetch",
                "status": "success",
                "contentId": "post-1",
                "timestamp": ts_str(5),
            }),
        )
        .await;

    let s = wait_until(&mut state, |s| {
        s.status
            .as_ref()
            .is_some_and(|st| st.status == RunStatus::Completed)
    })
    .await;
    assert_eq!(s.nodes.len(), 1);
    assert_eq!(s.nodes[0].status, NodeStatus::Success);
    assert_eq!(
        remote.next_frame().await,
        OutboundFrame::Leave(Room::Content("post-1".to_string()))
    );

    view.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_events_for_other_content_are_ignored() {
    let mut h = Harness::new();
    h.api.set_status(content_status("post-1", RunStatus::Running));
    h.api
        .set_nodes(vec![node_row("run-1", "fetch", "running", "post-1", 0)]);

    let view = ContentWorkflowView::spawn(h.ctx.clone(), "post-1");
    let mut state = view.watch();
    wait_until(&mut state, |s| !s.nodes.is_empty()).await;
    let status_calls = h.api.calls("status");

    let remote = h.next_remote().await;
    remote
        .push(
            "node-update",
            json!({
                "executionId": "run-9",
                "nodeName": "fetch",
                "status": "failed",
                "contentId": "post-9",
                "timestamp": ts_str(5),
            }),
        )
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    let s = view.state();
    assert_eq!(s.nodes.len(), 1);
    assert_eq!(s.nodes[0].execution_id, "run-1");
    assert_eq!(h.api.calls("status"), status_calls, "no refetch for foreign content");

    view.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_trigger_queues_run_and_joins_room() {
    let mut h = Harness::new();
    h.api.set_status(content_status("post-1", RunStatus::Completed));
    h.api.set_trigger(TriggerResponse {
        run_id: "run-2".to_string(),
        id: 2,
    });

    let view = ContentWorkflowView::spawn(h.ctx.clone(), "post-1");
    let mut state = view.watch();
    let s = wait_until(&mut state, |s| s.status.is_some()).await;
    assert_eq!(s.connection_status, ConnectionStatus::Disconnected);

    h.api.set_status(content_status("post-1", RunStatus::Running));
    let response = view.trigger(&json!({ "mode": "test" })).await.unwrap();
    assert_eq!(response.id, 2);

    let s = wait_until(&mut state, |s| {
        s.connection_status == ConnectionStatus::Connected
            && s.status
                .as_ref()
                .is_some_and(|st| st.status == RunStatus::Running)
    })
    .await;
    assert_eq!(s.runs.len(), 1);
    assert_eq!(s.runs[0].run_id, "run-2");
    assert_eq!(s.runs[0].status, RunStatus::Queued);

    let mut remote = h.next_remote().await;
    assert_eq!(
        remote.next_frame().await,
        OutboundFrame::Join(Room::Content("post-1".to_string()))
    );

    view.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_settled_content_keeps_room_for_timeline() {
    let mut h = Harness::new();
    h.api.set_status(content_status("post-1", RunStatus::Running));
    h.api
        .set_runs(vec![run("run-1", RunStatus::Running, "post-1", 0)]);
    h.api
        .set_nodes(vec![node_row("run-1", "fetch", "running", "post-1", 0)]);

    let room = Room::Content("post-1".to_string());
    let timeline = ExecutionTimelineView::spawn(
        h.ctx.clone(),
        TimelineTarget::Content("post-1".to_string()),
    );
    let view = ContentWorkflowView::spawn(h.ctx.clone(), "post-1");
    let mut state = view.watch();
    wait_until(&mut state, |s| {
        s.status
            .as_ref()
            .is_some_and(|st| st.status == RunStatus::Running)
    })
    .await;
    let mut conn = h.ctx.connection.watch_state();
    wait_until(&mut conn, |c| c.room.as_ref() == Some(&room)).await;

    h.api.set_status(content_status("post-1", RunStatus::Completed));
    view.refresh();
    wait_until(&mut state, |s| {
        s.status
            .as_ref()
            .is_some_and(|st| st.status == RunStatus::Completed)
    })
    .await;
    assert_eq!(h.ctx.connection.state().room, Some(room.clone()));

    // a new run on the same content still reaches the timeline
    let remote = h.next_remote().await;
    remote
        .push(
            "node-update",
            json!({
                "executionId": "run-2",
                "nodeName": "fetch",
                "status": "running",
                "contentId": "post-1",
                "timestamp": ts_str(60),
            }),
        )
        .await;
    let mut timeline_state = timeline.watch();
    wait_until(&mut timeline_state, |s| {
        s.selected.as_ref().is_some_and(|e| e.execution_id == "run-2")
    })
    .await;

    view.shutdown().await;
    assert_eq!(h.ctx.connection.state().room, Some(room));
    timeline.shutdown().await;
    assert_eq!(h.ctx.connection.state().room, None);
}
