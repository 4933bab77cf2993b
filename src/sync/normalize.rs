//! Canonicalizes inbound payloads.
//!
//! Execution-, workflow- and content-scoped channels all describe the same
//! facts with slightly different shapes and casings. Everything that leaves
//! this module is either a [`NodeUpdate`] or a [`RunPatch`].

use super::connection::PushEvent;
use crate::model::{Mode, NodeRun, NodeStatus, NodeUpdate, RunPatch, RunStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

pub const EVENT_CONNECTION_ACK: &str = "connection-ack";
pub const EVENT_EXECUTION_UPDATE: &str = "execution-update";
pub const EVENT_RUN_UPDATE: &str = "run-update";
pub const EVENT_NODE_UPDATE: &str = "node-update";
pub const EVENT_CONTENT_UPDATE: &str = "content-update";

const UNKNOWN_NODE_TYPE: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalUpdate {
    Node(NodeUpdate),
    Run(RunPatch),
}

/// Every field any producer has been seen to send.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    #[serde(default, alias = "execution_id")]
    execution_id: Option<Value>,
    #[serde(default, alias = "run_id")]
    run_id: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "workflow_id")]
    workflow_id: Option<Value>,
    #[serde(default, alias = "workflow_name")]
    workflow_name: Option<String>,
    #[serde(default, alias = "workflow_key")]
    workflow_key: Option<String>,
    #[serde(default, alias = "node_name")]
    node_name: Option<String>,
    #[serde(default, alias = "node_type")]
    node_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default, alias = "started_at")]
    started_at: Option<Value>,
    #[serde(default, alias = "finished_at")]
    finished_at: Option<Value>,
    #[serde(default, alias = "content_id")]
    content_id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    output: Option<Value>,
}

/// Normalize one push event. `Ok(None)` means the event carries no state.
pub fn normalize(event: &PushEvent) -> Result<Option<CanonicalUpdate>> {
    normalize_at(event, Utc::now())
}

/// Like [`normalize`] with an explicit "now" for defaulted timestamps.
pub fn normalize_at(event: &PushEvent, now: DateTime<Utc>) -> Result<Option<CanonicalUpdate>> {
    match event.name.as_str() {
        EVENT_CONNECTION_ACK => Ok(None),
        EVENT_EXECUTION_UPDATE => {
            let raw = parse_raw(&event.data)?;
            if raw.node_name.is_some() {
                node_from_raw(raw, now).map(|n| Some(CanonicalUpdate::Node(n)))
            } else {
                run_patch_from_raw(raw).map(|p| Some(CanonicalUpdate::Run(p)))
            }
        }
        EVENT_RUN_UPDATE => {
            let raw = parse_raw(&event.data)?;
            run_patch_from_raw(raw).map(|p| Some(CanonicalUpdate::Run(p)))
        }
        EVENT_NODE_UPDATE | EVENT_CONTENT_UPDATE => {
            let raw = parse_raw(&event.data)?;
            node_from_raw(raw, now).map(|n| Some(CanonicalUpdate::Node(n)))
        }
        other => {
            tracing::trace!(event = other, "unhandled push event");
            Ok(None)
        }
    }
}

fn parse_raw(data: &Value) -> Result<RawPayload> {
    serde_json::from_value(data.clone()).context("malformed push payload")
}

fn node_from_raw(raw: RawPayload, now: DateTime<Utc>) -> Result<NodeUpdate> {
    let execution_id = raw
        .execution_id
        .as_ref()
        .or(raw.run_id.as_ref())
        .and_then(id_string)
        .context("node update without executionId")?;
    let node_name = raw
        .node_name
        .filter(|n| !n.is_empty())
        .context("node update without nodeName")?;
    let raw_status = raw.status.unwrap_or_default();
    let status = NodeStatus::parse(&raw_status)
        .with_context(|| format!("unknown node status {:?}", raw_status))?;

    let workflow_id = raw.workflow_id.as_ref().and_then(id_string);
    if workflow_id.is_none() {
        tracing::warn!(%execution_id, node = %node_name, "node update without workflowId");
    }

    Ok(NodeUpdate {
        execution_id,
        workflow_id,
        workflow_name: raw.workflow_name.unwrap_or_default(),
        node_name,
        node_type: raw
            .node_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNKNOWN_NODE_TYPE.to_string()),
        status,
        mode: parse_mode(raw.mode.as_deref()),
        timestamp: timestamp_or_now(raw.timestamp.as_ref(), now),
        finished_at: raw.finished_at.as_ref().and_then(parse_timestamp),
        content_id: raw.content_id.as_ref().and_then(id_string),
        result: raw.result.filter(|v| !v.is_null()),
    })
}

fn run_patch_from_raw(raw: RawPayload) -> Result<RunPatch> {
    let run_id = raw
        .run_id
        .as_ref()
        .or(raw.execution_id.as_ref())
        .and_then(id_string);
    let id = raw.id.as_ref().and_then(Value::as_i64);
    if run_id.is_none() && id.is_none() {
        anyhow::bail!("run update without runId or id");
    }

    Ok(RunPatch {
        id,
        run_id,
        workflow_key: raw.workflow_key.or(raw.workflow_name),
        status: raw.status.as_deref().map(RunStatus::parse),
        started_at: raw.started_at.as_ref().and_then(parse_timestamp),
        finished_at: raw.finished_at.as_ref().and_then(parse_timestamp),
        output: raw.output.filter(|v| !v.is_null()),
        content_id: raw.content_id.as_ref().and_then(id_string),
        timestamp: raw.timestamp.as_ref().and_then(parse_timestamp),
    })
}

/// Convert a REST node row into the same canonical shape push events use.
pub fn node_from_node_run(row: &NodeRun, now: DateTime<Utc>) -> Result<NodeUpdate> {
    let status = NodeStatus::parse(&row.status)
        .with_context(|| format!("unknown node status {:?}", row.status))?;
    Ok(NodeUpdate {
        execution_id: row.run_id.clone(),
        workflow_id: row.workflow_id.clone(),
        workflow_name: row.workflow_name.clone().unwrap_or_default(),
        node_name: row.node_name.clone(),
        node_type: row
            .node_type
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNKNOWN_NODE_TYPE.to_string()),
        status,
        mode: parse_mode(row.mode.as_deref()),
        timestamp: row
            .updated_at
            .or(row.finished_at)
            .or(row.started_at)
            .unwrap_or(now),
        finished_at: row.finished_at,
        content_id: row.content_id.clone(),
        result: row.result.clone().filter(|v| !v.is_null()),
    })
}

fn parse_mode(raw: Option<&str>) -> Mode {
    match raw {
        None => Mode::default(),
        Some(m) => Mode::parse(m).unwrap_or_else(|| {
            tracing::debug!(mode = m, "unknown mode, assuming production");
            Mode::default()
        }),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339 strings or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn timestamp_or_now(value: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    match value {
        None | Some(Value::Null) => now,
        Some(v) => parse_timestamp(v).unwrap_or_else(|| {
            tracing::warn!(timestamp = %v, "unparseable timestamp, using receive time");
            now
        }),
    }
}
