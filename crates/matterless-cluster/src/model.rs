// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire envelopes exchanged over the cluster transport.
//!
//! All envelopes are JSON. Field names are part of the wire format and must
//! stay stable across nodes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Random, rank-ordered identity of a cluster node. Lower wins elections.
pub type NodeId = u64;

/// Subject suffix of the restart broadcast.
pub const EVENT_RESTART_APP: &str = "restart";
/// Subject suffix of cluster introspection requests.
pub const EVENT_FETCH_NODE_INFO: &str = "fetchinfo";
/// Subject suffix of job worker start requests.
pub const EVENT_START_JOB_WORKER: &str = "startjobworker";

/// RPC request envelope: `{"Data": <event>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionInvoke {
    #[serde(rename = "Data", default)]
    pub data: Value,
}

/// RPC response envelope: `{"IsError": bool, "Error": string, "Data": <result>}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionResult {
    #[serde(rename = "IsError", default)]
    pub is_error: bool,
    #[serde(rename = "Error", default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(rename = "Data", default)]
    pub data: Value,
}

impl FunctionResult {
    /// Successful result carrying `data`.
    pub fn ok(data: Value) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Failed result carrying the handler's error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            error: message.into(),
            data: Value::Null,
        }
    }
}

/// Election heartbeat: `{"NodeID": u64}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(rename = "NodeID")]
    pub node_id: NodeId,
}

/// Named application event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEvent {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// A single log line emitted by a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub function: String,
    pub message: String,
}

/// Request for every node to report itself on `reply_to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchNodeInfo {
    pub reply_to: String,
}

/// Worker counts of one application on one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    #[serde(default)]
    pub function_workers: BTreeMap<String, usize>,
    #[serde(default)]
    pub job_workers: BTreeMap<String, usize>,
}

/// What a node reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    #[serde(default)]
    pub apps: BTreeMap<String, AppInfo>,
}

/// Aggregated answers to a cluster introspection request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub nodes: BTreeMap<NodeId, NodeInfo>,
}

/// Ask one node to start a worker for the named job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJobWorker {
    pub name: String,
}

/// Ask every node to restart the named application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartApp {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_envelopes_use_wire_names() {
        let request = serde_json::to_value(FunctionInvoke {
            data: json!({"name": "Pete"}),
        })
        .unwrap();
        assert_eq!(request, json!({"Data": {"name": "Pete"}}));

        let failed = serde_json::to_value(FunctionResult::error("FAIL")).unwrap();
        assert_eq!(failed, json!({"IsError": true, "Error": "FAIL", "Data": null}));

        let ok = serde_json::to_value(FunctionResult::ok(json!("OK"))).unwrap();
        assert_eq!(ok, json!({"IsError": false, "Data": "OK"}));
    }

    #[test]
    fn test_function_result_tolerates_missing_fields() {
        let result: FunctionResult = serde_json::from_str(r#"{"Data": 3}"#).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.data, json!(3));
    }

    #[test]
    fn test_heartbeat_wire_format() {
        let hb: Heartbeat = serde_json::from_str(r#"{"NodeID": 18446744073709551615}"#).unwrap();
        assert_eq!(hb.node_id, u64::MAX);
        assert_eq!(
            serde_json::to_string(&Heartbeat { node_id: 7 }).unwrap(),
            r#"{"NodeID":7}"#
        );
    }
}
