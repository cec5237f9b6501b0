// Relay server protocol: one JSON object per WebSocket text frame
//
// client -> server  {"id": 7, "request": {"op": "get", "path": "rooms/AB12C3"}}
// server -> client  {"type": "reply", "id": 7, "value": {...}}
//                   {"type": "failed", "id": 7, "message": "..."}
//                   {"type": "change", "watch_id": 3, "value": {...}}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::store::{DisconnectAction, WatchId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub request: Op,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Get {
        path: String,
    },
    Set {
        path: String,
        value: Value,
    },
    Update {
        path: String,
        fields: Map<String, Value>,
    },
    Remove {
        path: String,
    },
    CompareAndSet {
        path: String,
        #[serde(default)]
        expected: Option<Value>,
        #[serde(default)]
        value: Option<Value>,
    },
    /// The client picks the watch id so changes can arrive before the reply
    Watch {
        path: String,
        watch_id: WatchId,
    },
    Unwatch {
        watch_id: WatchId,
    },
    OnDisconnect {
        path: String,
        action: DisconnectAction,
    },
    CancelOnDisconnect {
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Reply {
        id: u64,
        #[serde(default)]
        value: Option<Value>,
        /// Only set for compare_and_set
        #[serde(default)]
        committed: Option<bool>,
    },
    Failed {
        id: u64,
        message: String,
    },
    Change {
        watch_id: WatchId,
        #[serde(default)]
        value: Option<Value>,
    },
}

impl Frame {
    pub fn ok(id: u64) -> Self {
        Frame::Reply {
            id,
            value: None,
            committed: None,
        }
    }

    pub fn value(id: u64, value: Option<Value>) -> Self {
        Frame::Reply {
            id,
            value,
            committed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let req = Request {
            id: 7,
            request: Op::Get {
                path: "rooms/AB12C3".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"id": 7, "request": {"op": "get", "path": "rooms/AB12C3"}})
        );
    }

    #[test]
    fn test_compare_and_set_with_absent_expected() {
        let req: Request = serde_json::from_value(json!({
            "id": 1,
            "request": {"op": "compare_and_set", "path": "rooms/R", "expected": null, "value": {"host": true}}
        }))
        .unwrap();
        assert_eq!(
            req.request,
            Op::CompareAndSet {
                path: "rooms/R".into(),
                expected: None,
                value: Some(json!({"host": true})),
            }
        );
    }

    #[test]
    fn test_disconnect_action_shape() {
        let mut fields = Map::new();
        fields.insert("player2".into(), json!(false));
        let op = Op::OnDisconnect {
            path: "rooms/R".into(),
            action: DisconnectAction::Update { fields },
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "on_disconnect", "path": "rooms/R",
                   "action": {"kind": "update", "fields": {"player2": false}}})
        );
    }

    #[test]
    fn test_change_frame_without_value_means_removed() {
        let frame: Frame = serde_json::from_str(r#"{"type":"change","watch_id":3}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Change {
                watch_id: 3,
                value: None
            }
        );
    }
}
