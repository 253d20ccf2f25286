//! Request/reply/event envelopes shared by every service.
//!
//! Clients send `{type, data}`.  Servers reply `{ok:true, ...}` or
//! `{ok:false, error, ...}`.  The lobby additionally pushes unsolicited
//! `{type:"event", name, data}` frames on the same socket; clients must
//! demultiplex events from replies.

use serde::Deserialize;
use serde_json::{json, Map, Value};

/// A parsed client request.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// String field accessor with trimming, mirroring how handlers read
    /// loosely-typed request data.
    pub fn str_field(&self, key: &str) -> Option<String> {
        let s = self.data.get(key)?.as_str()?.trim();
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    }

    pub fn i64_field(&self, key: &str) -> Option<i64> {
        self.data.get(key)?.as_i64()
    }

    pub fn bool_field(&self, key: &str) -> bool {
        self.data
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// `{ok:true}` merged with `extra` (which must be a JSON object).
pub fn ok(extra: Value) -> Value {
    let mut body = Map::new();
    body.insert("ok".into(), Value::Bool(true));
    if let Value::Object(fields) = extra {
        body.extend(fields);
    }
    Value::Object(body)
}

/// `{ok:false, error}`.
pub fn err(code: &str) -> Value {
    json!({"ok": false, "error": code})
}

/// A server-initiated event frame.
pub fn event(name: &str, data: Value) -> Value {
    json!({"type": "event", "name": name, "data": data})
}

/// Returns the event name if `frame` is an event envelope.
pub fn event_name(frame: &Value) -> Option<&str> {
    if frame.get("type")?.as_str()? == "event" {
        frame.get("name")?.as_str()
    } else {
        None
    }
}

/// Event names pushed by the lobby.
pub mod events {
    pub const GAME_INFO: &str = "game_info";
    pub const GAME_READY: &str = "game_ready";
    pub const PLAYER_JOINED: &str = "player_joined";
    pub const PLAYER_LEFT: &str = "player_left";
    pub const HOST_CHANGED: &str = "host_changed";
}
