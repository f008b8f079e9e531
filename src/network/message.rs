use super::route::Route;
use crate::blockchain::now_millis;
use crate::error::ChainError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire type of relay messages.
pub const SW_BROADCAST: u8 = 6;
/// Handler id of the shared broadcast channel, demultiplexed by `broadcastId`.
pub const BROADCAST_ID: &str = "broadcast";
/// Default message lifetime, also the clock slack tolerated on top of it.
pub const LATENCY_TIME_MS: i64 = 2_000;
/// How long a mutex token suppresses duplicates.
pub const MESSAGE_MUTEX_TIMEOUT_MS: u64 = 1_000;
/// Longest route a message may carry before it is refused.
pub const MAX_ROUTE_LEN: usize = 10;
/// Suffix of response message ids.
pub const RESPONSE_SUFFIX: &str = "_RESP";

/// Random dedup token. Not a cryptographic value.
pub fn new_mutex_token() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}{:08x}", rng.gen::<u64>(), rng.gen::<u64>(), rng.gen::<u32>())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipMessage {
    #[serde(default)]
    pub data: Value,
    pub sender: String,
    #[serde(alias = "reciver")]
    pub receiver: String,
    pub id: String,
    pub timestamp: i64,
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    pub relevancy_time: i64,
    /// Hops this copy has travelled. Only ever appended to.
    #[serde(default)]
    pub route: Route,
    /// Planned hops to the receiver, taken from a cached route back. Empty
    /// when the message is flooded.
    #[serde(default, skip_serializing_if = "Route::is_empty")]
    pub path: Route,
    #[serde(rename = "type")]
    pub kind: u8,
    pub timestamp_of_start: i64,
    #[serde(default)]
    pub broadcast_id: String,
    pub mutex: String,
}

impl GossipMessage {
    /// Fresh message stamped with the current time and a new mutex token.
    pub fn new(data: Value, receiver: &str, sender: &str, id: &str) -> Self {
        let now = now_millis();
        GossipMessage {
            data,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            id: id.to_string(),
            timestamp: now,
            ttl: 0,
            relevancy_time: LATENCY_TIME_MS,
            route: Route::new(),
            path: Route::new(),
            kind: SW_BROADCAST,
            timestamp_of_start: now,
            broadcast_id: String::new(),
            mutex: new_mutex_token(),
        }
    }

    pub fn with_relevancy_time(mut self, relevancy_time: i64) -> Self {
        self.relevancy_time = relevancy_time;
        self
    }

    pub fn with_broadcast_id(mut self, broadcast_id: &str) -> Self {
        self.broadcast_id = broadcast_id.to_string();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Copy of this message carrying `route` instead.
    pub fn with_route(&self, route: Route) -> Self {
        GossipMessage {
            route,
            ..self.clone()
        }
    }

    /// Copy of this message following the planned `path`.
    pub fn with_path(&self, path: Route) -> Self {
        GossipMessage {
            path,
            ..self.clone()
        }
    }

    /// Older than its lifetime plus `slack` at time `now`.
    pub fn is_stale(&self, now: i64, slack: i64) -> bool {
        now > self.timestamp + self.relevancy_time + slack
    }

    pub fn is_response(&self) -> bool {
        self.id.ends_with(RESPONSE_SUFFIX)
    }

    pub fn response_id(id: &str) -> String {
        format!("{}{}", id, RESPONSE_SUFFIX)
    }

    pub fn to_json(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ChainError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let msg = GossipMessage::new(json!({"a": 1}), "bob", "alice", "Ping");
        assert_eq!(msg.relevancy_time, LATENCY_TIME_MS);
        assert_eq!(msg.kind, SW_BROADCAST);
        assert!(msg.route.is_empty());
        assert!(!msg.to_json().unwrap().contains("\"path\""));
        assert_eq!(msg.mutex.len(), 40);
        assert_ne!(msg.mutex, GossipMessage::new(json!(null), "bob", "alice", "Ping").mutex);
    }

    #[test]
    fn test_staleness_includes_slack() {
        let msg = GossipMessage::new(json!(null), "b", "a", "x").with_timestamp(10_000);
        // lifetime 2000 + slack 2000
        assert!(!msg.is_stale(14_000, LATENCY_TIME_MS));
        assert!(msg.is_stale(14_001, LATENCY_TIME_MS));
    }

    #[test]
    fn test_wire_names() {
        let msg = GossipMessage::new(json!("hi"), "b", "a", "x").with_broadcast_id("chan");
        let raw = msg.to_json().unwrap();
        for key in ["\"TTL\"", "\"relevancyTime\"", "\"timestampOfStart\"", "\"broadcastId\"", "\"type\":6"] {
            assert!(raw.contains(key), "missing {} in {}", key, raw);
        }
        assert_eq!(GossipMessage::from_json(&raw).unwrap(), msg);

        let legacy = raw.replace("\"receiver\"", "\"reciver\"");
        assert_eq!(GossipMessage::from_json(&legacy).unwrap().receiver, "b");
    }
}
