//! Authorization record resolved from the cache or the durable store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One authorization principal, uniquely identified by
/// `{stream_key, client_id, auth_token}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAuthData {
    pub stream_key: String,
    pub client_id: String,
    pub auth_token: String,
    pub is_authorized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StreamAuthData {
    /// A deserialized record with an empty stream key is corrupt and must
    /// not be trusted.
    pub fn is_valid(&self) -> bool {
        !self.stream_key.is_empty()
    }

    /// Whether this record answers the given request identity.
    pub fn matches(&self, stream_key: &str, client_id: &str, auth_token: &str) -> bool {
        self.stream_key == stream_key
            && self.client_id == client_id
            && self.auth_token == auth_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> StreamAuthData {
        StreamAuthData {
            stream_key: "vhost/live/abc".into(),
            client_id: "cli1".into(),
            auth_token: "tok1".into(),
            is_authorized: true,
            expire_time: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn json_round_trip() {
        let data = record();
        let json = serde_json::to_string(&data).unwrap();
        let back: StreamAuthData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn deserializes_without_optional_fields() {
        let json = r#"{"stream_key":"k","client_id":"c","auth_token":"t","is_authorized":false}"#;
        let data: StreamAuthData = serde_json::from_str(json).unwrap();
        assert!(data.metadata.is_empty());
        assert_eq!(data.expire_time, None);
    }

    #[test]
    fn empty_stream_key_is_invalid() {
        let mut data = record();
        assert!(data.is_valid());
        data.stream_key.clear();
        assert!(!data.is_valid());
    }

    #[test]
    fn matches_requires_all_three_fields() {
        let data = record();
        assert!(data.matches("vhost/live/abc", "cli1", "tok1"));
        assert!(!data.matches("vhost/live/abc", "cli1", "other"));
        assert!(!data.matches("vhost/live/abc", "cli2", "tok1"));
        assert!(!data.matches("vhost/live/xyz", "cli1", "tok1"));
    }
}
