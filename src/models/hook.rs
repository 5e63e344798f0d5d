//! Hook envelope decoding and the decision/response types.

use crate::error::HookResult;
use crate::models::stream_task::StreamProtocol;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Lifecycle events the media server reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Publish,
    Play,
    PublishDone,
    PlayDone,
    StreamNoneReader,
    StreamNotFound,
    Unknown,
}

impl HookAction {
    pub fn parse(s: &str) -> HookAction {
        match s {
            "on_publish" => HookAction::Publish,
            "on_play" => HookAction::Play,
            "on_publish_done" => HookAction::PublishDone,
            "on_play_done" => HookAction::PlayDone,
            "on_stream_none_reader" => HookAction::StreamNoneReader,
            _ => HookAction::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HookAction::Publish => "on_publish",
            HookAction::Play => "on_play",
            HookAction::PublishDone => "on_publish_done",
            HookAction::PlayDone => "on_play_done",
            HookAction::StreamNoneReader => "on_stream_none_reader",
            HookAction::StreamNotFound => "on_stream_not_found",
            HookAction::Unknown => "unknown",
        }
    }
}

/// Decoded hook envelope.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub action: HookAction,
    pub protocol: StreamProtocol,
    pub app: String,
    pub stream: String,
    pub vhost: String,
    pub client_id: String,
    pub ip: String,
    pub params: HashMap<String, String>,
}

impl HookRequest {
    /// The authorization-carrying identifier: `vhost + "/" + app + "/" + stream`.
    pub fn stream_key(&self) -> String {
        format!("{}/{}/{}", self.vhost, self.app, self.stream)
    }

    pub fn token(&self) -> String {
        self.params.get("token").cloned().unwrap_or_default()
    }

    /// Decode from an already-parsed JSON body.
    ///
    /// Field defaults follow the media server's conventions: absent `app`
    /// means "live", absent `vhost` means "__defaultVhost__", the schema is
    /// read from `schema` first and `protocol` second. `params` may arrive
    /// either as a URL-encoded query string or as a JSON object; both are
    /// accepted, and a string that parses as a JSON object is treated as one.
    pub fn from_value(body: &Value) -> Option<HookRequest> {
        let obj = body.as_object()?;

        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .map(HookAction::parse)
            .unwrap_or(HookAction::Unknown);

        let schema = obj
            .get("schema")
            .or_else(|| obj.get("protocol"))
            .and_then(Value::as_str)
            .unwrap_or("rtmp");

        let mut req = HookRequest {
            action,
            protocol: StreamProtocol::parse(schema),
            app: str_field(obj, "app", "live"),
            stream: str_field(obj, "stream", ""),
            vhost: str_field(obj, "vhost", "__defaultVhost__"),
            client_id: str_field(obj, "id", ""),
            ip: str_field(obj, "ip", ""),
            params: HashMap::new(),
        };

        match obj.get("params") {
            Some(Value::String(raw)) if !raw.is_empty() => {
                match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(map)) => {
                        for (k, v) in map {
                            if let Value::String(s) = v {
                                req.params.insert(k, s);
                            }
                        }
                    }
                    _ => parse_query_params(raw, &mut req.params),
                }
            }
            Some(Value::Object(map)) => {
                for (k, v) in map {
                    if let Value::String(s) = v {
                        req.params.insert(k.clone(), s.clone());
                    }
                }
            }
            _ => {}
        }

        Some(req)
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str, default: &str) -> String {
    obj.get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

/// Best-effort `k=v&k2=v2` parsing; malformed trailing segments are dropped.
fn parse_query_params(query: &str, out: &mut HashMap<String, String>) {
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if !key.is_empty() {
                out.insert(key.to_string(), value.to_string());
            }
        }
    }
}

/// Protocol-neutral verdict produced by the use-case layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Deny(String),
    /// The request was authorized but a prerequisite (the publisher) is
    /// missing; answered with 503 so the media server retries.
    NotReady(String),
    Defer,
}

impl HookDecision {
    pub fn allow() -> HookDecision {
        HookDecision::Allow
    }

    pub fn deny(reason: impl Into<String>) -> HookDecision {
        HookDecision::Deny(reason.into())
    }

    pub fn to_response(&self) -> HookResponse {
        match self {
            HookDecision::Allow => HookResponse::new(HookResult::Success, "success"),
            HookDecision::Defer => HookResponse::new(HookResult::Timeout, "processing"),
            HookDecision::NotReady(reason) => {
                HookResponse::new(HookResult::ResourceNotReady, reason.clone())
            }
            HookDecision::Deny(reason) => {
                // Token errors, identity expiry and missing-record denials
                // are distinguished from operational failures by the reason
                // text; everything else reports as an internal fault.
                if reason.contains("auth")
                    || reason.contains("Identity")
                    || reason.contains("not found")
                {
                    HookResponse::new(HookResult::AuthDenied, reason.clone())
                } else {
                    HookResponse::new(HookResult::InternalError, reason.clone())
                }
            }
        }
    }
}

/// The wire-level reply: `{"code": <int>, "msg": "<string>"}`.
#[derive(Debug, Clone, Serialize)]
pub struct HookResponse {
    #[serde(skip)]
    pub result: HookResult,
    pub code: i32,
    pub msg: String,
}

impl HookResponse {
    pub fn new(result: HookResult, msg: impl Into<String>) -> HookResponse {
        HookResponse {
            result,
            code: result.code(),
            msg: msg.into(),
        }
    }
}
