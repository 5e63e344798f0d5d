//! Live session model: one publisher or player attached to a stream.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Task role: source of a stream vs consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Publisher,
    Player,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamType::Publisher => "publisher",
            StreamType::Player => "player",
        }
    }

    /// Strict parse: anything other than the two canonical names is invalid.
    pub fn parse(s: &str) -> Option<StreamType> {
        match s {
            "publisher" => Some(StreamType::Publisher),
            "player" => Some(StreamType::Player),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Initializing,
    Active,
    Inactive,
    Error,
    Closed,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Initializing => "initializing",
            StreamState::Active => "active",
            StreamState::Inactive => "inactive",
            StreamState::Error => "error",
            StreamState::Closed => "closed",
        }
    }

    /// Lenient parse: unknown states fall back to the initial state.
    pub fn parse(s: &str) -> StreamState {
        match s {
            "initializing" => StreamState::Initializing,
            "active" => StreamState::Active,
            "inactive" => StreamState::Inactive,
            "error" => StreamState::Error,
            "closed" => StreamState::Closed,
            _ => StreamState::Initializing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamProtocol {
    Rtmp,
    Rtsp,
    Hls,
    HttpFlv,
    HttpTs,
    HttpFmp4,
    WebRtc,
    Srt,
    #[default]
    Unknown,
}

impl StreamProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamProtocol::Rtmp => "rtmp",
            StreamProtocol::Rtsp => "rtsp",
            StreamProtocol::Hls => "hls",
            StreamProtocol::HttpFlv => "http-flv",
            StreamProtocol::HttpTs => "http-ts",
            StreamProtocol::HttpFmp4 => "http-fmp4",
            StreamProtocol::WebRtc => "webrtc",
            StreamProtocol::Srt => "srt",
            StreamProtocol::Unknown => "unknown",
        }
    }

    /// Lenient, case-insensitive parse; unknown schemas map to `Unknown`.
    pub fn parse(s: &str) -> StreamProtocol {
        match s.to_ascii_lowercase().as_str() {
            "rtmp" => StreamProtocol::Rtmp,
            "rtsp" => StreamProtocol::Rtsp,
            "hls" => StreamProtocol::Hls,
            "http-flv" => StreamProtocol::HttpFlv,
            "http-ts" => StreamProtocol::HttpTs,
            "http-fmp4" => StreamProtocol::HttpFmp4,
            "webrtc" => StreamProtocol::WebRtc,
            "srt" => StreamProtocol::Srt,
            _ => StreamProtocol::Unknown,
        }
    }
}

/// A live session registered in shared state.
///
/// Invariants maintained by the state store: at most one active publisher
/// per `stream_name`; every player's `server_ip:server_port` equals the
/// publisher's at the moment of registration; `last_active_time` is
/// non-decreasing under heartbeats.
#[derive(Debug, Clone)]
pub struct StreamTask {
    pub task_id: u64,
    pub stream_name: String,
    pub client_id: String,
    pub task_type: StreamType,
    pub state: StreamState,
    pub protocol: StreamProtocol,
    pub server_ip: String,
    pub server_port: u16,
    pub start_time: DateTime<Utc>,
    pub last_active_time: DateTime<Utc>,
    pub user_id: String,
    pub auth_token: String,
    pub region: Option<String>,
    pub need_transcode: bool,
    pub need_record: bool,
    pub transcoding_profile: String,
}

impl StreamTask {
    pub fn is_timed_out(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let idle_ms = now.timestamp_millis() - self.last_active_time.timestamp_millis();
        idle_ms > timeout.as_millis() as i64
    }

    pub fn duration_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_time).num_seconds().max(0)
    }
}
