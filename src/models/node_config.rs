//! Backend node inventory with per-category round-robin selection.

use crate::models::stream_task::StreamProtocol;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
}

/// Protocol families routed to distinct backend clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCategory {
    RtmpSrt,
    HttpHls,
    WebRtc,
}

impl NodeCategory {
    pub fn for_protocol(protocol: StreamProtocol) -> NodeCategory {
        match protocol {
            StreamProtocol::Rtmp | StreamProtocol::Srt => NodeCategory::RtmpSrt,
            StreamProtocol::WebRtc => NodeCategory::WebRtc,
            _ => NodeCategory::HttpHls,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            NodeCategory::RtmpSrt => "rtmp_srt",
            NodeCategory::HttpHls => "http_hls",
            NodeCategory::WebRtc => "webrtc",
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid nodes file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("validation failed for {context}: {reason}")]
    Validation { context: String, reason: String },
}

#[derive(Debug, Default, Deserialize)]
struct NodeFile {
    #[serde(default)]
    rtmp_srt: Vec<NodeEndpoint>,
    #[serde(default)]
    http_hls: Vec<NodeEndpoint>,
    #[serde(default)]
    webrtc: Vec<NodeEndpoint>,
}

/// Three disjoint ordered endpoint lists, each with its own rotation cursor.
#[derive(Debug, Default)]
pub struct NodeConfig {
    rtmp_srt: Vec<NodeEndpoint>,
    http_hls: Vec<NodeEndpoint>,
    webrtc: Vec<NodeEndpoint>,
    rr_rtmp: AtomicUsize,
    rr_http: AtomicUsize,
    rr_webrtc: AtomicUsize,
}

impl NodeConfig {
    pub fn new(
        rtmp_srt: Vec<NodeEndpoint>,
        http_hls: Vec<NodeEndpoint>,
        webrtc: Vec<NodeEndpoint>,
    ) -> NodeConfig {
        NodeConfig {
            rtmp_srt,
            http_hls,
            webrtc,
            ..NodeConfig::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<NodeConfig, NodeConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| NodeConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let file: NodeFile = serde_json::from_str(&raw)?;
        let config = NodeConfig::new(file.rtmp_srt, file.http_hls, file.webrtc);

        validate_group(&config.rtmp_srt, "rtmp_srt")?;
        validate_group(&config.http_hls, "http_hls")?;
        validate_group(&config.webrtc, "webrtc")?;

        info!(
            endpoints = config.rtmp_srt.len() + config.http_hls.len() + config.webrtc.len(),
            "node configuration loaded"
        );
        Ok(config)
    }

    fn endpoints(&self, category: NodeCategory) -> &[NodeEndpoint] {
        match category {
            NodeCategory::RtmpSrt => &self.rtmp_srt,
            NodeCategory::HttpHls => &self.http_hls,
            NodeCategory::WebRtc => &self.webrtc,
        }
    }

    fn cursor(&self, category: NodeCategory) -> &AtomicUsize {
        match category {
            NodeCategory::RtmpSrt => &self.rr_rtmp,
            NodeCategory::HttpHls => &self.rr_http,
            NodeCategory::WebRtc => &self.rr_webrtc,
        }
    }

    /// Next endpoint for the category, rotating through the configured list.
    /// Returns `None` when the category is empty; the caller decides the
    /// fallback policy.
    pub fn round_robin(&self, category: NodeCategory) -> Option<NodeEndpoint> {
        let endpoints = self.endpoints(category);
        if endpoints.is_empty() {
            return None;
        }
        let idx = self.cursor(category).fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Some(endpoints[idx].clone())
    }
}

fn validate_group(endpoints: &[NodeEndpoint], name: &str) -> Result<(), NodeConfigError> {
    for (i, ep) in endpoints.iter().enumerate() {
        let context = format!("{}[{}]({})", name, i, ep.host);

        if ep.host.is_empty() || ep.host == "0.0.0.0" {
            return Err(NodeConfigError::Validation {
                context,
                reason: "invalid or unsafe host".into(),
            });
        }
        if ep.port == 0 {
            return Err(NodeConfigError::Validation {
                context,
                reason: "port out of range".into(),
            });
        }
        if name == "rtmp_srt" && ep.port == 80 {
            warn!(%context, "port 80 configured for an RTMP/SRT node");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str, port: u16) -> NodeEndpoint {
        NodeEndpoint {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn protocol_routes_to_category() {
        assert_eq!(
            NodeCategory::for_protocol(StreamProtocol::Rtmp),
            NodeCategory::RtmpSrt
        );
        assert_eq!(
            NodeCategory::for_protocol(StreamProtocol::Srt),
            NodeCategory::RtmpSrt
        );
        assert_eq!(
            NodeCategory::for_protocol(StreamProtocol::WebRtc),
            NodeCategory::WebRtc
        );
        assert_eq!(
            NodeCategory::for_protocol(StreamProtocol::Hls),
            NodeCategory::HttpHls
        );
        assert_eq!(
            NodeCategory::for_protocol(StreamProtocol::Unknown),
            NodeCategory::HttpHls
        );
    }

    #[test]
    fn round_robin_rotates_within_category() {
        let config = NodeConfig::new(
            vec![ep("10.0.0.1", 1935), ep("10.0.0.2", 1935)],
            vec![ep("10.0.1.1", 8080)],
            vec![],
        );

        assert_eq!(
            config.round_robin(NodeCategory::RtmpSrt),
            Some(ep("10.0.0.1", 1935))
        );
        assert_eq!(
            config.round_robin(NodeCategory::RtmpSrt),
            Some(ep("10.0.0.2", 1935))
        );
        assert_eq!(
            config.round_robin(NodeCategory::RtmpSrt),
            Some(ep("10.0.0.1", 1935))
        );

        // Each category rotates independently.
        assert_eq!(
            config.round_robin(NodeCategory::HttpHls),
            Some(ep("10.0.1.1", 8080))
        );
    }

    #[test]
    fn empty_category_yields_none() {
        let config = NodeConfig::default();
        assert_eq!(config.round_robin(NodeCategory::WebRtc), None);
    }

    #[test]
    fn from_json_file_parses_all_categories() {
        let path = std::env::temp_dir().join("streamgate_nodes_test.json");
        std::fs::write(
            &path,
            r#"{"rtmp_srt":[{"host":"10.0.0.1","port":1935}],
                "http_hls":[{"host":"10.0.1.1","port":8080}],
                "webrtc":[{"host":"10.0.2.1","port":8000}]}"#,
        )
        .unwrap();

        let config = NodeConfig::from_json_file(&path).unwrap();
        assert_eq!(
            config.round_robin(NodeCategory::WebRtc),
            Some(ep("10.0.2.1", 8000))
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn validation_rejects_wildcard_host() {
        let path = std::env::temp_dir().join("streamgate_nodes_invalid.json");
        std::fs::write(&path, r#"{"rtmp_srt":[{"host":"0.0.0.0","port":1935}]}"#).unwrap();

        let err = NodeConfig::from_json_file(&path).unwrap_err();
        assert!(matches!(err, NodeConfigError::Validation { .. }));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = NodeConfig::from_json_file("/nonexistent/nodes.json").unwrap_err();
        assert!(matches!(err, NodeConfigError::Io { .. }));
    }
}
