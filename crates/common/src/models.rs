use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Consumer class of a stream endpoint, as recorded in the knowledge base
/// and reported by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    Ffmpeg,
    Mjpeg,
    Jpeg,
    Vlc,
    H264,
    Onvif,
    Bubble,
    Hls,
    HttpVideo,
    HttpUnknown,
    #[serde(rename = "MPEG-DASH")]
    MpegDash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rtsp,
    Rtsps,
    Http,
    Https,
    Bubble,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rtsp => "rtsp",
            Protocol::Rtsps => "rtsps",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Bubble => "bubble",
        }
    }

    /// Well-known port used when neither the request nor the database entry
    /// pins one.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http | Protocol::Bubble => 80,
            Protocol::Https => 443,
            Protocol::Rtsp | Protocol::Rtsps => 554,
        }
    }
}

/// A single URL pattern entry for a camera brand.
///
/// `url` is a relative path template, possibly with a query string and
/// placeholders such as `[CHANNEL]` or `[USERNAME]`. `port` of 0 means
/// "derive from the protocol".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraEntry {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub protocol: Protocol,
    #[serde(default)]
    pub port: u16,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A brand record from the knowledge base. One JSON file per brand;
/// `brand_id` always equals the filename stem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub brand: String,
    #[serde(default)]
    pub brand_id: String,
    /// Populated on search results only: the specific model that matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default)]
    pub entries: Vec<CameraEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
}

/// A popular-pattern row: the same shape as [`CameraEntry`] minus the model
/// list, loaded once from `popular_stream_patterns.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPattern {
    pub url: String,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub protocol: Protocol,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_count: Option<u32>,
}

impl StreamPattern {
    pub fn to_entry(&self) -> CameraEntry {
        CameraEntry {
            models: Vec::new(),
            stream_type: self.stream_type,
            protocol: self.protocol,
            port: self.port,
            url: self.url.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// A username/password pair. Both halves are always non-empty; use
/// [`Credentials::from_parts`] to build one from optional request fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Self {
                username: u.to_string(),
                password: p.to_string(),
            }),
            _ => None,
        }
    }
}

/// Fuzzy-search request over the camera knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSearchResponse {
    pub cameras: Vec<Camera>,
    pub total: usize,
    pub returned: usize,
}

/// A request to discover streams on a target host.
///
/// Zero-valued numeric fields mean "unset"; the scanner substitutes its
/// configured defaults before validating ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// IP address, or a full rtsp/http(s) URL to probe directly.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub channel: u8,
    #[serde(default)]
    pub max_streams: usize,
    #[serde(default, rename = "timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub model_limit: usize,
}

impl DiscoveryRequest {
    pub fn credentials(&self) -> Option<Credentials> {
        Credentials::from_parts(self.username.as_deref(), self.password.as_deref())
    }
}

/// A validated (or to-be-validated) stream endpoint. Only `working == true`
/// instances are reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredStream {
    pub url: String,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub protocol: String,
    #[serde(default)]
    pub port: u16,
    pub working: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub has_audio: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub test_time_ms: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, JsonValue>,
}

/// An event pushed into the scan's event sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanStarted {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        max_streams: usize,
        timeout: u64,
    },
    Progress {
        tested: usize,
        found: usize,
        remaining: usize,
    },
    StreamFound {
        stream: DiscoveredStream,
    },
    Complete {
        total_tested: usize,
        total_found: usize,
        duration: f64,
    },
    Error {
        message: String,
    },
    Done,
}

impl ScanEvent {
    /// Stable wire name of the variant, used as the SSE event type.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanEvent::ScanStarted { .. } => "scan_started",
            ScanEvent::Progress { .. } => "progress",
            ScanEvent::StreamFound { .. } => "stream_found",
            ScanEvent::Complete { .. } => "complete",
            ScanEvent::Error { .. } => "error",
            ScanEvent::Done => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_entry_decodes_database_shape() {
        let raw = r#"{
            "models": ["DS-2CD2032", "DS-2CD2132"],
            "type": "FFMPEG",
            "protocol": "rtsp",
            "port": 554,
            "url": "/Streaming/Channels/101",
            "notes": "main stream"
        }"#;
        let entry: CameraEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.stream_type, StreamType::Ffmpeg);
        assert_eq!(entry.protocol, Protocol::Rtsp);
        assert_eq!(entry.port, 554);
        assert_eq!(entry.models.len(), 2);
    }

    #[test]
    fn stream_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&StreamType::HttpVideo).unwrap(),
            "\"HTTP_VIDEO\""
        );
        assert_eq!(
            serde_json::to_string(&StreamType::MpegDash).unwrap(),
            "\"MPEG-DASH\""
        );
        let t: StreamType = serde_json::from_str("\"BUBBLE\"").unwrap();
        assert_eq!(t, StreamType::Bubble);
    }

    #[test]
    fn scan_event_is_tagged_by_type() {
        let event = ScanEvent::Progress {
            tested: 5,
            found: 1,
            remaining: 12,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["tested"], 5);
        assert_eq!(event.kind(), "progress");

        let done = serde_json::to_value(&ScanEvent::Done).unwrap();
        assert_eq!(done["type"], "done");
    }

    #[test]
    fn credentials_require_both_halves() {
        assert!(Credentials::from_parts(Some("admin"), Some("pw")).is_some());
        assert!(Credentials::from_parts(Some("admin"), None).is_none());
        assert!(Credentials::from_parts(Some(""), Some("pw")).is_none());
        assert!(Credentials::from_parts(None, None).is_none());
    }

    #[test]
    fn discovery_request_defaults_are_unset() {
        let req: DiscoveryRequest =
            serde_json::from_str(r#"{"target": "192.168.1.10"}"#).unwrap();
        assert_eq!(req.max_streams, 0);
        assert_eq!(req.timeout_seconds, 0);
        assert_eq!(req.model_limit, 0);
        assert_eq!(req.channel, 0);
        assert!(req.credentials().is_none());
    }
}
