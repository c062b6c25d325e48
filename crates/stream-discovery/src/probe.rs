use anyhow::{Context, Result};
use async_trait::async_trait;
use common::models::{Credentials, StreamType};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("camscout/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// How much of an HTTP body is sampled for magic bytes and MJPEG
/// boundaries.
const SAMPLE_BYTES: usize = 512;

/// URL path fragments cameras use for still images even when they
/// misreport the Content-Type.
const JPEG_PATH_HINTS: &[&str] = &[
    ".jpg", ".jpeg", "snapshot", "image", "picture", "snap", "photo", "capture",
];

/// Outcome of probing a single candidate URL.
#[derive(Debug, Clone, Default)]
pub struct TestResult {
    pub url: String,
    pub working: bool,
    pub protocol: String,
    pub stream_type: Option<StreamType>,
    pub resolution: Option<String>,
    pub codec: Option<String>,
    pub fps: Option<u32>,
    pub bitrate: Option<u64>,
    pub has_audio: bool,
    pub error: Option<String>,
    pub test_time: Duration,
    pub metadata: HashMap<String, JsonValue>,
}

/// The probing seam the scanner depends on; lets tests substitute a mock
/// for the real network/ffprobe-backed implementation.
#[async_trait]
pub trait StreamTester: Send + Sync {
    /// Classify the transport behind `url` and confirm it serves media.
    /// `auth` carries credentials for candidates whose URL is deliberately
    /// kept clean (HTTP snapshot fallbacks); URL-embedded userinfo wins.
    async fn probe(&self, url: &str, auth: Option<&Credentials>) -> TestResult;

    /// Whether the external media-probing tool is on PATH.
    async fn media_tool_available(&self) -> bool;
}

/// Validates candidate URLs: RTSP through `ffprobe`, HTTP by fetching and
/// classifying the response.
pub struct StreamProbe {
    http: reqwest::Client,
    ffprobe_timeout: Duration,
}

impl StreamProbe {
    pub fn new(ffprobe_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to create HTTP client")?;
        Ok(Self {
            http,
            ffprobe_timeout,
        })
    }

    async fn probe_rtsp(&self, url: &str, result: &mut TestResult) {
        debug!(url = %url, "testing RTSP stream");

        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
                "-rtsp_transport",
                "tcp",
                url,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match timeout(self.ffprobe_timeout, output).await {
            Err(_) => {
                result.error = Some("timeout while testing stream".to_string());
                return;
            }
            Ok(Err(e)) => {
                result.error = Some(format!("ffprobe failed: {e}"));
                return;
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.trim();
            result.error = if tail.is_empty() {
                Some(format!("ffprobe failed: {}", output.status))
            } else {
                Some(format!(
                    "ffprobe failed: {} (stderr: {})",
                    output.status,
                    truncate_tail(tail, 200)
                ))
            };
            return;
        }

        let report: FfprobeReport = match serde_json::from_slice(&output.stdout) {
            Ok(report) => report,
            Err(e) => {
                result.error = Some(format!("failed to parse ffprobe output: {e}"));
                return;
            }
        };

        apply_ffprobe_report(&report, result);
        result.stream_type = Some(StreamType::Ffmpeg);
        if !result.working {
            result.error = Some("no streams found".to_string());
        }
    }

    async fn probe_http(&self, parsed: Url, auth: Option<&Credentials>, result: &mut TestResult) {
        let mut request_url = parsed;
        let mut basic = None;
        if !request_url.username().is_empty() {
            basic = Credentials::from_parts(
                Some(request_url.username()),
                request_url.password().or(Some("")),
            );
            // Keep the requested URL (and anything logged from it) clean.
            let _ = request_url.set_username("");
            let _ = request_url.set_password(None);
        }
        if basic.is_none() {
            basic = auth.cloned();
        }

        debug!(url = %request_url, "testing HTTP stream");

        let mut request = self.http.get(request_url.clone());
        if let Some(creds) = &basic {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                result.error = Some(format!("HTTP request failed: {e}"));
                return;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            result.error = if status == reqwest::StatusCode::UNAUTHORIZED {
                Some("authentication required".to_string())
            } else {
                Some(format!("HTTP {status}"))
            };
            return;
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        result
            .metadata
            .insert("content_type".to_string(), json!(content_type));

        let mut sample = Vec::with_capacity(SAMPLE_BYTES);
        while sample.len() < SAMPLE_BYTES {
            match response.chunk().await {
                Ok(Some(chunk)) => sample.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        sample.truncate(SAMPLE_BYTES);

        let path = request_url.path().to_lowercase();
        classify_http(&path, &content_type, &sample, result);

        if result.working && result.stream_type == Some(StreamType::HttpVideo) {
            self.enrich_http_video(request_url.as_str(), result).await;
        }
    }

    /// Best-effort ffprobe pass over an HTTP video stream for resolution
    /// and codec; failures leave the result as classified.
    async fn enrich_http_video(&self, url: &str, result: &mut TestResult) {
        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", url])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let Ok(Ok(output)) = timeout(self.ffprobe_timeout, output).await else {
            return;
        };
        if !output.status.success() {
            return;
        }
        if let Ok(report) = serde_json::from_slice::<FfprobeReport>(&output.stdout) {
            for stream in &report.streams {
                if stream.codec_type.as_deref() == Some("video") {
                    result.codec = stream.codec_name.clone();
                    if let (Some(w), Some(h)) = (stream.width, stream.height) {
                        result.resolution = Some(format!("{w}x{h}"));
                    }
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StreamTester for StreamProbe {
    async fn probe(&self, url: &str, auth: Option<&Credentials>) -> TestResult {
        let started = Instant::now();
        let mut result = TestResult {
            url: url.to_string(),
            ..Default::default()
        };

        match Url::parse(url) {
            Err(e) => result.error = Some(format!("invalid URL: {e}")),
            Ok(parsed) => {
                let scheme = parsed.scheme().to_string();
                result.protocol = scheme.clone();
                match scheme.as_str() {
                    "rtsp" | "rtsps" => self.probe_rtsp(url, &mut result).await,
                    "http" | "https" => self.probe_http(parsed, auth, &mut result).await,
                    other => {
                        result.error = Some(format!("unsupported protocol: {other}"));
                    }
                }
            }
        }

        result.test_time = started.elapsed();
        result
    }

    async fn media_tool_available(&self) -> bool {
        match Command::new("ffprobe")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }
}

/// Decide what a 200 response actually serves. Cameras routinely misreport
/// Content-Type, so the ladder consults magic bytes and the URL path too.
fn classify_http(path: &str, content_type: &str, sample: &[u8], result: &mut TestResult) {
    let has_jpeg_magic = sample.len() >= 3 && sample[0] == 0xFF && sample[1] == 0xD8 && sample[2] == 0xFF;
    let has_boundary = sample.windows(2).any(|w| w == b"--");

    // 1. Multipart content type means MJPEG, if a boundary shows up.
    if content_type.contains("multipart") {
        result.stream_type = Some(StreamType::Mjpeg);
        result.working = has_boundary;
        if !has_boundary {
            result.error = Some("no MJPEG boundary found".to_string());
        }
        return;
    }

    // 2. JPEG magic bytes; a boundary in the same sample means a frame
    // stream rather than a still.
    if has_jpeg_magic {
        result.stream_type = Some(if has_boundary {
            StreamType::Mjpeg
        } else {
            StreamType::Jpeg
        });
        result.working = true;
        return;
    }

    // 3. Honest image content types.
    if content_type.contains("image/jpeg") || content_type.contains("image/jpg") {
        result.stream_type = Some(StreamType::Jpeg);
        result.working = true;
        return;
    }

    // 4. URL path hints for cameras with a wrong Content-Type.
    if JPEG_PATH_HINTS.iter().any(|hint| path.contains(hint)) {
        result.stream_type = Some(StreamType::Jpeg);
        result.working = true;
        result
            .metadata
            .insert("detection_method".to_string(), json!("url_pattern"));
        return;
    }

    // 5. MJPEG by extension.
    if path.contains(".mjpg") || path.contains(".mjpeg") {
        result.stream_type = Some(StreamType::Mjpeg);
        result.working = true;
        return;
    }

    // 6. HLS playlists.
    if path.contains(".m3u8")
        || content_type.contains("application/vnd.apple.mpegurl")
        || content_type.contains("application/x-mpegurl")
    {
        result.stream_type = Some(StreamType::Hls);
        result.working = true;
        return;
    }

    // 7. MPEG-DASH manifests.
    if path.contains(".mpd") || content_type.contains("application/dash+xml") {
        result.stream_type = Some(StreamType::MpegDash);
        result.working = true;
        return;
    }

    // 8. Any declared video payload.
    if content_type.contains("video") {
        result.stream_type = Some(StreamType::HttpVideo);
        result.working = true;
        return;
    }

    // 9. A login page is not a stream.
    if content_type.contains("text/html") || content_type.contains("text/plain") {
        result.working = false;
        result.error = Some("web interface, not a video stream".to_string());
        return;
    }

    // 10. Tolerant fallback: 200 with an unrecognized payload.
    result.stream_type = Some(StreamType::HttpUnknown);
    result.working = true;
    result.metadata.insert(
        "note".to_string(),
        json!("unknown content type, may still be valid"),
    );
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeReport {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeStream {
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    bit_rate: Option<String>,
}

fn apply_ffprobe_report(report: &FfprobeReport, result: &mut TestResult) {
    result.working = !report.streams.is_empty();

    for stream in &report.streams {
        match stream.codec_type.as_deref() {
            Some("video") if result.codec.is_none() => {
                result.codec = stream.codec_name.clone();
                if let (Some(w), Some(h)) = (stream.width, stream.height) {
                    result.resolution = Some(format!("{w}x{h}"));
                }
                if let Some(rate) = stream.avg_frame_rate.as_deref() {
                    result.fps = parse_frame_rate(rate);
                }
                if let Some(rate) = stream.bit_rate.as_deref() {
                    result.bitrate = rate.parse().ok();
                }
            }
            Some("audio") => result.has_audio = true,
            _ => {}
        }
    }

    if result.bitrate.is_none() {
        if let Some(rate) = report.format.bit_rate.as_deref() {
            result.bitrate = rate.parse().ok();
        }
    }
}

/// ffprobe reports frame rates as a `num/den` fraction.
fn parse_frame_rate(raw: &str) -> Option<u32> {
    let (num, den) = raw.split_once('/')?;
    let num: u32 = num.parse().ok()?;
    let den: u32 = den.parse().ok()?;
    if den == 0 {
        return None;
    }
    Some(num / den)
}

fn truncate_tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let start = text.len() - max;
    // Stay on a char boundary.
    match text.char_indices().find(|(i, _)| *i >= start) {
        Some((i, _)) => &text[i..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(path: &str, content_type: &str, sample: &[u8]) -> TestResult {
        let mut result = TestResult::default();
        classify_http(path, content_type, sample, &mut result);
        result
    }

    #[test]
    fn multipart_content_type_needs_boundary() {
        let ok = classified(
            "/video",
            "multipart/x-mixed-replace; boundary=frame",
            b"--frame\r\nContent-Type: image/jpeg",
        );
        assert_eq!(ok.stream_type, Some(StreamType::Mjpeg));
        assert!(ok.working);

        let bad = classified("/video", "multipart/x-mixed-replace", b"nothing here");
        assert!(!bad.working);
        assert_eq!(bad.error.as_deref(), Some("no MJPEG boundary found"));
    }

    #[test]
    fn jpeg_magic_beats_content_type() {
        let still = classified("/grab", "application/octet-stream", &[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(still.stream_type, Some(StreamType::Jpeg));
        assert!(still.working);

        // Magic bytes plus a boundary marker means a frame stream.
        let mut sample = vec![0xFF, 0xD8, 0xFF];
        sample.extend_from_slice(b"...--boundary...");
        let stream = classified("/grab", "application/octet-stream", &sample);
        assert_eq!(stream.stream_type, Some(StreamType::Mjpeg));
    }

    #[test]
    fn jpeg_by_url_pattern_records_detection_method() {
        let result = classified("/cgi-bin/snapshot.cgi", "application/octet-stream", b"airy");
        assert_eq!(result.stream_type, Some(StreamType::Jpeg));
        assert!(result.working);
        assert_eq!(result.metadata["detection_method"], "url_pattern");
    }

    #[test]
    fn playlist_and_manifest_types() {
        let hls = classified("/live/index.m3u8", "", b"#EXTM3U");
        assert_eq!(hls.stream_type, Some(StreamType::Hls));

        let hls_by_type = classified("/live", "application/vnd.apple.mpegurl", b"#EXTM3U");
        assert_eq!(hls_by_type.stream_type, Some(StreamType::Hls));

        let dash = classified("/live/manifest.mpd", "application/dash+xml", b"<MPD");
        assert_eq!(dash.stream_type, Some(StreamType::MpegDash));
    }

    #[test]
    fn html_body_is_not_a_stream() {
        let result = classified("/", "text/html; charset=utf-8", b"<html>login</html>");
        assert!(!result.working);
        assert_eq!(
            result.error.as_deref(),
            Some("web interface, not a video stream")
        );
    }

    #[test]
    fn unknown_content_passes_with_note() {
        let result = classified("/blob", "application/x-something", b"????");
        assert_eq!(result.stream_type, Some(StreamType::HttpUnknown));
        assert!(result.working);
        assert!(result.metadata.contains_key("note"));
    }

    #[test]
    fn video_content_type_is_http_video() {
        let result = classified("/media", "video/mp4", b"\x00\x00\x00\x18ftyp");
        assert_eq!(result.stream_type, Some(StreamType::HttpVideo));
        assert!(result.working);
    }

    #[test]
    fn ffprobe_report_extraction() {
        let raw = r#"{
            "streams": [
                {"codec_name": "h264", "codec_type": "video", "width": 1920,
                 "height": 1080, "avg_frame_rate": "25/1", "bit_rate": "4096000"},
                {"codec_name": "aac", "codec_type": "audio"}
            ],
            "format": {"bit_rate": "4300000"}
        }"#;
        let report: FfprobeReport = serde_json::from_str(raw).unwrap();
        let mut result = TestResult::default();
        apply_ffprobe_report(&report, &mut result);

        assert!(result.working);
        assert_eq!(result.codec.as_deref(), Some("h264"));
        assert_eq!(result.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(result.fps, Some(25));
        assert_eq!(result.bitrate, Some(4_096_000));
        assert!(result.has_audio);
    }

    #[test]
    fn ffprobe_bitrate_falls_back_to_format() {
        let raw = r#"{
            "streams": [{"codec_name": "hevc", "codec_type": "video",
                         "width": 640, "height": 360, "avg_frame_rate": "30000/1001"}],
            "format": {"bit_rate": "768000"}
        }"#;
        let report: FfprobeReport = serde_json::from_str(raw).unwrap();
        let mut result = TestResult::default();
        apply_ffprobe_report(&report, &mut result);

        assert_eq!(result.fps, Some(29));
        assert_eq!(result.bitrate, Some(768_000));
        assert!(!result.has_audio);
    }

    #[test]
    fn empty_report_is_not_working() {
        let report: FfprobeReport = serde_json::from_str(r#"{"streams": []}"#).unwrap();
        let mut result = TestResult::default();
        apply_ffprobe_report(&report, &mut result);
        assert!(!result.working);
    }

    #[test]
    fn frame_rate_fraction_parsing() {
        assert_eq!(parse_frame_rate("25/1"), Some(25));
        assert_eq!(parse_frame_rate("30000/1001"), Some(29));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("nonsense"), None);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected_without_network() {
        let probe = StreamProbe::new(Duration::from_secs(1)).unwrap();
        let result = probe.probe("ftp://192.168.1.5/stream", None).await;
        assert!(!result.working);
        assert_eq!(result.error.as_deref(), Some("unsupported protocol: ftp"));
        assert_eq!(result.protocol, "ftp");
    }

    #[tokio::test]
    async fn invalid_url_is_an_error() {
        let probe = StreamProbe::new(Duration::from_secs(1)).unwrap();
        let result = probe.probe("not a url", None).await;
        assert!(!result.working);
        assert!(result.error.unwrap().starts_with("invalid URL"));
    }
}
