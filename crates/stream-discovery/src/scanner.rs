use anyhow::{anyhow, Result};
use camera_db::{Loader, SearchEngine};
use common::models::{
    Credentials, DiscoveredStream, DiscoveryRequest, ScanEvent, StreamType,
};
use common::validation::validate_discovery_request;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::builder::{BuildContext, UrlBuilder};
use crate::onvif::DeviceDiscovery;
use crate::probe::{StreamTester, TestResult};
use crate::sink::EventSink;

/// How often the progress ticker fires.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Grace period before returning, so the sink can flush its transport.
const FLUSH_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Bounded worker pool size; unbounded spawning would exhaust file
    /// descriptors against slow cameras.
    pub worker_pool_size: usize,
    pub default_timeout: Duration,
    pub max_streams: usize,
    pub model_search_limit: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 20,
            default_timeout: Duration::from_secs(240),
            max_streams: 10,
            model_search_limit: 6,
        }
    }
}

/// Final tally of one scan. The same counts flow through the sink as a
/// `Complete` event.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub streams: Vec<DiscoveredStream>,
    pub total_tested: usize,
    pub total_found: usize,
    pub duration: Duration,
}

/// One candidate URL awaiting a probe. ONVIF device-service endpoints
/// arrive pre-validated and bypass probing entirely.
struct Candidate {
    url: String,
    auth: Option<Credentials>,
    prevalidated: Option<DiscoveredStream>,
}

/// Orchestrates a discovery scan: collects candidate URLs from the
/// knowledge base, model search, and ONVIF interrogation, then probes them
/// through a bounded worker pool, reporting progressively into the sink.
pub struct Scanner {
    loader: Arc<Loader>,
    search: Arc<SearchEngine>,
    builder: UrlBuilder,
    onvif: Arc<dyn DeviceDiscovery>,
    tester: Arc<dyn StreamTester>,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(
        loader: Arc<Loader>,
        search: Arc<SearchEngine>,
        builder: UrlBuilder,
        onvif: Arc<dyn DeviceDiscovery>,
        tester: Arc<dyn StreamTester>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            loader,
            search,
            builder,
            onvif,
            tester,
            config,
        }
    }

    /// Run one scan to completion. The returned result carries the same
    /// streams the sink saw as `StreamFound` events. `cancel` lets the
    /// caller abort early; the deadline and the max-streams cap cancel
    /// internally. All child tasks are gone when this returns.
    pub async fn scan(
        &self,
        request: DiscoveryRequest,
        sink: Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        let started = Instant::now();

        if let Err(e) = validate_discovery_request(&request) {
            sink.send(ScanEvent::Error {
                message: e.to_string(),
            })
            .await;
            return Err(e);
        }

        let mut request = request;
        if request.max_streams == 0 {
            request.max_streams = self.config.max_streams;
        }
        if request.timeout_seconds == 0 {
            request.timeout_seconds = self.config.default_timeout.as_secs();
        }
        if request.model_limit == 0 {
            request.model_limit = self.config.model_search_limit;
        }

        info!(
            target = %request.target,
            model = ?request.model,
            timeout = request.timeout_seconds,
            max_streams = request.max_streams,
            "starting stream discovery"
        );

        if !self.tester.media_tool_available().await {
            warn!("ffprobe not found in PATH; RTSP candidates will all fail");
        }

        // Child token: the deadline and the max-streams cap cancel it
        // without touching the caller's token.
        let cancel = cancel.child_token();
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(request.timeout_seconds);
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            });
        }

        sink.send(ScanEvent::ScanStarted {
            target: request.target.clone(),
            model: request.model.clone(),
            max_streams: request.max_streams,
            timeout: request.timeout_seconds,
        })
        .await;

        let result = if is_direct_stream_url(&request.target) {
            self.scan_direct(&request, &sink).await
        } else {
            self.scan_host(&request, &sink, &cancel).await
        };
        cancel.cancel();

        let mut result = match result {
            Ok(result) => result,
            Err(e) => {
                sink.send(ScanEvent::Error {
                    message: e.to_string(),
                })
                .await;
                return Err(e);
            }
        };
        result.duration = started.elapsed();

        sink.send(ScanEvent::Complete {
            total_tested: result.total_tested,
            total_found: result.total_found,
            duration: result.duration.as_secs_f64(),
        })
        .await;
        sink.send(ScanEvent::Done).await;
        tokio::time::sleep(FLUSH_GRACE).await;

        info!(
            tested = result.total_tested,
            found = result.total_found,
            duration_ms = result.duration.as_millis() as u64,
            "stream discovery completed"
        );
        Ok(result)
    }

    /// Phase 0: the target already is a stream URL, so probe just it.
    async fn scan_direct(
        &self,
        request: &DiscoveryRequest,
        sink: &Arc<dyn EventSink>,
    ) -> Result<ScanResult> {
        debug!(url = %request.target, "testing direct stream URL");

        let auth = request.credentials();
        let test = self.tester.probe(&request.target, auth.as_ref()).await;

        let mut result = ScanResult {
            total_tested: 1,
            ..Default::default()
        };
        if test.working {
            let stream = to_discovered(test);
            sink.send(ScanEvent::StreamFound {
                stream: stream.clone(),
            })
            .await;
            result.streams.push(stream);
            result.total_found = 1;
        } else {
            let message = test
                .error
                .unwrap_or_else(|| "stream test failed".to_string());
            debug!(url = %request.target, error = %message, "direct stream test failed");
            sink.send(ScanEvent::Error { message }).await;
        }
        Ok(result)
    }

    /// Phases 1 and 2 for a host target: collect candidates, then probe
    /// them concurrently.
    async fn scan_host(
        &self,
        request: &DiscoveryRequest,
        sink: &Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> Result<ScanResult> {
        let ip = extract_host(&request.target);
        if ip.is_empty() {
            return Err(anyhow!("invalid target: {}", request.target));
        }

        let candidates = self.collect_candidates(request, &ip).await;
        sink.send(ScanEvent::Progress {
            tested: 0,
            found: 0,
            remaining: candidates.len(),
        })
        .await;

        Ok(self
            .probe_candidates(request, candidates, sink, cancel)
            .await)
    }

    /// Phase 1: gather candidate URLs from the ONVIF prober, the model
    /// search, and the popular-pattern table, deduplicating by exact
    /// string equality as they are added. Auth variants are deliberately
    /// distinct candidates: cameras accept different auth conventions.
    async fn collect_candidates(&self, request: &DiscoveryRequest, ip: &str) -> Vec<Candidate> {
        let creds = request.credentials();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Source 1: ONVIF profiles plus the common fallback paths.
        let discovered = self.onvif.discover_streams(ip, creds.as_ref()).await;
        let onvif_count = discovered.len();
        for stream in discovered {
            if !seen.insert(stream.url.clone()) {
                continue;
            }
            let auth = metadata_credentials(&stream);
            candidates.push(Candidate {
                url: stream.url.clone(),
                auth,
                prevalidated: stream.working.then_some(stream),
            });
        }

        let ctx = BuildContext {
            ip: ip.to_string(),
            username: request.username.clone(),
            password: request.password.clone(),
            channel: request.channel as u32,
            ..Default::default()
        };

        // Source 2: model-specific patterns, fully expanded into auth
        // variants.
        let mut model_count = 0;
        if let Some(model) = request.model.as_deref().filter(|m| !m.is_empty()) {
            match self
                .search
                .search_by_model(model, 0.8, request.model_limit)
                .await
            {
                Err(e) => error!(error = %e, "model search failed"),
                Ok(cameras) => {
                    for camera in &cameras {
                        for entry in &camera.entries {
                            for url in self.builder.build_urls(entry, &ctx) {
                                if seen.insert(url.clone()) {
                                    candidates.push(Candidate {
                                        url,
                                        auth: None,
                                        prevalidated: None,
                                    });
                                    model_count += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        // Source 3: popular patterns, expanded exactly like model patterns
        // so bubble entries get their HTTP translation and HTTP entries
        // their auth variants.
        let mut popular_count = 0;
        match self.loader.load_popular_patterns().await {
            Err(e) => error!(error = %e, "failed to load popular patterns"),
            Ok(patterns) => {
                for pattern in patterns.iter() {
                    let entry = pattern.to_entry();
                    for url in self.builder.build_urls(&entry, &ctx) {
                        if seen.insert(url.clone()) {
                            candidates.push(Candidate {
                                url,
                                auth: None,
                                prevalidated: None,
                            });
                            popular_count += 1;
                        }
                    }
                }
            }
        }

        info!(
            total = candidates.len(),
            from_onvif = onvif_count,
            from_model = model_count,
            from_popular = popular_count,
            "collected candidate URLs"
        );
        candidates
    }

    /// Phase 2: bounded concurrent probing with progressive reporting.
    async fn probe_candidates(
        &self,
        request: &DiscoveryRequest,
        candidates: Vec<Candidate>,
        sink: &Arc<dyn EventSink>,
        cancel: &CancellationToken,
    ) -> ScanResult {
        let total = candidates.len();
        let max_streams = request.max_streams;
        let tested = Arc::new(AtomicUsize::new(0));
        let found = Arc::new(AtomicUsize::new(0));
        let (stream_tx, mut stream_rx) = mpsc::channel::<DiscoveredStream>(100);

        // Collector: every found stream is reported the moment it lands,
        // followed by an immediate progress update.
        let collector = {
            let sink = sink.clone();
            let tested = tested.clone();
            let found = found.clone();
            tokio::spawn(async move {
                let mut streams = Vec::new();
                while let Some(stream) = stream_rx.recv().await {
                    sink.send(ScanEvent::StreamFound {
                        stream: stream.clone(),
                    })
                    .await;
                    let t = tested.load(Ordering::Relaxed);
                    sink.send(ScanEvent::Progress {
                        tested: t,
                        found: found.load(Ordering::Relaxed),
                        remaining: total.saturating_sub(t),
                    })
                    .await;
                    streams.push(stream);
                }
                streams
            })
        };

        // Periodic progress, sent only when `tested` advanced.
        let ticker = {
            let sink = sink.clone();
            let tested = tested.clone();
            let found = found.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PROGRESS_INTERVAL);
                interval.tick().await;
                let mut last = 0;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = interval.tick() => {
                            let t = tested.load(Ordering::Relaxed);
                            if t != last {
                                sink.send(ScanEvent::Progress {
                                    tested: t,
                                    found: found.load(Ordering::Relaxed),
                                    remaining: total.saturating_sub(t),
                                })
                                .await;
                                last = t;
                            }
                        }
                    }
                }
            })
        };

        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size));
        let mut workers = JoinSet::new();

        for candidate in candidates {
            if cancel.is_cancelled() || found.load(Ordering::Relaxed) >= max_streams {
                break;
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            };

            let tester = self.tester.clone();
            let tested = tested.clone();
            let found = found.clone();
            let cancel = cancel.clone();
            let stream_tx = stream_tx.clone();
            workers.spawn(async move {
                let _permit = permit;

                // Pre-validated ONVIF device-service entries skip the probe.
                if let Some(stream) = candidate.prevalidated {
                    tested.fetch_add(1, Ordering::Relaxed);
                    if claim_found_slot(&found, max_streams) {
                        let _ = stream_tx.send(stream).await;
                        if found.load(Ordering::Relaxed) >= max_streams {
                            cancel.cancel();
                        }
                    }
                    return;
                }

                let result = tokio::select! {
                    _ = cancel.cancelled() => {
                        // Deadline or cap hit mid-probe; the dropped future
                        // aborts its request / kills its subprocess.
                        tested.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    result = tester.probe(&candidate.url, candidate.auth.as_ref()) => result,
                };
                tested.fetch_add(1, Ordering::Relaxed);

                if result.working {
                    if claim_found_slot(&found, max_streams) {
                        let _ = stream_tx.send(to_discovered(result)).await;
                        if found.load(Ordering::Relaxed) >= max_streams {
                            cancel.cancel();
                        }
                    }
                } else {
                    debug!(
                        url = %candidate.url,
                        error = ?result.error,
                        "stream test failed"
                    );
                }
            });
        }

        while workers.join_next().await.is_some() {}
        drop(stream_tx);

        let streams = collector.await.unwrap_or_default();
        ticker.abort();

        ScanResult {
            streams,
            total_tested: tested.load(Ordering::Relaxed),
            total_found: found.load(Ordering::Relaxed),
            duration: Duration::ZERO,
        }
    }
}

/// Reserve one of the `max` result slots; keeps `found` from ever
/// exceeding the cap even when several workers succeed at once.
fn claim_found_slot(found: &AtomicUsize, max: usize) -> bool {
    found
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current < max).then_some(current + 1)
        })
        .is_ok()
}

fn is_direct_stream_url(target: &str) -> bool {
    match Url::parse(target) {
        Ok(url) => matches!(url.scheme(), "rtsp" | "http" | "https"),
        Err(_) => false,
    }
}

/// Pull the bare host out of a target that may carry a scheme or port.
fn extract_host(target: &str) -> String {
    if let Ok(url) = Url::parse(target) {
        if let Some(host) = url.host_str() {
            return host.to_string();
        }
    }
    // Bracketed IPv6 stays as-is.
    if target.ends_with(']') {
        return target.to_string();
    }
    match target.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            host.to_string()
        }
        _ => target.to_string(),
    }
}

fn metadata_credentials(stream: &DiscoveredStream) -> Option<Credentials> {
    let username = stream.metadata.get("username")?.as_str()?;
    let password = stream.metadata.get("password")?.as_str()?;
    Credentials::from_parts(Some(username), Some(password))
}

/// Convert a successful probe into the stream record reported to clients.
fn to_discovered(result: TestResult) -> DiscoveredStream {
    let port = port_from_url(&result.url);
    DiscoveredStream {
        url: result.url,
        stream_type: result.stream_type.unwrap_or(StreamType::HttpUnknown),
        protocol: result.protocol,
        port,
        working: true,
        resolution: result.resolution,
        codec: result.codec,
        fps: result.fps,
        bitrate: result.bitrate,
        has_audio: result.has_audio,
        error: None,
        test_time_ms: result.test_time.as_millis() as u64,
        metadata: result.metadata,
    }
}

fn port_from_url(raw: &str) -> u16 {
    let Ok(url) = Url::parse(raw) else {
        return 0;
    };
    if let Some(port) = url.port() {
        return port;
    }
    match url.scheme() {
        "http" => 80,
        "https" => 443,
        "rtsp" | "rtsps" => 554,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_url_detection() {
        assert!(is_direct_stream_url("rtsp://10.0.0.5:554/live"));
        assert!(is_direct_stream_url("http://10.0.0.5/snapshot.jpg"));
        assert!(is_direct_stream_url("https://cam.local/feed"));
        assert!(!is_direct_stream_url("192.168.1.100"));
        assert!(!is_direct_stream_url("192.168.1.100:8080"));
        assert!(!is_direct_stream_url("ftp://10.0.0.5/file"));
    }

    #[test]
    fn host_extraction() {
        assert_eq!(extract_host("192.168.1.100"), "192.168.1.100");
        assert_eq!(extract_host("192.168.1.100:8080"), "192.168.1.100");
        assert_eq!(extract_host("rtsp://10.0.0.5:554/live"), "10.0.0.5");
        assert_eq!(extract_host("http://cam.local/x"), "cam.local");
        assert_eq!(extract_host("[fe80::1]"), "[fe80::1]");
    }

    #[test]
    fn found_slots_never_exceed_cap() {
        let found = AtomicUsize::new(0);
        let claimed = (0..10).filter(|_| claim_found_slot(&found, 3)).count();
        assert_eq!(claimed, 3);
        assert_eq!(found.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn port_derivation_from_url() {
        assert_eq!(port_from_url("rtsp://10.0.0.1/live"), 554);
        assert_eq!(port_from_url("rtsp://10.0.0.1:8554/live"), 8554);
        assert_eq!(port_from_url("http://10.0.0.1/x"), 80);
        assert_eq!(port_from_url("https://10.0.0.1/x"), 443);
        assert_eq!(port_from_url("http://10.0.0.1:8080/x"), 8080);
    }
}
