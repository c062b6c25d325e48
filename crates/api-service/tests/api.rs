use api_service::{routes, AppState};
use axum_test::TestServer;
use camera_db::{Loader, SearchEngine};
use serde_json::{json, Value as JsonValue};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use stream_discovery::{OnvifProber, Scanner, ScannerConfig, StreamProbe, UrlBuilder};
use tempfile::TempDir;

fn test_server() -> (TempDir, TestServer) {
    let tmp = TempDir::new().unwrap();
    let brands = tmp.path().join("brands");
    fs::create_dir(&brands).unwrap();
    fs::write(
        brands.join("hikvision.json"),
        r#"{
            "brand": "Hikvision",
            "brand_id": "hikvision",
            "entries": [
                {"models": ["DS-2CD2032"], "type": "FFMPEG", "protocol": "rtsp",
                 "port": 554, "url": "/Streaming/Channels/101"}
            ]
        }"#,
    )
    .unwrap();
    let patterns = tmp.path().join("popular_stream_patterns.json");
    fs::write(&patterns, "[]").unwrap();
    let parameters = tmp.path().join("query_parameters.json");
    fs::write(&parameters, r#"["user", "pwd"]"#).unwrap();

    let loader = Arc::new(Loader::new(brands, patterns, parameters));
    let search = Arc::new(SearchEngine::new(loader.clone()));
    let probe = Arc::new(StreamProbe::new(Duration::from_secs(5)).unwrap());
    let scanner = Arc::new(Scanner::new(
        loader.clone(),
        search.clone(),
        UrlBuilder::default(),
        Arc::new(OnvifProber::new().unwrap()),
        probe.clone(),
        ScannerConfig::default(),
    ));
    let state = AppState::new(loader, search, scanner, probe);
    let server = TestServer::new(routes::router(state)).unwrap();
    (tmp, server)
}

#[tokio::test]
async fn health_reports_status_and_version() {
    let (_tmp, server) = test_server();
    let response = server.get("/api/health").await;
    response.assert_status_ok();
    let body: JsonValue = response.json();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert!(body["ffprobe_available"].is_boolean());
}

#[tokio::test]
async fn brands_lists_knowledge_base_contents() {
    let (_tmp, server) = test_server();
    let response = server.get("/api/brands").await;
    response.assert_status_ok();
    let body: JsonValue = response.json();
    assert_eq!(body["total"], 1);
    assert_eq!(body["brands"][0], "hikvision");
}

#[tokio::test]
async fn brand_detail_returns_entries_or_404() {
    let (_tmp, server) = test_server();

    let response = server.get("/api/brands/hikvision").await;
    response.assert_status_ok();
    let body: JsonValue = response.json();
    assert_eq!(body["brand"], "Hikvision");
    assert_eq!(body["entries"][0]["url"], "/Streaming/Channels/101");

    let missing = server.get("/api/brands/no-such-brand").await;
    missing.assert_status_not_found();
    let body: JsonValue = missing.json();
    assert!(body["error"].as_str().unwrap().contains("no-such-brand"));
}

#[tokio::test]
async fn camera_search_returns_ranked_matches() {
    let (_tmp, server) = test_server();
    let response = server
        .post("/api/cameras/search")
        .json(&json!({"query": "hikvision ds-2cd2032", "limit": 5}))
        .await;
    response.assert_status_ok();
    let body: JsonValue = response.json();
    assert!(body["returned"].as_u64().unwrap() >= 1);
    assert_eq!(body["cameras"][0]["brand_id"], "hikvision");
}

#[tokio::test]
async fn empty_search_query_is_a_bad_request() {
    let (_tmp, server) = test_server();
    let response = server
        .post("/api/cameras/search")
        .json(&json!({"query": "  "}))
        .await;
    response.assert_status_bad_request();
}
