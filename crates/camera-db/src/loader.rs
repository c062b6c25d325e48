use common::error::DbError;
use common::models::{Camera, StreamPattern};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Loads and caches the bundled camera knowledge base.
///
/// Brand files are decoded lazily and cached process-wide; the
/// popular-pattern and query-parameter tables are decoded once. Every
/// method is safe for parallel callers; a cache slot may be populated twice
/// under a race, which is harmless because the values are equal.
pub struct Loader {
    brands_dir: PathBuf,
    patterns_path: PathBuf,
    parameters_path: PathBuf,
    brands: RwLock<HashMap<String, Arc<Camera>>>,
    patterns: RwLock<Option<Arc<Vec<StreamPattern>>>>,
    parameters: RwLock<Option<Arc<Vec<String>>>>,
}

impl Loader {
    pub fn new(
        brands_dir: impl Into<PathBuf>,
        patterns_path: impl Into<PathBuf>,
        parameters_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            brands_dir: brands_dir.into(),
            patterns_path: patterns_path.into(),
            parameters_path: parameters_path.into(),
            brands: RwLock::new(HashMap::new()),
            patterns: RwLock::new(None),
            parameters: RwLock::new(None),
        }
    }

    /// Load a specific brand, caching on first hit.
    pub async fn load_brand(&self, brand_id: &str) -> Result<Arc<Camera>, DbError> {
        {
            let cache = self.brands.read().await;
            if let Some(camera) = cache.get(brand_id) {
                return Ok(camera.clone());
            }
        }

        let path = self.brands_dir.join(format!("{brand_id}.json"));
        let camera = match decode_brand_file(&path).await {
            Ok(camera) => Arc::new(camera),
            Err(DbError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DbError::BrandNotFound(brand_id.to_string()));
            }
            Err(e) => return Err(e),
        };

        let mut cache = self.brands.write().await;
        cache.insert(brand_id.to_string(), camera.clone());
        Ok(camera)
    }

    /// List every available brand id (the filename stems), excluding the
    /// directory index files.
    pub async fn list_brands(&self) -> Result<Vec<String>, DbError> {
        let mut dir = tokio::fs::read_dir(&self.brands_dir).await?;
        let mut brands = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = brand_stem(name) {
                brands.push(stem.to_string());
            }
        }
        brands.sort();
        Ok(brands)
    }

    /// Load the popular stream pattern table, caching after the first read.
    pub async fn load_popular_patterns(&self) -> Result<Arc<Vec<StreamPattern>>, DbError> {
        {
            let cache = self.patterns.read().await;
            if let Some(patterns) = cache.as_ref() {
                return Ok(patterns.clone());
            }
        }

        let raw = tokio::fs::read(&self.patterns_path).await?;
        let patterns: Vec<StreamPattern> = serde_json::from_slice(&raw)?;
        debug!(count = patterns.len(), "loaded popular stream patterns");
        let patterns = Arc::new(patterns);

        let mut cache = self.patterns.write().await;
        *cache = Some(patterns.clone());
        Ok(patterns)
    }

    /// Load the community-known auth query parameter names.
    pub async fn load_query_parameters(&self) -> Result<Arc<Vec<String>>, DbError> {
        {
            let cache = self.parameters.read().await;
            if let Some(parameters) = cache.as_ref() {
                return Ok(parameters.clone());
            }
        }

        let raw = tokio::fs::read(&self.parameters_path).await?;
        let parameters: Vec<String> = serde_json::from_slice(&raw)?;
        let parameters = Arc::new(parameters);

        let mut cache = self.parameters.write().await;
        *cache = Some(parameters.clone());
        Ok(parameters)
    }

    /// Iterate every brand file, decoding one at a time, and keep the
    /// cameras for which `keep` returns true. The predicate may mutate the
    /// camera (e.g. to attach a match score). Undecodable files are logged
    /// and skipped; they never fail the search.
    pub async fn streaming_search<F>(&self, mut keep: F) -> Result<Vec<Camera>, DbError>
    where
        F: FnMut(&mut Camera) -> bool,
    {
        let mut dir = tokio::fs::read_dir(&self.brands_dir).await?;
        let mut results = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if brand_stem(name).is_none() {
                continue;
            }
            let path = entry.path();
            let mut camera = match decode_brand_file(&path).await {
                Ok(camera) => camera,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to load brand file");
                    continue;
                }
            };
            if keep(&mut camera) {
                results.push(camera);
            }
        }
        Ok(results)
    }
}

/// The brand id for a knowledge-base filename, or None for files the
/// search must skip (non-JSON entries and the index files).
fn brand_stem(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(".json")?;
    if file_name == "index.json" || file_name == "indexa.json" {
        return None;
    }
    Some(stem)
}

async fn decode_brand_file(path: &Path) -> Result<Camera, DbError> {
    let raw = tokio::fs::read(path).await?;
    let mut camera: Camera = serde_json::from_slice(&raw)?;
    // The filename stem is authoritative for the brand id.
    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
        camera.brand_id = stem.to_string();
    }
    Ok(camera)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_brand(dir: &Path, brand_id: &str, body: &str) {
        fs::write(dir.join(format!("{brand_id}.json")), body).unwrap();
    }

    fn fixture_db() -> (TempDir, Loader) {
        let tmp = TempDir::new().unwrap();
        let brands = tmp.path().join("brands");
        fs::create_dir(&brands).unwrap();
        write_brand(
            &brands,
            "hikvision",
            r#"{
                "brand": "Hikvision",
                "brand_id": "hikvision",
                "entries": [
                    {"models": ["DS-2CD2032"], "type": "FFMPEG", "protocol": "rtsp",
                     "port": 554, "url": "/Streaming/Channels/101"}
                ]
            }"#,
        );
        write_brand(
            &brands,
            "axis",
            r#"{"brand": "Axis", "brand_id": "axis", "entries": []}"#,
        );
        fs::write(brands.join("index.json"), "{}").unwrap();
        fs::write(brands.join("indexa.json"), "{}").unwrap();

        let patterns = tmp.path().join("popular_stream_patterns.json");
        fs::write(
            &patterns,
            r#"[{"url": "/stream1", "type": "FFMPEG", "protocol": "rtsp", "port": 554}]"#,
        )
        .unwrap();
        let parameters = tmp.path().join("query_parameters.json");
        fs::write(&parameters, r#"["user", "pwd"]"#).unwrap();

        let loader = Loader::new(brands, patterns, parameters);
        (tmp, loader)
    }

    #[tokio::test]
    async fn load_brand_caches_and_reports_not_found() {
        let (_tmp, loader) = fixture_db();

        let camera = loader.load_brand("hikvision").await.unwrap();
        assert_eq!(camera.brand, "Hikvision");
        assert_eq!(camera.entries.len(), 1);

        // Cached copy is the same allocation.
        let again = loader.load_brand("hikvision").await.unwrap();
        assert!(Arc::ptr_eq(&camera, &again));

        match loader.load_brand("nope").await {
            Err(DbError::BrandNotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("expected BrandNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_brands_skips_index_files() {
        let (_tmp, loader) = fixture_db();
        let brands = loader.list_brands().await.unwrap();
        assert_eq!(brands, vec!["axis".to_string(), "hikvision".to_string()]);
    }

    #[tokio::test]
    async fn brand_id_always_matches_filename_stem() {
        let (tmp, loader) = fixture_db();
        // A file whose embedded brand_id disagrees with its name.
        write_brand(
            &tmp.path().join("brands"),
            "dahua",
            r#"{"brand": "Dahua", "brand_id": "something-else", "entries": []}"#,
        );
        let camera = loader.load_brand("dahua").await.unwrap();
        assert_eq!(camera.brand_id, "dahua");

        let all = loader.streaming_search(|_| true).await.unwrap();
        for camera in &all {
            assert!(["axis", "dahua", "hikvision"].contains(&camera.brand_id.as_str()));
        }
    }

    #[tokio::test]
    async fn streaming_search_skips_undecodable_files() {
        let (tmp, loader) = fixture_db();
        fs::write(tmp.path().join("brands/broken.json"), "not json").unwrap();

        let matches = loader
            .streaming_search(|camera| camera.brand == "Hikvision")
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].brand_id, "hikvision");
    }

    #[tokio::test]
    async fn pattern_and_parameter_tables_load_once() {
        let (_tmp, loader) = fixture_db();
        let patterns = loader.load_popular_patterns().await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].url, "/stream1");
        let again = loader.load_popular_patterns().await.unwrap();
        assert!(Arc::ptr_eq(&patterns, &again));

        let params = loader.load_query_parameters().await.unwrap();
        assert_eq!(params.as_slice(), ["user", "pwd"]);
    }
}
