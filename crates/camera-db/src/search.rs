use anyhow::Result;
use common::models::{Camera, CameraSearchResponse};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::loader::Loader;

/// Brands scoring below this against the first query token are skipped
/// without loading their JSON.
const MIN_BRAND_SCORE: f64 = 0.3;
const MIN_COMBINED_SCORE: f64 = 0.3;
const SEARCH_CONCURRENCY: usize = 10;
const DEFAULT_SEARCH_LIMIT: usize = 10;
const DEFAULT_MODEL_LIMIT: usize = 6;
const DEFAULT_MODEL_SIMILARITY: f64 = 0.8;

static STRIP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9\s-]+").expect("valid regex"));
static SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Fuzzy search over the camera knowledge base.
///
/// The first query token is treated as the brand candidate and scored
/// against brand ids; the remaining tokens are matched against the model
/// strings of each surviving brand.
pub struct SearchEngine {
    loader: Arc<Loader>,
}

impl SearchEngine {
    pub fn new(loader: Arc<Loader>) -> Self {
        Self { loader }
    }

    /// Free-text search, ranked by `0.3 * brand score + 0.7 * model score`.
    /// Returns one row per distinct matched model.
    pub async fn search(&self, query: &str, limit: usize) -> Result<CameraSearchResponse> {
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        let normalized = normalize_query(query);
        let tokens: Vec<String> = normalized.split_whitespace().map(str::to_string).collect();

        debug!(query = %query, normalized = %normalized, "searching cameras");

        if tokens.is_empty() {
            return Ok(CameraSearchResponse {
                cameras: Vec::new(),
                total: 0,
                returned: 0,
            });
        }

        let brand_token = tokens[0].clone();
        let model_tokens: Arc<[String]> = tokens[1..].to_vec().into();
        let normalized: Arc<str> = normalized.into();

        let brands = self.loader.list_brands().await?;
        let semaphore = Arc::new(Semaphore::new(SEARCH_CONCURRENCY));
        let mut tasks = JoinSet::new();

        for brand_id in brands {
            let loader = self.loader.clone();
            let semaphore = semaphore.clone();
            let brand_token = brand_token.clone();
            let model_tokens = model_tokens.clone();
            let normalized = normalized.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let brand = brand_score(&brand_id, &brand_token);
                if brand < MIN_BRAND_SCORE {
                    return None;
                }
                let camera = match loader.load_brand(&brand_id).await {
                    Ok(camera) => camera,
                    Err(e) => {
                        error!(brand = %brand_id, error = %e, "failed to load brand");
                        return None;
                    }
                };
                let best_model = camera
                    .entries
                    .iter()
                    .flat_map(|entry| entry.models.iter())
                    .map(|model| model_score(model, &model_tokens, &normalized))
                    .fold(0.0_f64, f64::max);
                let combined = combine_scores(brand, best_model);
                (combined >= MIN_COMBINED_SCORE).then_some((camera, brand))
            });
        }

        let mut survivors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(hit)) = joined {
                survivors.push(hit);
            }
        }

        // Expand each surviving brand into one row per distinct model it
        // references, carrying the model-specific score.
        let mut expanded: Vec<Camera> = Vec::new();
        for (camera, brand) in survivors {
            let mut per_model: HashMap<&str, f64> = HashMap::new();
            for entry in &camera.entries {
                for model in &entry.models {
                    if model.is_empty() || model == "Other" {
                        continue;
                    }
                    let score = model_score(model, &model_tokens, &normalized);
                    let slot = per_model.entry(model.as_str()).or_insert(0.0);
                    if score > *slot {
                        *slot = score;
                    }
                }
            }
            for (model, score) in per_model {
                let mut row = (*camera).clone();
                row.model = Some(model.to_string());
                row.match_score = Some(brand * 0.3 + score * 0.7);
                expanded.push(row);
            }
        }

        expanded.sort_by(|a, b| {
            b.match_score
                .unwrap_or(0.0)
                .total_cmp(&a.match_score.unwrap_or(0.0))
        });
        expanded.truncate(limit);

        Ok(CameraSearchResponse {
            total: expanded.len(),
            returned: expanded.len(),
            cameras: expanded,
        })
    }

    /// Find brands carrying a model similar to `model_name`, ranked by the
    /// best per-entry similarity. Used by the scanner to turn a model hint
    /// into candidate URL patterns.
    pub async fn search_by_model(
        &self,
        model_name: &str,
        similarity_threshold: f64,
        limit: usize,
    ) -> Result<Vec<Camera>> {
        let threshold = if similarity_threshold <= 0.0 {
            DEFAULT_MODEL_SIMILARITY
        } else {
            similarity_threshold
        };
        let limit = if limit == 0 { DEFAULT_MODEL_LIMIT } else { limit };
        let normalized = normalize_query(model_name);

        let mut cameras = self
            .loader
            .streaming_search(|camera| {
                let mut best = 0.0_f64;
                for entry in &camera.entries {
                    for model in &entry.models {
                        let entry_model = normalize_query(model);
                        let mut score = similarity(&normalized, &entry_model);
                        if score < 0.7 && is_subsequence(&normalized, &entry_model) {
                            score = 0.7;
                        }
                        if score > best {
                            best = score;
                        }
                    }
                }
                if best >= threshold {
                    camera.match_score = Some(best);
                    true
                } else {
                    false
                }
            })
            .await?;

        cameras.sort_by(|a, b| {
            b.match_score
                .unwrap_or(0.0)
                .total_cmp(&a.match_score.unwrap_or(0.0))
        });
        cameras.truncate(limit);
        Ok(cameras)
    }
}

/// Lowercase, strip everything outside `[a-z0-9\s-]`, collapse whitespace,
/// trim. Idempotent.
pub fn normalize_query(query: &str) -> String {
    let lower = query.to_lowercase();
    let stripped = STRIP_RE.replace_all(&lower, " ");
    let collapsed = SPACE_RE.replace_all(&stripped, " ");
    collapsed.trim().to_string()
}

/// Score a brand id against the brand candidate token; first rung wins.
fn brand_score(brand_id: &str, token: &str) -> f64 {
    let brand = brand_id.to_lowercase();
    let token = token.to_lowercase();

    if brand == token {
        return 1.0;
    }

    let brand_flat = brand.replace('-', "");
    let token_flat = token.replace('-', "");
    if brand_flat == token_flat {
        return 0.95;
    }
    if brand.starts_with(&token) || brand_flat.starts_with(&token_flat) {
        return 0.85;
    }
    if brand.contains(&token) || brand_flat.contains(&token_flat) {
        return 0.75;
    }
    if is_subsequence(&token, &brand) {
        return 0.6;
    }
    similarity(&brand, &token) * 0.5
}

/// Score a model string against the model tokens; first rung wins.
fn model_score(model: &str, tokens: &[String], full_query: &str) -> f64 {
    let model_lower = model.to_lowercase();
    if model_lower == full_query {
        return 1.0;
    }

    let model_norm = normalize_query(&model_lower);
    if !tokens.is_empty() {
        let matched = tokens
            .iter()
            .filter(|token| model_norm.contains(token.as_str()))
            .count();
        if matched == tokens.len() {
            return 0.8 + 0.2 * (matched as f64 / tokens.len() as f64);
        }
    }

    let combined: String = tokens.concat();
    if !combined.is_empty() && is_subsequence(&combined, &model_norm) {
        return 0.6;
    }
    similarity(&model_norm, &tokens.join(" ")) * 0.5
}

fn combine_scores(brand: f64, model: f64) -> f64 {
    if brand > 0.0 && model > 0.0 {
        return brand * 0.3 + model * 0.7;
    }
    if brand > 0.0 {
        return brand * 0.5;
    }
    model * 0.5
}

/// `1 - edit_distance / max(len)`.
fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Do the characters of `needle` appear in `haystack` in order (not
/// necessarily contiguously)?
fn is_subsequence(needle: &str, haystack: &str) -> bool {
    let mut haystack = haystack.chars();
    needle.chars().all(|n| haystack.any(|h| h == n))
}
