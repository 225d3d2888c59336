use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::types::{Candidate, Carrier, RawHit};

const FOFA_PAGE_SIZE: u64 = 200;
const QUAKE_PAGE_SIZE: u64 = 100;
/// Fixed anti-throttling delay between page requests.
const PAGE_DELAY: Duration = Duration::from_secs(1);
const MAX_PAGE_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Failure of one search backend. Retryable errors are retried per page;
/// fatal ones disable the backend for the run without affecting the others.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::RateLimited => true,
            BackendError::Status(code) => (500..=599).contains(code),
            BackendError::Transport(_) => true,
            BackendError::Auth(_) | BackendError::Malformed(_) => false,
        }
    }
}

/// One external asset-search provider. `search` returns every hit it is
/// willing to serve for this run's region/carrier, already paginated and
/// rate-limited internally; it is restartable only by calling it again.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self) -> Result<Vec<RawHit>, BackendError>;
}

/// Retry a single page fetch on transient failures with capped exponential
/// backoff. Fatal errors propagate immediately.
async fn fetch_with_retry<T, F, Fut>(
    backend: &'static str,
    page: usize,
    mut attempt: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut tries = 0u32;
    loop {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && tries < MAX_PAGE_RETRIES => {
                let backoff = BACKOFF_CAP.min(BACKOFF_BASE * 2u32.saturating_pow(tries));
                warn!(backend, page, error = %e, ?backoff, "page fetch failed, retrying");
                tokio::time::sleep(backoff).await;
                tries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Total pages to fetch given a reported result count, honoring the per-run
/// ceiling. The ceiling is what guarantees termination even when a backend
/// reports an absurd total.
fn page_count(total: u64, page_size: u64, max_pages: usize) -> usize {
    let full = total.div_ceil(page_size) as usize;
    full.min(max_pages)
}

fn map_status(status: reqwest::StatusCode) -> Option<BackendError> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        401 | 403 => BackendError::Auth(format!("HTTP {status}")),
        429 => BackendError::RateLimited,
        code => BackendError::Status(code),
    })
}

/// Pull `ip:port` pairs out of heterogeneous result rows. Providers return
/// either object rows (`{"ip": ..., "port": ...}`, with a few alternate key
/// spellings) or positional rows (`["ip", port]`). Rows without a
/// syntactically valid IPv4 address and a port in [1, 65535] are dropped
/// without comment.
fn extract_hits(rows: &[Value], backend: &'static str) -> Vec<RawHit> {
    let mut hits = Vec::new();
    for row in rows {
        let (ip, port, org) = match row {
            Value::Object(obj) => {
                let ip = ["ip", "host", "address"]
                    .iter()
                    .find_map(|k| obj.get(*k))
                    .map(value_to_string);
                let port = ["port", "service_port", "target_port"]
                    .iter()
                    .find_map(|k| obj.get(*k))
                    .and_then(value_to_port);
                let org = obj.get("org").map(value_to_string).filter(|s| !s.is_empty());
                (ip, port, org)
            }
            Value::Array(arr) if arr.len() >= 2 => (
                Some(value_to_string(&arr[0])),
                value_to_port(&arr[1]),
                None,
            ),
            _ => (None, None, None),
        };
        let (Some(ip), Some(port)) = (ip, port) else {
            continue;
        };
        let Ok(ip) = ip.trim().parse::<std::net::Ipv4Addr>() else {
            continue;
        };
        hits.push(RawHit {
            candidate: Candidate::new(ip, port),
            backend,
            org,
        });
    }
    hits
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_to_port(v: &Value) -> Option<u16> {
    let n = match v {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    if (1..=65535).contains(&n) {
        Some(n as u16)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// FOFA
// ---------------------------------------------------------------------------

pub struct FofaBackend {
    client: reqwest::Client,
    api_key: String,
    user_agent: String,
    region: String,
    carrier: Carrier,
    max_pages: usize,
}

impl FofaBackend {
    pub const API_URL: &'static str = "https://fofa.info/api/v1/search/next";

    pub fn from_config(cfg: &RunConfig) -> Option<Self> {
        let api_key = cfg.credentials.fofa_api_key.clone()?;
        let user_agent = cfg
            .credentials
            .fofa_user_agent
            .clone()
            .unwrap_or_else(|| "Mozilla/5.0".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;
        Some(Self {
            client,
            api_key,
            user_agent,
            region: cfg.region.clone(),
            carrier: cfg.carrier,
            max_pages: cfg.max_pages,
        })
    }

    /// Carrier-specific query: FOFA filters relays by the operator's
    /// registered organization string.
    pub fn build_query(region: &str, carrier: Carrier) -> String {
        let org = match carrier {
            Carrier::Telecom => "Chinanet".to_string(),
            Carrier::Unicom => "CHINA UNICOM China169 Backbone".to_string(),
            Carrier::Mobile => format!("{region} Mobile Communication Company Limited"),
        };
        format!(
            "\"udpxy\" && country=\"CN\" && region=\"{region}\" && org=\"{org}\" && protocol=\"http\""
        )
    }

    async fn fetch_page(&self, qbase64: &str, next: Option<&str>) -> Result<FofaPage, BackendError> {
        let mut req = self
            .client
            .get(Self::API_URL)
            .header("User-Agent", &self.user_agent)
            .query(&[
                ("key", self.api_key.as_str()),
                ("qbase64", qbase64),
                ("fields", "ip,port"),
                ("size", "200"),
                ("full", "false"),
                ("r_type", "json"),
            ]);
        if let Some(next) = next {
            req = req.query(&[("next", next)]);
        }
        let resp = req.send().await?;
        if let Some(err) = map_status(resp.status()) {
            return Err(err);
        }
        let body: Value = resp.json().await?;
        if body.get("error").and_then(Value::as_bool).unwrap_or(false) {
            let msg = body
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(if msg.contains("auth") || msg.contains("[-700") {
                BackendError::Auth(msg)
            } else {
                BackendError::Malformed(msg)
            });
        }
        let results = body
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(FofaPage {
            total: body.get("size").and_then(Value::as_u64).unwrap_or(0),
            next: body
                .get("next")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            results,
        })
    }
}

struct FofaPage {
    total: u64,
    next: Option<String>,
    results: Vec<Value>,
}

#[async_trait]
impl SearchBackend for FofaBackend {
    fn name(&self) -> &'static str {
        "fofa"
    }

    async fn search(&self) -> Result<Vec<RawHit>, BackendError> {
        let query = Self::build_query(&self.region, self.carrier);
        let qbase64 = base64::engine::general_purpose::STANDARD.encode(&query);
        debug!(backend = "fofa", %query, "search query");

        let first = fetch_with_retry("fofa", 1, || self.fetch_page(&qbase64, None)).await?;
        let pages = page_count(first.total, FOFA_PAGE_SIZE, self.max_pages);
        let mut hits = extract_hits(&first.results, "fofa");
        info!(
            backend = "fofa",
            total = first.total,
            pages,
            first_page = hits.len(),
            "first page fetched"
        );

        let mut next = first.next;
        let mut page = 1usize;
        while let Some(cursor) = next.take() {
            if page >= pages {
                break;
            }
            page += 1;
            tokio::time::sleep(PAGE_DELAY).await;
            let fetched =
                fetch_with_retry("fofa", page, || self.fetch_page(&qbase64, Some(&cursor))).await?;
            if fetched.results.is_empty() {
                break;
            }
            hits.extend(extract_hits(&fetched.results, "fofa"));
            next = fetched.next;
        }
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Quake360
// ---------------------------------------------------------------------------

pub struct QuakeBackend {
    client: reqwest::Client,
    token: String,
    user_agent: String,
    region: String,
    carrier: Carrier,
    max_pages: usize,
}

impl QuakeBackend {
    pub const API_URL: &'static str = "https://quake.360.net/api/v3/search/quake_service";

    pub fn from_config(cfg: &RunConfig) -> Option<Self> {
        let token = cfg.credentials.quake_token.clone()?;
        let user_agent = cfg
            .credentials
            .fofa_user_agent
            .clone()
            .unwrap_or_else(|| "Mozilla/5.0".to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;
        Some(Self {
            client,
            token,
            user_agent,
            region: cfg.region.clone(),
            carrier: cfg.carrier,
            max_pages: cfg.max_pages,
        })
    }

    pub fn build_query(region: &str, carrier: Carrier) -> String {
        format!(
            "\"udpxy\" AND country: \"CN\" AND province: \"{region}\" AND org: \"China {}\" AND protocol: \"http\"",
            carrier.as_str()
        )
    }

    async fn fetch_page(&self, query: &str, start: u64) -> Result<QuakePage, BackendError> {
        let body = serde_json::json!({
            "query": query,
            "start": start,
            "size": QUAKE_PAGE_SIZE,
            "ignore_cache": false,
            "latest": true,
        });
        let resp = self
            .client
            .post(Self::API_URL)
            .header("X-QuakeToken", &self.token)
            .header("User-Agent", &self.user_agent)
            .json(&body)
            .send()
            .await?;
        if let Some(err) = map_status(resp.status()) {
            return Err(err);
        }
        let body: Value = resp.json().await?;
        // Quake reports API-level failures in-band with a non-zero code.
        if let Some(code) = body.get("code").and_then(Value::as_u64) {
            if code != 0 {
                let msg = body
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                return Err(if code == 401 || msg.contains("token") {
                    BackendError::Auth(msg)
                } else {
                    BackendError::Malformed(format!("code {code}: {msg}"))
                });
            }
        }
        let results = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = body
            .pointer("/meta/pagination/total")
            .and_then(Value::as_u64)
            .unwrap_or(results.len() as u64);
        Ok(QuakePage { total, results })
    }
}

struct QuakePage {
    total: u64,
    results: Vec<Value>,
}

#[async_trait]
impl SearchBackend for QuakeBackend {
    fn name(&self) -> &'static str {
        "quake360"
    }

    async fn search(&self) -> Result<Vec<RawHit>, BackendError> {
        let query = Self::build_query(&self.region, self.carrier);
        debug!(backend = "quake360", %query, "search query");

        let first = fetch_with_retry("quake360", 1, || self.fetch_page(&query, 0)).await?;
        let pages = page_count(first.total, QUAKE_PAGE_SIZE, self.max_pages);
        let mut hits = extract_hits(&first.results, "quake360");
        info!(
            backend = "quake360",
            total = first.total,
            pages,
            first_page = hits.len(),
            "first page fetched"
        );

        for page in 2..=pages {
            tokio::time::sleep(PAGE_DELAY).await;
            let start = (page as u64 - 1) * QUAKE_PAGE_SIZE;
            let fetched =
                fetch_with_retry("quake360", page, || self.fetch_page(&query, start)).await?;
            if fetched.results.is_empty() {
                break;
            }
            hits.extend(extract_hits(&fetched.results, "quake360"));
        }
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Union of all hits by exact candidate identity. Deeper dedup (same /24 and
/// port) happens later in [`crate::dedupe`].
pub fn union_hits<I>(batches: I) -> HashSet<Candidate>
where
    I: IntoIterator<Item = Vec<RawHit>>,
{
    batches
        .into_iter()
        .flatten()
        .map(|hit| hit.candidate)
        .collect()
}

/// Run every configured backend concurrently and union the results. A failed
/// backend degrades to "no results" for the run; the others are unaffected.
pub async fn aggregate(backends: Vec<Box<dyn SearchBackend>>) -> HashSet<Candidate> {
    let mut set = JoinSet::new();
    for backend in backends {
        set.spawn(async move {
            let name = backend.name();
            match backend.search().await {
                Ok(hits) => {
                    info!(backend = name, hits = hits.len(), "backend finished");
                    hits
                }
                Err(e) => {
                    warn!(backend = name, error = %e, "backend disabled for this run");
                    Vec::new()
                }
            }
        });
    }

    let mut batches = Vec::new();
    while let Some(res) = set.join_next().await {
        match res {
            Ok(hits) => batches.push(hits),
            Err(e) => warn!(error = %e, "backend task panicked"),
        }
    }
    union_hits(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn page_count_is_capped_by_max_pages() {
        assert_eq!(page_count(0, 200, 10), 0);
        assert_eq!(page_count(1, 200, 10), 1);
        assert_eq!(page_count(200, 200, 10), 1);
        assert_eq!(page_count(201, 200, 10), 2);
        // A backend claiming billions of rows still terminates at the cap.
        assert_eq!(page_count(u64::MAX, 200, 10), 10);
    }

    #[test]
    fn extract_object_rows() {
        let rows = vec![
            json!({"ip": "1.2.3.4", "port": 4022}),
            json!({"host": "5.6.7.8", "service_port": "8888", "org": "Chinanet"}),
        ];
        let hits = extract_hits(&rows, "fofa");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].candidate.to_string(), "1.2.3.4:4022");
        assert_eq!(hits[1].candidate.to_string(), "5.6.7.8:8888");
        assert_eq!(hits[1].org.as_deref(), Some("Chinanet"));
    }

    #[test]
    fn extract_positional_rows() {
        let rows = vec![json!(["1.2.3.4", 80]), json!(["9.9.9.9", "1234"])];
        let hits = extract_hits(&rows, "fofa");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].candidate.port, 1234);
    }

    #[test]
    fn invalid_rows_are_silently_dropped() {
        let rows = vec![
            json!({"ip": "example.com", "port": 80}),    // domain, not IPv4
            json!({"ip": "1.2.3.4", "port": 0}),         // port out of range
            json!({"ip": "1.2.3.4", "port": 70000}),     // port out of range
            json!({"ip": "1.2.3.4"}),                    // missing port
            json!(["1.2.3.4"]),                          // short positional row
            json!("1.2.3.4:80"),                         // wrong shape entirely
            json!({"ip": "1.2.3.4", "port": 80}),        // the one valid row
        ];
        let hits = extract_hits(&rows, "quake360");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].candidate.to_string(), "1.2.3.4:80");
    }

    #[test]
    fn union_collapses_exact_duplicates_across_backends() {
        let a: Candidate = "1.2.3.4:80".parse().unwrap();
        let b: Candidate = "1.2.3.5:80".parse().unwrap();
        let x = vec![RawHit { candidate: a, backend: "fofa", org: None }];
        let y = vec![
            RawHit { candidate: a, backend: "quake360", org: None },
            RawHit { candidate: b, backend: "quake360", org: None },
        ];
        let union = union_hits([x, y]);
        assert_eq!(union, HashSet::from([a, b]));
    }

    #[test]
    fn fofa_query_varies_by_carrier() {
        let q = FofaBackend::build_query("Shanghai", Carrier::Telecom);
        assert!(q.contains("org=\"Chinanet\""));
        assert!(q.contains("region=\"Shanghai\""));
        let q = FofaBackend::build_query("Beijing", Carrier::Mobile);
        assert!(q.contains("Beijing Mobile Communication Company Limited"));
        let q = QuakeBackend::build_query("Zhejiang", Carrier::Unicom);
        assert!(q.contains("org: \"China Unicom\""));
    }

    #[test]
    fn retryable_classification() {
        assert!(BackendError::RateLimited.is_retryable());
        assert!(BackendError::Status(503).is_retryable());
        assert!(!BackendError::Status(404).is_retryable());
        assert!(!BackendError::Auth("bad key".into()).is_retryable());
        assert!(!BackendError::Malformed("nope".into()).is_retryable());
    }
}
