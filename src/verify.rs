use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RunConfig, UDPXY_FINGERPRINTS};
use crate::types::{Candidate, VerificationResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Fingerprints live in headers and the first error line, so a small read
/// is enough to classify.
const MAX_PROBE_BYTES: usize = 512;
const STATUS_TIMEOUT: Duration = Duration::from_secs(3);

/// True when `response` carries a udpxy daemon fingerprint. Matching is
/// case-insensitive substring containment; any one fingerprint group with
/// all of its parts present is a match.
pub fn is_udpxy_response(response: &str) -> bool {
    let lower = response.to_ascii_lowercase();
    UDPXY_FINGERPRINTS
        .iter()
        .any(|group| group.iter().all(|part| lower.contains(part)))
}

/// Extract the active client count from a udpxy status page. Tries the
/// status table rows first, then falls back to a loose regex over the whole
/// body. Returns `None` when nothing parseable is found.
pub fn parse_active_connections(body: &str) -> Option<u32> {
    for line in body.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("active") && lower.contains("client") {
            if let Some(n) = first_number(line) {
                return Some(n);
            }
        }
    }
    static FALLBACK: OnceLock<Regex> = OnceLock::new();
    let re = FALLBACK.get_or_init(|| {
        Regex::new(r"(?i)clients?\D{0,20}(\d+)").unwrap()
    });
    re.captures(body)
        .and_then(|cap| cap.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn first_number(line: &str) -> Option<u32> {
    let digits: String = line
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Connect, send one raw HTTP request and read whatever the daemon answers.
/// udpxy replies to `GET /` with either its status banner or a `400` carrying
/// its Server header, so the raw bytes are enough either way.
async fn probe_raw(candidate: Candidate) -> std::io::Result<String> {
    let addr = (candidate.ip, candidate.port);
    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await??;

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {candidate}\r\nUser-Agent: Mozilla/5.0\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = vec![0u8; MAX_PROBE_BYTES];
    let mut filled = 0usize;
    let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, stream.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => {
                if filled == 0 {
                    return Err(e);
                }
                break;
            }
            Err(_) => break,
        }
    }
    Ok(String::from_utf8_lossy(&buf[..filled]).into_owned())
}

/// Fingerprint one candidate. Connection failures and timeouts classify as
/// not-target; only the positive identification is interesting downstream.
pub async fn verify(candidate: Candidate, client: &reqwest::Client) -> VerificationResult {
    let response = match probe_raw(candidate).await {
        Ok(r) => r,
        Err(e) => {
            debug!(candidate = %candidate, error = %e, "probe failed");
            return VerificationResult {
                candidate,
                is_target: false,
                active_connections: None,
            };
        }
    };

    let is_target = is_udpxy_response(&response);
    if !is_target {
        return VerificationResult {
            candidate,
            is_target: false,
            active_connections: None,
        };
    }

    let active_connections = fetch_active_connections(candidate, client).await;
    VerificationResult {
        candidate,
        is_target: true,
        active_connections,
    }
}

/// Best-effort read of the relay's status page. Failures of any kind just
/// leave the count unknown.
async fn fetch_active_connections(candidate: Candidate, client: &reqwest::Client) -> Option<u32> {
    let url = format!("http://{candidate}/status");
    let resp = client
        .get(&url)
        .timeout(STATUS_TIMEOUT)
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body = resp.text().await.ok()?;
    parse_active_connections(&body)
}

/// Fingerprint all candidates with a bounded worker pool. Cancellation stops
/// dispatching new probes; in-flight ones finish naturally. Returns only the
/// confirmed relays, in completion order.
pub async fn verify_all(
    candidates: Vec<Candidate>,
    cfg: &RunConfig,
    client: &reqwest::Client,
    cancel: &CancellationToken,
) -> Vec<VerificationResult> {
    let total = candidates.len();
    let semaphore = Arc::new(Semaphore::new(cfg.verify_workers));
    let confirmed = Arc::new(Mutex::new(Vec::new()));
    let checked = Arc::new(AtomicU64::new(0));
    let mut set = JoinSet::new();

    for candidate in candidates {
        if cancel.is_cancelled() {
            break;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let client = client.clone();
        let confirmed = confirmed.clone();
        let checked = checked.clone();
        set.spawn(async move {
            let _permit = permit;
            // Probes self-limit at the connect/read timeouts, so a cancelled
            // run only stops dispatching and lets these drain.
            let result = verify(candidate, &client).await;
            let done = checked.fetch_add(1, Ordering::Relaxed) + 1;
            if done % 100 == 0 {
                info!(checked = done, total, "verification progress");
            }
            if result.is_target {
                debug!(
                    candidate = %candidate,
                    active = ?result.active_connections,
                    "confirmed udpxy relay"
                );
                confirmed.lock().await.push(result);
            }
        });
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "verification task panicked");
        }
    }

    let results = Arc::try_unwrap(confirmed)
        .map(Mutex::into_inner)
        .unwrap_or_default();
    info!(
        checked = checked.load(Ordering::Relaxed),
        confirmed = results.len(),
        "verification finished"
    );
    results
}
