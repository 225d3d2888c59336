use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::RunConfig;
use crate::sink::ResultSink;
use crate::types::{speed_mbps, Candidate, CatalogEntry, Phase, SpeedTestResult, IP_PLACEHOLDER};

/// Why one stream probe did not yield a usable measurement.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("unexpected HTTP status {0}")]
    BadStatus(u16),
    #[error("stream stalled before enough data arrived")]
    Timeout,
    #[error("stream ended after only {bytes} bytes")]
    TooLittleData { bytes: u64 },
    #[error("implausible speed {0:.3} MB/s, discarding measurement")]
    ImplausibleSpeed(f64),
    #[error("read failed: {0}")]
    Read(String),
}

/// Build the stream URL for a candidate and catalog entry. Paths carrying
/// the `ipipip` placeholder are full templates and only need substitution;
/// bare paths are appended to the relay's own address.
pub fn stream_url(candidate: Candidate, stream_path: &str) -> String {
    if stream_path.contains(IP_PLACEHOLDER) {
        let substituted = stream_path.replace(IP_PLACEHOLDER, &candidate.to_string());
        if substituted.starts_with("http://") || substituted.starts_with("https://") {
            substituted
        } else {
            format!("http://{substituted}")
        }
    } else {
        format!("http://{candidate}/{}", stream_path.trim_start_matches('/'))
    }
}

/// Download a slice of the stream and measure throughput.
///
/// Timing starts at the first payload byte so connection setup does not
/// dilute the figure. The download stops at the byte ceiling or the time
/// ceiling, whichever comes first; a probe that delivers less than the
/// minimum byte count fails even when the server answered 200.
pub async fn stream_probe(
    client: &reqwest::Client,
    candidate: Candidate,
    entry: &CatalogEntry,
    cfg: &RunConfig,
    phase: Phase,
) -> Result<SpeedTestResult, ProbeFailure> {
    let url = stream_url(candidate, &entry.stream_path);
    debug!(candidate = %candidate, entry = %entry.tag(), %url, %phase, "stream probe");

    let resp = match timeout(cfg.connect_timeout, client.get(&url).send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return Err(ProbeFailure::Connect(e.to_string())),
        Err(_) => return Err(ProbeFailure::Connect("connect timed out".to_string())),
    };
    if !resp.status().is_success() {
        return Err(ProbeFailure::BadStatus(resp.status().as_u16()));
    }

    let mut stream = resp.bytes_stream();
    let mut bytes: u64 = 0;
    let mut first_byte: Option<Instant> = None;

    loop {
        let chunk = match timeout(cfg.probe_read_timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                if bytes == 0 {
                    return Err(ProbeFailure::Read(e.to_string()));
                }
                break;
            }
            Ok(None) => break,
            Err(_) => {
                if bytes == 0 {
                    return Err(ProbeFailure::Timeout);
                }
                break;
            }
        };
        let started = *first_byte.get_or_insert_with(Instant::now);
        bytes += chunk.len() as u64;
        if bytes >= cfg.probe_byte_ceiling || started.elapsed() >= cfg.probe_time_ceiling {
            break;
        }
    }

    let Some(started) = first_byte else {
        return Err(ProbeFailure::TooLittleData { bytes: 0 });
    };
    if bytes < cfg.probe_min_bytes {
        return Err(ProbeFailure::TooLittleData { bytes });
    }

    // A burst that fits in one chunk can report a zero-length window; clamp
    // so the sanity check below catches it instead of dividing by zero.
    let duration_secs = started.elapsed().as_secs_f64().max(1e-3);
    let speed = speed_mbps(bytes, duration_secs);
    if speed < cfg.speed_floor_mbps || speed > cfg.speed_ceiling_mbps {
        return Err(ProbeFailure::ImplausibleSpeed(speed));
    }

    Ok(SpeedTestResult {
        candidate,
        entry: entry.clone(),
        speed_mbps: speed,
        bytes,
        duration_secs,
        phase,
    })
}

/// Try entries in order until one probe succeeds, honoring the entry cap.
/// Later entries are never touched once a probe has succeeded.
pub async fn probe_until_success<'a, F, Fut>(
    entries: &[&'a CatalogEntry],
    cap: usize,
    mut probe: F,
) -> Option<SpeedTestResult>
where
    F: FnMut(&'a CatalogEntry) -> Fut,
    Fut: Future<Output = Result<SpeedTestResult, ProbeFailure>>,
{
    for entry in entries.iter().take(cap) {
        match probe(entry).await {
            Ok(result) => return Some(result),
            Err(e) => debug!(entry = %entry.tag(), error = %e, "probe failed"),
        }
    }
    None
}

/// Run the full two-phase speed test over the confirmed relays.
///
/// Phase 1 probes every relay against the home `(carrier, region)` entry
/// with a wider pool. Relays that fail move to phase 2, where a narrower
/// pool sweeps the rest of the catalog per relay, stopping at the first
/// success. At most one measurement is recorded per relay.
pub async fn run_two_phase(
    candidates: Vec<Candidate>,
    catalog: &Catalog,
    cfg: &RunConfig,
    client: &reqwest::Client,
    sink: Arc<ResultSink>,
    cancel: &CancellationToken,
) -> Result<Vec<SpeedTestResult>> {
    let home = catalog.lookup(cfg.carrier, &cfg.region).cloned();
    let mut results: Vec<SpeedTestResult> = Vec::new();
    let mut leftover: Vec<Candidate> = Vec::new();

    match home {
        Some(entry) => {
            let (ok, failed) = phase_one(&candidates, &entry, cfg, client, &sink, cancel).await?;
            results = ok;
            leftover = failed;
        }
        None => {
            warn!(
                carrier = %cfg.carrier,
                region = %cfg.region,
                "no home catalog entry, every relay goes straight to the catalog sweep"
            );
            leftover.extend(&candidates);
        }
    }

    if cfg.fast {
        info!(skipped = leftover.len(), "fast mode, skipping catalog sweep");
        return Ok(results);
    }
    if leftover.is_empty() {
        return Ok(results);
    }

    let swept = phase_two(leftover, catalog, cfg, client, &sink, cancel).await?;
    results.extend(swept);
    Ok(results)
}

async fn phase_one(
    candidates: &[Candidate],
    entry: &CatalogEntry,
    cfg: &RunConfig,
    client: &reqwest::Client,
    sink: &Arc<ResultSink>,
    cancel: &CancellationToken,
) -> Result<(Vec<SpeedTestResult>, Vec<Candidate>)> {
    info!(
        relays = candidates.len(),
        entry = %entry.tag(),
        workers = cfg.phase1_workers,
        "phase 1 starting"
    );
    let semaphore = Arc::new(Semaphore::new(cfg.phase1_workers));
    let ok = Arc::new(Mutex::new(Vec::new()));
    let failed = Arc::new(Mutex::new(Vec::new()));
    let mut set: JoinSet<Result<()>> = JoinSet::new();

    for &candidate in candidates {
        if cancel.is_cancelled() {
            break;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let entry = entry.clone();
        let cfg = cfg.clone();
        let client = client.clone();
        let sink = sink.clone();
        let ok = ok.clone();
        let failed = failed.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            let _permit = permit;
            let outcome = tokio::select! {
                r = stream_probe(&client, candidate, &entry, &cfg, Phase::One) => r,
                _ = cancel.cancelled() => return Ok(()),
            };
            match outcome {
                Ok(result) => {
                    sink.record_success(&result).await?;
                    ok.lock().await.push(result);
                }
                Err(e) => {
                    debug!(candidate = %candidate, error = %e, "phase 1 probe failed");
                    failed.lock().await.push(candidate);
                }
            }
            Ok(())
        });
    }

    while let Some(res) = set.join_next().await {
        res??;
    }

    let ok = Arc::try_unwrap(ok).map(Mutex::into_inner).unwrap_or_default();
    let failed = Arc::try_unwrap(failed)
        .map(Mutex::into_inner)
        .unwrap_or_default();
    info!(succeeded = ok.len(), failed = failed.len(), "phase 1 finished");
    Ok((ok, failed))
}

async fn phase_two(
    candidates: Vec<Candidate>,
    catalog: &Catalog,
    cfg: &RunConfig,
    client: &reqwest::Client,
    sink: &Arc<ResultSink>,
    cancel: &CancellationToken,
) -> Result<Vec<SpeedTestResult>> {
    let sweep: Vec<CatalogEntry> = catalog
        .all_except(cfg.carrier, &cfg.region)
        .into_iter()
        .cloned()
        .collect();
    if sweep.is_empty() {
        info!("catalog sweep list is empty, nothing to do in phase 2");
        return Ok(Vec::new());
    }
    info!(
        relays = candidates.len(),
        entries = sweep.len().min(cfg.phase2_entry_cap),
        workers = cfg.phase2_workers,
        "phase 2 starting"
    );

    let sweep = Arc::new(sweep);
    let semaphore = Arc::new(Semaphore::new(cfg.phase2_workers));
    let ok = Arc::new(Mutex::new(Vec::new()));
    let mut set: JoinSet<Result<()>> = JoinSet::new();

    for candidate in candidates {
        if cancel.is_cancelled() {
            break;
        }
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let sweep = sweep.clone();
        let cfg = cfg.clone();
        let client = client.clone();
        let sink = sink.clone();
        let ok = ok.clone();
        let cancel = cancel.clone();
        set.spawn(async move {
            let _permit = permit;
            let entries: Vec<&CatalogEntry> = sweep.iter().collect();
            let found = tokio::select! {
                r = probe_until_success(&entries, cfg.phase2_entry_cap, |entry| {
                    stream_probe(&client, candidate, entry, &cfg, Phase::Two)
                }) => r,
                _ = cancel.cancelled() => return Ok(()),
            };
            if let Some(result) = found {
                info!(
                    candidate = %candidate,
                    entry = %result.entry.tag(),
                    speed = format!("{:.3}", result.speed_mbps),
                    "phase 2 match"
                );
                sink.record_success(&result).await?;
                ok.lock().await.push(result);
            }
            Ok(())
        });
    }

    while let Some(res) = set.join_next().await {
        res??;
    }

    let ok = Arc::try_unwrap(ok).map(Mutex::into_inner).unwrap_or_default();
    info!(succeeded = ok.len(), "phase 2 finished");
    Ok(ok)
}
