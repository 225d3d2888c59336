use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use udpxy_scout::catalog::Catalog;
use udpxy_scout::config::{Credentials, RunConfig};
use udpxy_scout::search::{self, FofaBackend, QuakeBackend, SearchBackend};
use udpxy_scout::sink::{self, ResultSink};
use udpxy_scout::speedtest;
use udpxy_scout::types::{Candidate, Carrier, SpeedTestResult};
use udpxy_scout::{dedupe, verify};

/// udpxy-scout — Discovers public udpxy relays, verifies them over the wire
/// and speed-tests channel templates into playlists.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "udpxy-scout",
    version,
    about = "Discovers public udpxy relays via asset-search engines, verifies them and speed-tests channel templates into playlists.",
    long_about = None
)]
struct Cli {
    /// Province/region to search, matching the catalog spelling (e.g., Shanghai).
    region: String,

    /// Carrier whose channel templates to test: Telecom, Unicom or Mobile.
    carrier: Carrier,

    /// Skip the exhaustive cross-catalog sweep for relays that fail phase 1.
    #[arg(long, default_value_t = false)]
    fast: bool,

    /// Max result pages fetched per search backend.
    #[arg(long, default_value_t = 10)]
    max_pages: usize,

    /// Directory holding the {Carrier}_province_list.txt catalog files.
    #[arg(long, default_value = ".")]
    catalog_dir: PathBuf,

    /// Directory holding per-carrier playlist templates.
    #[arg(long, default_value = "template")]
    template_dir: PathBuf,

    /// Root directory for playlists, logs and candidate dumps.
    #[arg(long, default_value = "sum")]
    output_dir: PathBuf,

    /// FOFA API key. A missing key disables the FOFA backend.
    #[arg(long, env = "FOFA_API_KEY", hide_env_values = true)]
    fofa_key: Option<String>,

    /// User-Agent header for search API requests.
    #[arg(long, env = "FOFA_USER_AGENT")]
    fofa_user_agent: Option<String>,

    /// Quake360 API token. A missing token disables the Quake backend.
    #[arg(long, env = "QUAKE360_TOKEN", hide_env_values = true)]
    quake_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = RunConfig::new(cli.region, cli.carrier);
    cfg.fast = cli.fast;
    cfg.max_pages = cli.max_pages;
    cfg.catalog_dir = cli.catalog_dir;
    cfg.template_dir = cli.template_dir;
    cfg.output_dir = cli.output_dir;
    cfg.credentials = Credentials {
        fofa_api_key: cli.fofa_key,
        fofa_user_agent: cli.fofa_user_agent,
        quake_token: cli.quake_token,
    };

    println!("udpxy-scout configuration:");
    println!("  region       : {}", cfg.region);
    println!("  carrier      : {}", cfg.carrier);
    println!("  fast         : {}", cfg.fast);
    println!("  max_pages    : {}", cfg.max_pages);
    println!("  catalog_dir  : {}", cfg.catalog_dir.display());
    println!("  template_dir : {}", cfg.template_dir.display());
    println!("  output_dir   : {}", cfg.output_dir.display());
    println!(
        "  backends     : fofa={} quake360={}",
        cfg.credentials.fofa_api_key.is_some(),
        cfg.credentials.quake_token.is_some()
    );

    let catalog = Catalog::load(&cfg.catalog_dir, cfg.carrier)?;
    info!(entries = catalog.len(), "catalog loaded");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupt received, finishing in-flight work...");
                cancel.cancel();
            }
        });
    }

    let client = reqwest::Client::builder()
        .user_agent(
            cfg.credentials
                .fofa_user_agent
                .clone()
                .unwrap_or_else(|| "Mozilla/5.0".to_string()),
        )
        .connect_timeout(cfg.connect_timeout)
        .timeout(Duration::from_secs(60))
        .build()
        .context("building HTTP client")?;

    // Previously persisted candidates are re-tested every run and win dedup
    // conflicts against fresh discoveries.
    let existing = sink::load_previous_candidates(&cfg);
    if !existing.is_empty() {
        println!("Loaded {} candidates from the previous run", existing.len());
    }

    let mut backends: Vec<Box<dyn SearchBackend>> = Vec::new();
    match FofaBackend::from_config(&cfg) {
        Some(b) => backends.push(Box::new(b)),
        None => warn!("FOFA backend disabled (no API key)"),
    }
    match QuakeBackend::from_config(&cfg) {
        Some(b) => backends.push(Box::new(b)),
        None => warn!("Quake360 backend disabled (no token)"),
    }

    let mut fresh: Vec<Candidate> = search::aggregate(backends).await.into_iter().collect();
    fresh.sort_by_key(|c| (c.ip, c.port));
    println!("Search backends returned {} distinct candidates", fresh.len());

    let candidates = dedupe::dedupe(&existing, &fresh);
    if candidates.is_empty() {
        println!("No candidates found for {} / {}", cfg.region, cfg.carrier);
        return Ok(());
    }
    println!("{} candidates after dedup", candidates.len());

    let sink = Arc::new(ResultSink::new(&cfg)?);
    sink.write_raw_dump(&candidates)?;

    let confirmed = verify::verify_all(candidates, &cfg, &client, &cancel).await;
    let confirmed: Vec<Candidate> = confirmed.into_iter().map(|v| v.candidate).collect();
    sink.write_verified_dump(&confirmed)?;
    if confirmed.is_empty() {
        println!("No udpxy relays confirmed; nothing to speed-test");
        return Ok(());
    }
    println!("{} relays confirmed as udpxy", confirmed.len());

    let mut results =
        speedtest::run_two_phase(confirmed, &catalog, &cfg, &client, sink.clone(), &cancel)
            .await?;
    results.sort_by(|a, b| b.speed_mbps.total_cmp(&a.speed_mbps));
    print_results_table(&results);

    Ok(())
}

fn print_results_table(results: &[SpeedTestResult]) {
    if results.is_empty() {
        println!("\nNo relay delivered a usable stream");
        return;
    }
    let mut addr_w = "relay".len();
    let mut tag_w = "entry".len();
    for r in results {
        addr_w = addr_w.max(r.candidate.to_string().len());
        tag_w = tag_w.max(r.entry.tag().len());
    }

    println!("\nUsable relays: {}", results.len());
    println!(
        "{:<addr_w$}  {:>9}  {:<tag_w$}  {:>5}",
        "relay",
        "MB/s",
        "entry",
        "phase",
        addr_w = addr_w,
        tag_w = tag_w
    );
    println!(
        "{:-<addr_w$}  {:-<9}  {:-<tag_w$}  {:-<5}",
        "",
        "",
        "",
        "",
        addr_w = addr_w,
        tag_w = tag_w
    );
    for r in results {
        println!(
            "{:<addr_w$}  {:>9.3}  {:<tag_w$}  {:>5}",
            r.candidate.to_string(),
            r.speed_mbps,
            r.entry.tag(),
            r.phase.to_string(),
            addr_w = addr_w,
            tag_w = tag_w
        );
    }
}
