use std::path::PathBuf;
use std::time::Duration;

use crate::types::Carrier;

/// Immutable per-run configuration, constructed once in `main` and passed by
/// reference into every component. There is no other configuration state.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub region: String,
    pub carrier: Carrier,

    /// Skip the exhaustive phase-2 template search.
    pub fast: bool,

    /// Ceiling on result pages fetched per search backend.
    pub max_pages: usize,

    pub verify_workers: usize,
    pub phase1_workers: usize,
    pub phase2_workers: usize,
    /// Hard cap on catalog entries tried per candidate during phase 2.
    pub phase2_entry_cap: usize,

    pub connect_timeout: Duration,
    pub probe_read_timeout: Duration,
    /// Stop a stream probe once this many bytes have arrived.
    pub probe_byte_ceiling: u64,
    /// Stop a stream probe this long after the first byte arrived.
    pub probe_time_ceiling: Duration,
    /// Probes that deliver fewer bytes than this are failures even on HTTP 200.
    pub probe_min_bytes: u64,
    /// Sanity bounds for a computed MB/s figure; outside means a clock anomaly
    /// or a non-stream response, not a usable relay.
    pub speed_floor_mbps: f64,
    pub speed_ceiling_mbps: f64,
    /// Minimum speed for a result to make it into the generated playlists.
    pub playlist_min_mbps: f64,

    pub catalog_dir: PathBuf,
    pub template_dir: PathBuf,
    pub output_dir: PathBuf,

    pub credentials: Credentials,
}

/// API credentials for the search backends. A backend with missing
/// credentials is disabled for the run rather than failing it.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub fofa_api_key: Option<String>,
    pub fofa_user_agent: Option<String>,
    pub quake_token: Option<String>,
}

impl RunConfig {
    pub fn new(region: String, carrier: Carrier) -> Self {
        Self {
            region,
            carrier,
            fast: false,
            max_pages: 10,
            verify_workers: 30,
            phase1_workers: 8,
            phase2_workers: 3,
            phase2_entry_cap: 96,
            connect_timeout: Duration::from_secs(3),
            probe_read_timeout: Duration::from_secs(5),
            probe_byte_ceiling: 2 * 1024 * 1024,
            probe_time_ceiling: Duration::from_secs(8),
            probe_min_bytes: 256 * 1024,
            speed_floor_mbps: 0.05,
            speed_ceiling_mbps: 1000.0,
            playlist_min_mbps: 0.1,
            catalog_dir: PathBuf::from("."),
            template_dir: PathBuf::from("template"),
            output_dir: PathBuf::from("sum"),
            credentials: Credentials::default(),
        }
    }
}

/// Substring fingerprints identifying the udpxy daemon in a raw HTTP
/// response. Each inner group is AND-ed; any group matching marks the
/// candidate as the target service. The groups overlap on purpose: they are
/// carried over from field-observed daemon builds, and a single match is
/// sufficient.
pub const UDPXY_FINGERPRINTS: &[&[&str]] = &[
    &["server:", "udpxy"],
    &["udpxy", "unrecognized request"],
    &["udpxy", "1.0-"],
    &["udpxy", "0."],
    &["udpxy", "prod"],
    &["udpxy", "standard"],
    &["400", "unrecognized request", "server:"],
    &["server: udpxy"],
    &["udpxy"],
];
