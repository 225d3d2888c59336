use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::types::{Candidate, SpeedTestResult, IP_PLACEHOLDER};

/// Serialized writer for everything a run produces on disk.
///
/// Layout under the output directory:
///
/// ```text
/// {output_dir}/{carrier}/speed_{region}.log   every successful measurement
/// {output_dir}/{carrier}/{entry_region}.txt   playlist blocks per matched entry
/// {output_dir}/{carrier}/{region}_sum.ip      deduped candidates before verification
/// {output_dir}/{carrier}/{region}_uniq.ip     verified relays, seed for the next run
/// ```
///
/// All writes go through one async mutex and flush per record, so a run
/// killed mid-flight keeps everything recorded up to that point. Output I/O
/// errors are fatal for the run.
pub struct ResultSink {
    carrier_dir: PathBuf,
    template_dir: PathBuf,
    region: String,
    playlist_min_mbps: f64,
    inner: Mutex<Inner>,
}

struct Inner {
    log: File,
    /// Template text per entry region; `None` caches a missing template so
    /// it is only warned about once.
    templates: HashMap<String, Option<String>>,
}

impl ResultSink {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        let carrier_dir = cfg.output_dir.join(cfg.carrier.as_str());
        fs::create_dir_all(&carrier_dir)
            .with_context(|| format!("creating output dir {}", carrier_dir.display()))?;
        let log_path = carrier_dir.join(format!("speed_{}.log", cfg.region));
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening speed log {}", log_path.display()))?;
        Ok(Self {
            carrier_dir,
            template_dir: cfg.template_dir.join(cfg.carrier.as_str()),
            region: cfg.region.clone(),
            playlist_min_mbps: cfg.playlist_min_mbps,
            inner: Mutex::new(Inner {
                log,
                templates: HashMap::new(),
            }),
        })
    }

    /// Record one successful measurement: always a speed log line, plus a
    /// substituted playlist block when the relay is fast enough and a
    /// template exists for the matched entry's region.
    pub async fn record_success(&self, result: &SpeedTestResult) -> Result<()> {
        let mut inner = self.inner.lock().await;

        writeln!(
            inner.log,
            "{:.3}  {}  [{}]",
            result.speed_mbps,
            result.candidate,
            result.entry.tag()
        )
        .context("writing speed log")?;
        inner.log.flush().context("flushing speed log")?;

        if result.speed_mbps < self.playlist_min_mbps {
            debug!(
                candidate = %result.candidate,
                speed = format!("{:.3}", result.speed_mbps),
                "below playlist threshold, logged only"
            );
            return Ok(());
        }

        let entry_region = result.entry.region.clone();
        if !inner.templates.contains_key(&entry_region) {
            let path = self
                .template_dir
                .join(format!("template_{entry_region}.txt"));
            let loaded = match fs::read_to_string(&path) {
                Ok(text) => Some(text),
                Err(_) => {
                    warn!(path = %path.display(), "playlist template missing, logging only");
                    None
                }
            };
            inner.templates.insert(entry_region.clone(), loaded);
        }
        let Some(template) = inner.templates.get(&entry_region).cloned().flatten() else {
            return Ok(());
        };

        let block = template.replace(IP_PLACEHOLDER, &result.candidate.to_string());
        let playlist = self.carrier_dir.join(format!("{entry_region}.txt"));
        append_flushed(&playlist, &block)
            .with_context(|| format!("writing playlist {}", playlist.display()))
    }

    /// Dump the deduplicated candidate list before verification.
    pub fn write_raw_dump(&self, candidates: &[Candidate]) -> Result<()> {
        let path = self.carrier_dir.join(format!("{}_sum.ip", self.region));
        write_candidate_file(&path, candidates)
    }

    /// Dump the relays that passed verification this run. The next run
    /// reads this back as its set of previously known candidates.
    pub fn write_verified_dump(&self, candidates: &[Candidate]) -> Result<()> {
        let path = self.carrier_dir.join(format!("{}_uniq.ip", self.region));
        write_candidate_file(&path, candidates)
    }
}

/// Candidates persisted by the previous run, if any. Unparseable lines are
/// skipped so a hand-edited file cannot poison a run.
pub fn load_previous_candidates(cfg: &RunConfig) -> Vec<Candidate> {
    let path = cfg
        .output_dir
        .join(cfg.carrier.as_str())
        .join(format!("{}_uniq.ip", cfg.region));
    let Ok(text) = fs::read_to_string(&path) else {
        return Vec::new();
    };
    let candidates: Vec<Candidate> = text
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    debug!(
        path = %path.display(),
        count = candidates.len(),
        "loaded candidates from previous run"
    );
    candidates
}

fn write_candidate_file(path: &Path, candidates: &[Candidate]) -> Result<()> {
    let mut text = String::new();
    for c in candidates {
        text.push_str(&c.to_string());
        text.push('\n');
    }
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

fn append_flushed(path: &Path, block: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(block.as_bytes())?;
    if !block.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Carrier, CatalogEntry, Phase};

    fn test_config(root: &Path) -> RunConfig {
        let mut cfg = RunConfig::new("Shanghai".to_string(), Carrier::Telecom);
        cfg.output_dir = root.join("sum");
        cfg.template_dir = root.join("template");
        cfg
    }

    fn result(speed: f64, region: &str) -> SpeedTestResult {
        SpeedTestResult {
            candidate: "1.2.3.4:4022".parse().unwrap(),
            entry: CatalogEntry {
                carrier: Carrier::Telecom,
                region: region.to_string(),
                city_id: "3100".to_string(),
                stream_path: "udp/239.45.3.209:5140".to_string(),
            },
            speed_mbps: speed,
            bytes: 2 * 1024 * 1024,
            duration_secs: 2.0,
            phase: Phase::One,
        }
    }

    #[tokio::test]
    async fn success_writes_log_line_and_playlist_block() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let tpl_dir = cfg.template_dir.join("Telecom");
        fs::create_dir_all(&tpl_dir).unwrap();
        fs::write(
            tpl_dir.join("template_Shanghai.txt"),
            "CCTV1,http://ipipip/udp/239.45.3.209:5140\n",
        )
        .unwrap();

        let sink = ResultSink::new(&cfg).unwrap();
        sink.record_success(&result(1.5, "Shanghai")).await.unwrap();

        let log =
            fs::read_to_string(cfg.output_dir.join("Telecom/speed_Shanghai.log")).unwrap();
        assert_eq!(log, "1.500  1.2.3.4:4022  [Telecom/Shanghai]\n");

        let playlist = fs::read_to_string(cfg.output_dir.join("Telecom/Shanghai.txt")).unwrap();
        assert_eq!(playlist, "CCTV1,http://1.2.3.4:4022/udp/239.45.3.209:5140\n");
    }

    #[tokio::test]
    async fn slow_relay_is_logged_but_kept_out_of_playlists() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let sink = ResultSink::new(&cfg).unwrap();
        sink.record_success(&result(0.08, "Shanghai")).await.unwrap();

        let log =
            fs::read_to_string(cfg.output_dir.join("Telecom/speed_Shanghai.log")).unwrap();
        assert!(log.starts_with("0.080  "));
        assert!(!cfg.output_dir.join("Telecom/Shanghai.txt").exists());
    }

    #[tokio::test]
    async fn missing_template_still_logs_the_measurement() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let sink = ResultSink::new(&cfg).unwrap();
        sink.record_success(&result(2.0, "Zhejiang")).await.unwrap();

        let log =
            fs::read_to_string(cfg.output_dir.join("Telecom/speed_Shanghai.log")).unwrap();
        assert!(log.contains("2.000  1.2.3.4:4022"));
        assert!(!cfg.output_dir.join("Telecom/Zhejiang.txt").exists());
    }

    #[test]
    fn verified_dump_roundtrips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let sink = ResultSink::new(&cfg).unwrap();
        let candidates: Vec<Candidate> = vec![
            "1.2.3.4:4022".parse().unwrap(),
            "5.6.7.8:8888".parse().unwrap(),
        ];
        sink.write_verified_dump(&candidates).unwrap();

        let loaded = load_previous_candidates(&cfg);
        assert_eq!(loaded, candidates);
    }

    #[test]
    fn missing_previous_dump_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        assert!(load_previous_candidates(&cfg).is_empty());
    }
}
