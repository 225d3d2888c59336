use std::fs;
use std::sync::Arc;

use udpxy_scout::catalog::Catalog;
use udpxy_scout::config::RunConfig;
use udpxy_scout::sink::{load_previous_candidates, ResultSink};
use udpxy_scout::types::{Candidate, Carrier, Phase, SpeedTestResult};

fn setup() -> (tempfile::TempDir, RunConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = RunConfig::new("Shanghai".to_string(), Carrier::Telecom);
    cfg.catalog_dir = dir.path().to_path_buf();
    cfg.template_dir = dir.path().join("template");
    cfg.output_dir = dir.path().join("sum");

    fs::write(
        dir.path().join("Telecom_province_list.txt"),
        "Shanghai 3100 udp/239.45.3.209:5140\nZhejiang 3300 rtp/233.50.201.63:5140\n",
    )
    .expect("write catalog");
    (dir, cfg)
}

#[tokio::test]
async fn catalog_lookup_feeds_sink_playlist() {
    let (dir, cfg) = setup();
    let tpl_dir = cfg.template_dir.join("Telecom");
    fs::create_dir_all(&tpl_dir).expect("template dir");
    fs::write(
        tpl_dir.join("template_Shanghai.txt"),
        "CCTV1,http://ipipip/udp/239.45.3.209:5140\nCCTV2,http://ipipip/udp/239.45.3.210:5140\n",
    )
    .expect("write template");

    let catalog = Catalog::load(&cfg.catalog_dir, cfg.carrier).expect("load catalog");
    let entry = catalog
        .lookup(Carrier::Telecom, "Shanghai")
        .expect("home entry")
        .clone();

    let sink = Arc::new(ResultSink::new(&cfg).expect("sink"));
    let result = SpeedTestResult {
        candidate: "61.160.2.7:4022".parse::<Candidate>().expect("candidate"),
        entry,
        speed_mbps: 3.25,
        bytes: 2 * 1024 * 1024,
        duration_secs: 0.6,
        phase: Phase::One,
    };
    sink.record_success(&result).await.expect("record");

    let playlist =
        fs::read_to_string(cfg.output_dir.join("Telecom/Shanghai.txt")).expect("playlist");
    assert_eq!(
        playlist,
        "CCTV1,http://61.160.2.7:4022/udp/239.45.3.209:5140\n\
         CCTV2,http://61.160.2.7:4022/udp/239.45.3.210:5140\n"
    );

    let log = fs::read_to_string(cfg.output_dir.join("Telecom/speed_Shanghai.log")).expect("log");
    assert_eq!(log, "3.250  61.160.2.7:4022  [Telecom/Shanghai]\n");
    drop(dir);
}

#[test]
fn verified_dump_seeds_the_next_run() {
    let (dir, cfg) = setup();
    let sink = ResultSink::new(&cfg).expect("sink");
    let candidates: Vec<Candidate> = vec![
        "61.160.2.7:4022".parse().expect("candidate"),
        "112.26.10.1:8888".parse().expect("candidate"),
    ];
    sink.write_verified_dump(&candidates).expect("dump");

    assert_eq!(load_previous_candidates(&cfg), candidates);
    drop(dir);
}
