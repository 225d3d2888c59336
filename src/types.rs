use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Placeholder token that catalog stream paths and playlist templates use
/// where a relay's `ip:port` must be substituted.
pub const IP_PLACEHOLDER: &str = "ipipip";

/// An `ip:port` pair suspected of running a udpxy relay.
///
/// Identity is the `ip:port` string; two candidates with the same address and
/// port are the same candidate regardless of which backend reported them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Candidate {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The candidate's /24 network, used as a coarse "same site" heuristic
    /// when collapsing near-duplicate hosts.
    pub fn subnet(&self) -> Ipv4Net {
        let o = self.ip.octets();
        Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24).expect("/24 is always valid")
    }

    /// Key for subnet-level dedup: same /24 and same port collapse together.
    pub fn subnet_key(&self) -> (Ipv4Net, u16) {
        (self.subnet(), self.port)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Candidate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("missing ':' in candidate: {s}"))?;
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid IPv4 address: {ip}"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid port: {port}"))?;
        if port == 0 {
            anyhow::bail!("port out of range: 0");
        }
        Ok(Self { ip, port })
    }
}

/// A backend-tagged candidate as returned by one search provider.
/// Discarded once candidates have been deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHit {
    pub candidate: Candidate,
    pub backend: &'static str,
    pub org: Option<String>,
}

/// Network operator category selecting the channel template set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Carrier {
    Telecom,
    Unicom,
    Mobile,
}

impl Carrier {
    pub const ALL: [Carrier; 3] = [Carrier::Telecom, Carrier::Unicom, Carrier::Mobile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::Telecom => "Telecom",
            Carrier::Unicom => "Unicom",
            Carrier::Mobile => "Mobile",
        }
    }

    /// Catalog file name for this carrier, e.g. `Telecom_province_list.txt`.
    pub fn catalog_file(&self) -> String {
        format!("{}_province_list.txt", self.as_str())
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Carrier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telecom" => Ok(Carrier::Telecom),
            "unicom" => Ok(Carrier::Unicom),
            "mobile" => Ok(Carrier::Mobile),
            other => anyhow::bail!("unknown carrier: {other} (expected Telecom/Unicom/Mobile)"),
        }
    }
}

/// One `(carrier, region) -> (city, stream path)` mapping from the catalog
/// files. Read-only after load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub carrier: Carrier,
    pub region: String,
    pub city_id: String,
    pub stream_path: String,
}

impl CatalogEntry {
    /// Short tag used in result logs, e.g. `Telecom/Shanghai`.
    pub fn tag(&self) -> String {
        format!("{}/{}", self.carrier, self.region)
    }
}

/// Outcome of fingerprinting one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub candidate: Candidate,
    pub is_target: bool,
    /// Active client count from the relay's status page, when it could be
    /// fetched and parsed. Diagnostic only.
    pub active_connections: Option<u32>,
}

/// Which pass of the speed tester produced a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    One,
    Two,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::One => f.write_str("1"),
            Phase::Two => f.write_str("2"),
        }
    }
}

/// A successful throughput measurement for one (candidate, entry) pairing.
/// At most one is recorded per candidate in a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedTestResult {
    pub candidate: Candidate,
    pub entry: CatalogEntry,
    pub speed_mbps: f64,
    pub bytes: u64,
    pub duration_secs: f64,
    pub phase: Phase,
}

/// Average throughput in MB/s (mebibytes) for a download of `bytes` over
/// `duration_secs` seconds.
pub fn speed_mbps(bytes: u64, duration_secs: f64) -> f64 {
    bytes as f64 / duration_secs / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_parse_and_display_roundtrip() {
        let c: Candidate = "1.2.3.4:8080".parse().unwrap();
        assert_eq!(c.ip, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(c.port, 8080);
        assert_eq!(c.to_string(), "1.2.3.4:8080");
    }

    #[test]
    fn candidate_rejects_garbage() {
        assert!("1.2.3.4".parse::<Candidate>().is_err());
        assert!("not-an-ip:80".parse::<Candidate>().is_err());
        assert!("1.2.3.4:0".parse::<Candidate>().is_err());
        assert!("1.2.3.4:99999".parse::<Candidate>().is_err());
    }

    #[test]
    fn subnet_key_groups_by_c_segment_and_port() {
        let a: Candidate = "1.2.3.4:80".parse().unwrap();
        let b: Candidate = "1.2.3.250:80".parse().unwrap();
        let c: Candidate = "1.2.4.4:80".parse().unwrap();
        let d: Candidate = "1.2.3.4:81".parse().unwrap();
        assert_eq!(a.subnet_key(), b.subnet_key());
        assert_ne!(a.subnet_key(), c.subnet_key());
        assert_ne!(a.subnet_key(), d.subnet_key());
        assert_eq!(a.subnet().to_string(), "1.2.3.0/24");
    }

    #[test]
    fn speed_is_bytes_per_second_in_mebibytes() {
        let s = speed_mbps(2_097_152, 2.0);
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn carrier_parse_is_case_insensitive() {
        assert_eq!("telecom".parse::<Carrier>().unwrap(), Carrier::Telecom);
        assert_eq!("MOBILE".parse::<Carrier>().unwrap(), Carrier::Mobile);
        assert!("cable".parse::<Carrier>().is_err());
        assert_eq!(Carrier::Unicom.catalog_file(), "Unicom_province_list.txt");
    }
}
