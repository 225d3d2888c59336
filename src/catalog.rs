use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::types::{Carrier, CatalogEntry};

/// In-memory view of the per-carrier province list files.
///
/// Each carrier's catalog lives in `{Carrier}_province_list.txt` next to the
/// binary, one entry per line: `region city_id stream_path`, whitespace
/// separated. The file for the carrier under test must exist; the other
/// carriers' files are loaded opportunistically for the phase-2 cross-carrier
/// sweep.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Load every available catalog file from `dir`. Fails only when the
    /// file for `required` is missing or unreadable.
    pub fn load(dir: &Path, required: Carrier) -> Result<Self> {
        let mut entries = Vec::new();
        for carrier in Carrier::ALL {
            let path = dir.join(carrier.catalog_file());
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) if carrier == required => {
                    return Err(e)
                        .with_context(|| format!("reading catalog {}", path.display()));
                }
                Err(_) => {
                    debug!(carrier = %carrier, path = %path.display(), "catalog file absent, skipping");
                    continue;
                }
            };
            let before = entries.len();
            parse_catalog(&text, carrier, &mut entries);
            debug!(carrier = %carrier, entries = entries.len() - before, "catalog loaded");
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The entry for one exact `(carrier, region)` pair, if the catalog has
    /// it. Region comparison is case-sensitive, matching the files.
    pub fn lookup(&self, carrier: Carrier, region: &str) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.carrier == carrier && e.region == region)
    }

    /// Every entry except the `(carrier, region)` pair already tried in
    /// phase 1, in stable file order. This is the phase-2 sweep list.
    pub fn all_except(&self, carrier: Carrier, region: &str) -> Vec<&CatalogEntry> {
        self.entries
            .iter()
            .filter(|e| !(e.carrier == carrier && e.region == region))
            .collect()
    }
}

fn parse_catalog(text: &str, carrier: Carrier, out: &mut Vec<CatalogEntry>) {
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(region), Some(city_id), Some(stream_path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!(
                carrier = %carrier,
                line = lineno + 1,
                content = line,
                "malformed catalog row, skipping"
            );
            continue;
        };
        out.push(CatalogEntry {
            carrier,
            region: region.to_string(),
            city_id: city_id.to_string(),
            stream_path: stream_path.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const TELECOM: &str = "\
Shanghai 3100 udp/239.45.3.209:5140
Zhejiang 3300 rtp/233.50.201.63:5140
";
    const UNICOM: &str = "\
Beijing 1100 udp/225.1.8.1:8002

# comment line
Shandong 3700 udp/225.0.4.188:7980
broken_row_with_one_field
";

    fn write_catalogs(dir: &Path) {
        fs::write(dir.join("Telecom_province_list.txt"), TELECOM).unwrap();
        fs::write(dir.join("Unicom_province_list.txt"), UNICOM).unwrap();
    }

    #[test]
    fn loads_required_and_optional_catalogs() {
        let dir = tempfile::tempdir().unwrap();
        write_catalogs(dir.path());
        let cat = Catalog::load(dir.path(), Carrier::Telecom).unwrap();
        // Mobile file is absent but not required, so the load succeeds.
        assert_eq!(cat.len(), 4);
        let entry = cat.lookup(Carrier::Telecom, "Shanghai").unwrap();
        assert_eq!(entry.city_id, "3100");
        assert_eq!(entry.stream_path, "udp/239.45.3.209:5140");
        assert!(cat.lookup(Carrier::Mobile, "Shanghai").is_none());
    }

    #[test]
    fn missing_required_catalog_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_catalogs(dir.path());
        let err = Catalog::load(dir.path(), Carrier::Mobile).unwrap_err();
        assert!(err.to_string().contains("Mobile_province_list.txt"));
    }

    #[test]
    fn malformed_rows_and_comments_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_catalogs(dir.path());
        let cat = Catalog::load(dir.path(), Carrier::Unicom).unwrap();
        let unicom: Vec<_> = cat
            .all_except(Carrier::Telecom, "")
            .into_iter()
            .filter(|e| e.carrier == Carrier::Unicom)
            .cloned()
            .collect();
        assert_eq!(unicom.len(), 2);
        assert_eq!(unicom[0].region, "Beijing");
        assert_eq!(unicom[1].region, "Shandong");
    }

    #[test]
    fn all_except_preserves_file_order_and_omits_the_pair() {
        let dir = tempfile::tempdir().unwrap();
        write_catalogs(dir.path());
        let cat = Catalog::load(dir.path(), Carrier::Telecom).unwrap();
        let rest = cat.all_except(Carrier::Telecom, "Shanghai");
        let tags: Vec<_> = rest.iter().map(|e| e.tag()).collect();
        assert_eq!(
            tags,
            vec!["Telecom/Zhejiang", "Unicom/Beijing", "Unicom/Shandong"]
        );
    }
}
