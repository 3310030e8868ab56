//! Test utilities shared by unit and integration tests.

pub mod packets;

use std::thread;
use std::time::{Duration, Instant};

use crate::catalog::{Catalog, Record, RecordType};
use crate::handler::QueryHandler;

pub use packets::{CLIENT_MAC, dns_query, query_frame, reply_payload};

/// Poll `cond` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Owner of the version marker in a probe catalog.
pub const PROBE_VERSION_NAME: &str = "version.probe.";

/// A catalog whose contents are fully determined by `version`: one TXT
/// marker naming the version plus `version` filler records.
pub fn probe_catalog(version: u64) -> Catalog {
    let mut catalog = Catalog::new();
    catalog.insert(
        "probe",
        Record::new(PROBE_VERSION_NAME, RecordType::TXT, 60, version.to_string()),
    );
    for i in 0..version {
        catalog.insert(
            "probe",
            Record::new(&format!("filler{i}.probe"), RecordType::A, 60, "192.0.2.1"),
        );
    }
    catalog
}

/// Answers every query with `"<version>/<record count>"` read from the
/// catalog it is handed. For a probe catalog the two always agree.
#[derive(Debug, Default)]
pub struct ProbeHandler;

impl QueryHandler for ProbeHandler {
    fn answer(&self, catalog: &Catalog, _query: &[u8], response: &mut Vec<u8>) -> bool {
        let version = catalog
            .lookup(PROBE_VERSION_NAME, RecordType::TXT)
            .and_then(|records| records.first())
            .map_or("none", |record| record.rdata.as_str());
        response.extend_from_slice(format!("{version}/{}", catalog.record_count()).as_bytes());
        true
    }
}

/// Parse a [`ProbeHandler`] reply into `(version, record count)`.
pub fn parse_probe(reply: &[u8]) -> Option<(u64, u64)> {
    let text = std::str::from_utf8(reply).ok()?;
    let (version, records) = text.split_once('/')?;
    Some((version.parse().ok()?, records.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_catalog_is_self_consistent() {
        let mut reply = Vec::new();
        assert!(ProbeHandler.answer(&probe_catalog(3), b"", &mut reply));
        assert_eq!(parse_probe(&reply), Some((3, 4)));
    }

    #[test]
    fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(5), || false));
        assert!(wait_until(Duration::from_millis(5), || true));
    }
}
