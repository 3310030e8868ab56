//! In-memory zone database.
//!
//! A `Catalog` is built privately by the control plane (`db_load`) and, once
//! published, never changes again. Workers look records up through shared
//! references only.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A DNS record type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: RecordType = RecordType(1);
    pub const NS: RecordType = RecordType(2);
    pub const CNAME: RecordType = RecordType(5);
    pub const SOA: RecordType = RecordType(6);
    pub const PTR: RecordType = RecordType(12);
    pub const MX: RecordType = RecordType(15);
    pub const TXT: RecordType = RecordType(16);
    pub const AAAA: RecordType = RecordType(28);
    pub const SRV: RecordType = RecordType(33);

    const NAMES: [(RecordType, &'static str); 9] = [
        (RecordType::A, "A"),
        (RecordType::NS, "NS"),
        (RecordType::CNAME, "CNAME"),
        (RecordType::SOA, "SOA"),
        (RecordType::PTR, "PTR"),
        (RecordType::MX, "MX"),
        (RecordType::TXT, "TXT"),
        (RecordType::AAAA, "AAAA"),
        (RecordType::SRV, "SRV"),
    ];
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::NAMES.iter().find(|(t, _)| t == self) {
            Some((_, name)) => f.write_str(name),
            None => write!(f, "TYPE{}", self.0),
        }
    }
}

impl FromStr for RecordType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((t, _)) = Self::NAMES.iter().find(|(_, n)| n.eq_ignore_ascii_case(s)) {
            return Ok(*t);
        }
        let code = s
            .get(..4)
            .filter(|p| p.eq_ignore_ascii_case("TYPE"))
            .and_then(|_| s[4..].parse().ok())
            .ok_or(())?;
        Ok(RecordType(code))
    }
}

/// Lower-case a name and make it absolute.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = name.to_ascii_lowercase();
    if !normalized.ends_with('.') {
        normalized.push('.');
    }
    normalized
}

/// One resource record. `rdata` is kept in presentation form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub ttl: u32,
    pub rdata: String,
}

impl Record {
    pub fn new(name: &str, rtype: RecordType, ttl: u32, rdata: impl Into<String>) -> Self {
        Self {
            name: normalize_name(name),
            rtype,
            ttl,
            rdata: rdata.into(),
        }
    }
}

/// Records under one origin.
#[derive(Debug, Clone, Default)]
pub struct Zone {
    origin: String,
    records: BTreeMap<(String, RecordType), Vec<Record>>,
}

impl Zone {
    pub fn new(origin: &str) -> Self {
        Self {
            origin: normalize_name(origin),
            records: BTreeMap::new(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn insert(&mut self, record: Record) {
        self.records
            .entry((record.name.clone(), record.rtype))
            .or_default()
            .push(record);
    }

    pub fn lookup(&self, name: &str, rtype: RecordType) -> Option<&[Record]> {
        self.records
            .get(&(normalize_name(name), rtype))
            .map(Vec::as_slice)
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

/// The zone database.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    zones: BTreeMap<String, Zone>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The zone for `origin`, created empty if missing.
    pub fn zone_mut(&mut self, origin: &str) -> &mut Zone {
        let origin = normalize_name(origin);
        self.zones
            .entry(origin.clone())
            .or_insert_with(|| Zone::new(&origin))
    }

    /// Insert `record` into the zone at `origin`.
    pub fn insert(&mut self, origin: &str, record: Record) {
        self.zone_mut(origin).insert(record);
    }

    /// The zone with the longest origin that `name` falls under.
    pub fn find_zone(&self, name: &str) -> Option<&Zone> {
        let name = normalize_name(name);
        let mut candidate = name.as_str();
        loop {
            if let Some(zone) = self.zones.get(candidate) {
                return Some(zone);
            }
            if candidate == "." {
                return None;
            }
            candidate = match candidate.find('.') {
                Some(i) if i + 1 < candidate.len() => &candidate[i + 1..],
                _ => ".",
            };
        }
    }

    pub fn lookup(&self, name: &str, rtype: RecordType) -> Option<&[Record]> {
        self.find_zone(name)?.lookup(name, rtype)
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn record_count(&self) -> usize {
        self.zones.values().map(Zone::record_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}
