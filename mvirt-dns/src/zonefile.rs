//! Loading zonefiles into the control plane's private catalog.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{Catalog, Record, RecordType, normalize_name};
use crate::config::Configuration;

/// TTL used when a file sets none.
pub const DEFAULT_TTL: u32 = 3600;

#[derive(Debug, Error)]
pub enum ZonefileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Totals reported by a successful load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub files: u64,
    pub bytes: u64,
    pub records: u64,
}

/// Populates `db_load` from the zonefiles named by a configuration.
///
/// On error the catalog may be partially filled; the caller discards it.
pub trait ZonefileLoader {
    fn parse_all(
        &self,
        db_load: &mut Catalog,
        config: &Configuration,
    ) -> Result<LoadStats, ZonefileError>;
}

impl<F> ZonefileLoader for F
where
    F: Fn(&mut Catalog, &Configuration) -> Result<LoadStats, ZonefileError>,
{
    fn parse_all(
        &self,
        db_load: &mut Catalog,
        config: &Configuration,
    ) -> Result<LoadStats, ZonefileError> {
        self(db_load, config)
    }
}

/// Line-oriented zonefile reader.
///
/// One record per line: `owner [ttl] [class] type rdata...`. Supports
/// `$ORIGIN`, `$TTL`, `@`, relative owners, a blank owner repeating the
/// previous one, and `;` comments. Multi-line records are not supported.
#[derive(Debug, Default)]
pub struct TextZonefileLoader;

impl TextZonefileLoader {
    /// Parse one file's text into `catalog`. The initial origin is derived
    /// from the file name (`example.com.zone` → `example.com.`).
    pub fn parse_text(
        &self,
        catalog: &mut Catalog,
        path: &Path,
        text: &str,
    ) -> Result<u64, ZonefileError> {
        let syntax = |line: usize, message: String| ZonefileError::Syntax {
            path: path.to_path_buf(),
            line,
            message,
        };

        let mut origin = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(normalize_name)
            .unwrap_or_else(|| ".".to_string());
        let mut default_ttl = DEFAULT_TTL;
        let mut last_owner: Option<String> = None;
        let mut records = 0u64;

        for (index, raw_line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.split(';').next().unwrap_or_default();
            if line.trim().is_empty() {
                continue;
            }
            let inherits_owner = line.starts_with(char::is_whitespace);
            let mut fields = line.split_whitespace().peekable();

            match fields.peek().copied() {
                Some("$ORIGIN") => {
                    fields.next();
                    let value = fields
                        .next()
                        .ok_or_else(|| syntax(line_no, "$ORIGIN needs a name".into()))?;
                    origin = absolute(value, &origin);
                    continue;
                }
                Some("$TTL") => {
                    fields.next();
                    default_ttl = fields
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| syntax(line_no, "$TTL needs a number".into()))?;
                    continue;
                }
                Some(directive) if directive.starts_with('$') => {
                    return Err(syntax(line_no, format!("unsupported directive {directive}")));
                }
                _ => {}
            }

            let owner = if inherits_owner {
                last_owner
                    .clone()
                    .ok_or_else(|| syntax(line_no, "no previous owner".into()))?
            } else {
                let owner = fields.next().unwrap_or_default();
                absolute(owner, &origin)
            };

            let mut ttl = default_ttl;
            let mut rtype = None;
            for field in fields.by_ref() {
                if let Ok(value) = field.parse::<u32>() {
                    ttl = value;
                } else if field.eq_ignore_ascii_case("IN") {
                    continue;
                } else {
                    rtype = Some(
                        field
                            .parse::<RecordType>()
                            .map_err(|_| syntax(line_no, format!("unknown type {field}")))?,
                    );
                    break;
                }
            }
            let rtype = rtype.ok_or_else(|| syntax(line_no, "missing record type".into()))?;
            let rdata = fields.collect::<Vec<_>>().join(" ");
            if rdata.is_empty() {
                return Err(syntax(line_no, format!("{rtype} record without data")));
            }

            catalog.insert(&origin, Record::new(&owner, rtype, ttl, rdata));
            last_owner = Some(owner);
            records += 1;
        }

        Ok(records)
    }
}

impl ZonefileLoader for TextZonefileLoader {
    fn parse_all(
        &self,
        db_load: &mut Catalog,
        config: &Configuration,
    ) -> Result<LoadStats, ZonefileError> {
        let mut stats = LoadStats::default();
        for path in &config.zonefiles {
            let text = std::fs::read_to_string(path).map_err(|source| ZonefileError::Io {
                path: path.clone(),
                source,
            })?;
            let records = self.parse_text(db_load, path, &text)?;
            debug!(path = %path.display(), records, "parsed zonefile");

            stats.files += 1;
            stats.bytes += text.len() as u64;
            stats.records += records;
        }
        info!(
            files = stats.files,
            bytes = stats.bytes,
            records = stats.records,
            "loaded zonefiles"
        );
        Ok(stats)
    }
}

fn absolute(name: &str, origin: &str) -> String {
    if name == "@" {
        origin.to_string()
    } else if name.ends_with('.') {
        normalize_name(name)
    } else if origin == "." {
        normalize_name(name)
    } else {
        normalize_name(&format!("{name}.{origin}"))
    }
}
