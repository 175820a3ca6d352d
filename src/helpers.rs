//! Shared helpers: Decimal → f64 conversion for API/KML output, lenient
//! date/flag parsing for source and override cells, and atomic file writes.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::io::Write as _;
use std::path::Path;

/// Convert an Option<Decimal> to Option<f64>.
pub(crate) fn opt_dec_to_f64(d: Option<Decimal>) -> Option<f64> {
    d.and_then(|v| v.to_f64())
}

/// Date formats seen across the override sheet and source exports.
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%d %b %Y", "%d-%b-%Y"];

/// Parse a calendar date in any of the accepted formats.
///
/// Timestamps like "2025-06-01T14:00:00" are accepted by looking at the first
/// ten characters only.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| {
            s.get(..10)
                .and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok())
        })
}

/// Parse a yes/no spreadsheet cell. Blank is `Ok(None)`; anything unrecognised is an error.
pub(crate) fn parse_flag(raw: &str) -> Result<Option<bool>, String> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "" => Ok(None),
        "Y" | "YES" | "TRUE" | "1" | "X" => Ok(Some(true)),
        "N" | "NO" | "FALSE" | "0" => Ok(Some(false)),
        other => Err(format!("unrecognised flag value '{}'", other)),
    }
}

/// Write `bytes` to `path` via a temp file + fsync + rename, so readers only
/// ever see the previous content or the complete new content.
pub(crate) fn write_atomic_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|s| s.to_str()).unwrap_or("file"),
        std::process::id()
    ));
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
