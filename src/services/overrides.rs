//! Human-maintained override sheet (CSV export).
//!
//! One row per airport. Columns (header names, any order):
//!
//! | column            | meaning                                        |
//! |-------------------|------------------------------------------------|
//! | `ICAO`            | airport identifier (required)                  |
//! | `BLACKLIST`       | flag: always exclude                           |
//! | `WHITELIST`       | flag: always include                           |
//! | `CATEGORY`        | 0–3 restriction tier                           |
//! | `COMMENT`         | free text shown on the map                     |
//! | `COMMENT_DATE`    | date the comment was written                   |
//! | `RECENTLY_LANDED` | flag: counts as recent verified ops            |
//! | `DATE_LANDED`     | last landing date (wins over the flights feed) |
//! | `FRONT_SEAT`, `BACK_SEAT` | crew for `DATE_LANDED` (optional)      |
//! | `LANDING_ISSUES`  | flag: recent landing had problems              |
//! | `LATITUDE`, `LONGITUDE` | fallback coordinates for whitelisted fields |
//!
//! A bad identifier, list flag, or category rejects the row. A bad cell in an
//! informational column is reported and cleared, and the rest of the row still
//! applies. The rest of the sheet always applies.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use utoipa::ToSchema;

use crate::errors::Diagnostic;
use crate::helpers::{parse_date, parse_flag};
use crate::models::{AirportId, Category, Comment, ListMembership};
use crate::services::identifiers::{normalize_identifier, AliasTable};
use crate::services::normalize::parse_coordinates;

/// Whole-sheet failures. These abort the run: the sheet carries the blacklist.
#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("cannot read override sheet {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("override sheet has no '{0}' column")]
    MissingColumn(&'static str),
    #[error("override sheet is not valid CSV: {0}")]
    Csv(#[from] csv::Error),
}

/// A validated override row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRow {
    /// 1-based line in the sheet (header is line 1).
    pub line: usize,
    /// Normalized but not yet alias-resolved identifier.
    pub identifier: String,
    pub list: ListMembership,
    pub category: Option<Category>,
    pub comment: Option<Comment>,
    pub recently_landed: Option<bool>,
    pub date_landed: Option<NaiveDate>,
    pub crew: Option<String>,
    pub landing_issues: bool,
    pub coordinates: Option<(Decimal, Decimal)>,
}

/// A rejected override row, surfaced in the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct OverrideRowError {
    pub line: usize,
    pub identifier: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct OverrideSheet {
    pub rows: Vec<OverrideRow>,
    pub errors: Vec<OverrideRowError>,
}

/// Override rows keyed by canonical airport.
#[derive(Debug, Clone, Default)]
pub struct OverrideSet {
    entries: BTreeMap<AirportId, OverrideRow>,
}

impl OverrideSet {
    pub fn get(&self, id: &AirportId) -> Option<&OverrideRow> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &AirportId> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRow {
    #[serde(rename = "ICAO")]
    icao: String,
    #[serde(rename = "BLACKLIST")]
    blacklist: String,
    #[serde(rename = "WHITELIST")]
    whitelist: String,
    #[serde(rename = "CATEGORY")]
    category: String,
    #[serde(rename = "COMMENT")]
    comment: String,
    #[serde(rename = "COMMENT_DATE")]
    comment_date: String,
    #[serde(rename = "RECENTLY_LANDED")]
    recently_landed: String,
    #[serde(rename = "DATE_LANDED")]
    date_landed: String,
    #[serde(rename = "FRONT_SEAT")]
    front_seat: String,
    #[serde(rename = "BACK_SEAT")]
    back_seat: String,
    #[serde(rename = "LANDING_ISSUES")]
    landing_issues: String,
    #[serde(rename = "LATITUDE")]
    latitude: String,
    #[serde(rename = "LONGITUDE")]
    longitude: String,
}

impl RawRow {
    fn is_blank(&self) -> bool {
        [
            &self.icao,
            &self.blacklist,
            &self.whitelist,
            &self.category,
            &self.comment,
            &self.recently_landed,
            &self.date_landed,
            &self.landing_issues,
            &self.latitude,
            &self.longitude,
        ]
        .iter()
        .all(|s| s.trim().is_empty())
    }
}

/// Read the sheet from disk. A missing file means "no overrides".
pub async fn load_overrides(path: &Path) -> Result<OverrideSheet, OverrideError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => {
            let sheet = parse_overrides(&text)?;
            tracing::info!(
                "Loaded override sheet {}: {} rows, {} rejected",
                path.display(),
                sheet.rows.len(),
                sheet.errors.len()
            );
            Ok(sheet)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Override sheet {} not found; running without overrides", path.display());
            Ok(OverrideSheet::default())
        }
        Err(e) => Err(OverrideError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

pub fn parse_overrides(text: &str) -> Result<OverrideSheet, OverrideError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    if !rdr.headers()?.iter().any(|h| h == "ICAO") {
        return Err(OverrideError::MissingColumn("ICAO"));
    }

    let mut sheet = OverrideSheet::default();
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();

    for (i, result) in rdr.deserialize::<RawRow>().enumerate() {
        let line = i + 2;
        let raw = match result {
            Ok(r) => r,
            Err(e) => {
                sheet.errors.push(OverrideRowError {
                    line,
                    identifier: String::new(),
                    message: e.to_string(),
                });
                continue;
            }
        };
        if raw.is_blank() {
            continue;
        }
        match validate_row(line, &raw) {
            Ok((row, problems)) => {
                if let Some(first) = seen.get(&row.identifier) {
                    sheet.errors.push(OverrideRowError {
                        line,
                        identifier: row.identifier.clone(),
                        message: format!("duplicate of line {}", first),
                    });
                    continue;
                }
                sheet.errors.extend(problems.into_iter().map(|message| OverrideRowError {
                    line,
                    identifier: row.identifier.clone(),
                    message: format!("{} (cell ignored)", message),
                }));
                seen.insert(row.identifier.clone(), line);
                sheet.rows.push(row);
            }
            Err(message) => sheet.errors.push(OverrideRowError {
                line,
                identifier: raw.icao.clone(),
                message,
            }),
        }
    }

    for err in &sheet.errors {
        tracing::warn!(
            "Override sheet line {} ({}): {}",
            err.line,
            err.identifier,
            err.message
        );
    }
    Ok(sheet)
}

/// Validate one row. `Err` rejects the row; the `Vec` lists cleared cells.
fn validate_row(line: usize, raw: &RawRow) -> Result<(OverrideRow, Vec<String>), String> {
    let identifier = normalize_identifier(&raw.icao)
        .ok_or_else(|| format!("invalid identifier '{}'", raw.icao))?;

    let blacklist = parse_flag(&raw.blacklist).map_err(|e| format!("BLACKLIST: {}", e))?;
    let whitelist = parse_flag(&raw.whitelist).map_err(|e| format!("WHITELIST: {}", e))?;
    let list = match (blacklist == Some(true), whitelist == Some(true)) {
        (true, true) => return Err("both BLACKLIST and WHITELIST set".to_string()),
        (true, false) => ListMembership::Blacklisted,
        (false, true) => ListMembership::Whitelisted,
        (false, false) => ListMembership::None,
    };

    let category = match raw.category.trim() {
        "" => None,
        s => {
            let n: u8 = s
                .parse()
                .map_err(|_| format!("CATEGORY '{}' is not a number", s))?;
            Some(Category::from_number(n).ok_or_else(|| format!("CATEGORY {} outside 0-3", n))?)
        }
    };

    let mut problems = Vec::new();

    let comment_date = keep(&mut problems, optional_date(&raw.comment_date, "COMMENT_DATE"));
    let comment = match raw.comment.trim() {
        "" => None,
        text => Some(Comment {
            text: text.to_string(),
            date: comment_date,
        }),
    };

    let recently_landed =
        keep(&mut problems, parse_flag(&raw.recently_landed).map_err(|e| format!("RECENTLY_LANDED: {}", e)));
    let date_landed = keep(&mut problems, optional_date(&raw.date_landed, "DATE_LANDED"));
    let landing_issues = keep(
        &mut problems,
        parse_flag(&raw.landing_issues).map_err(|e| format!("LANDING_ISSUES: {}", e)),
    )
    .unwrap_or(false);

    let seats: Vec<&str> = [raw.front_seat.trim(), raw.back_seat.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();
    let crew = (!seats.is_empty()).then(|| seats.join(" / "));

    let coordinates = keep(&mut problems, parse_coordinates(&raw.latitude, &raw.longitude));

    let row = OverrideRow {
        line,
        identifier,
        list,
        category,
        comment,
        recently_landed,
        date_landed,
        crew,
        landing_issues,
        coordinates,
    };
    Ok((row, problems))
}

/// Unwrap an informational cell, recording the problem and clearing the value.
fn keep<T: Default>(problems: &mut Vec<String>, result: Result<T, String>) -> T {
    result.unwrap_or_else(|message| {
        problems.push(message);
        T::default()
    })
}

fn optional_date(raw: &str, column: &str) -> Result<Option<NaiveDate>, String> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    parse_date(raw)
        .map(Some)
        .ok_or_else(|| format!("{} '{}' is not a date", column, raw.trim()))
}

/// Resolve override identifiers to canonical airports.
///
/// Unresolvable rows and rows that collapse onto an airport already claimed by
/// an earlier row are dropped with a diagnostic.
pub fn resolve_overrides(rows: Vec<OverrideRow>, aliases: &AliasTable) -> (OverrideSet, Vec<Diagnostic>) {
    let mut set = OverrideSet::default();
    let mut diagnostics = Vec::new();

    for row in rows {
        let id = match aliases.resolve(&row.identifier) {
            Ok(id) => id,
            Err(e) => {
                diagnostics.push(Diagnostic::aliasing(
                    None,
                    format!("override line {} dropped: {}", row.line, e),
                ));
                continue;
            }
        };
        match set.entries.entry(id) {
            Entry::Occupied(existing) => diagnostics.push(Diagnostic::aliasing(
                None,
                format!(
                    "override line {} ({}) resolves to {}, already set by line {}",
                    row.line,
                    row.identifier,
                    existing.key(),
                    existing.get().line
                ),
            )),
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
        }
    }

    (set, diagnostics)
}
