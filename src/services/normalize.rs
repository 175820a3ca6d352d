//! Source Record Normalizer.
//!
//! Turns each source's raw payload into [`SourcePartialRecord`]s in two stages:
//!
//! 1. [`parse_payload`]: source-native rows → partial records keyed by the
//!    normalized source identifier. Pure; this is what the cache persists.
//! 2. [`resolve_identifiers`]: source identifiers → canonical [`AirportId`]
//!    through the [`AliasTable`]. Unresolvable rows are dropped with a diagnostic.
//!
//! Malformed rows never abort a source. They become `MalformedRow`
//! diagnostics. Only a payload with no usable structure at all (wrong payload,
//! missing header column, non-array JSON) is a [`NormalizeError`].

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::errors::Diagnostic;
use crate::helpers::parse_date;
use crate::models::{AirportId, PartialFields, RunwayLda, SourceKind, SourcePartialRecord};
use crate::services::identifiers::{normalize_identifier, AliasTable};

/// NASR ownership codes for military fields (these always have government fuel).
const MIL_CODES: [&str; 4] = ["CG", "MA", "MN", "MR"];

/// Equipment designators that mark a JASU listing as a real start cart.
const JASU_EQUIPMENT: [&str; 7] = ["95", "60A", "MSU", "GTC", "WELLS", "NCPP", "MA-"];

const FEET_PER_METRE: f64 = 3.28084;

/// Longest plausible runway; anything above is a unit or typing error.
const MAX_PLAUSIBLE_LENGTH_FT: f64 = 40_000.0;

/// Raw payload handed back by a source fetch function.
#[derive(Debug, Clone)]
pub enum RawPayload {
    /// The three NASR CSV documents (APT_BASE, APT_RWY, APT_RWY_END).
    Runways {
        base: String,
        runways: String,
        runway_ends: String,
    },
    /// Extracted chart supplement text, one entry per page.
    ChartSupplement { pages: Vec<String> },
    /// DLA contract fuel CSV (with preamble rows).
    Fuel { csv: String },
    /// AOD flights JSON array.
    Flights { json: serde_json::Value },
}

impl RawPayload {
    pub fn source(&self) -> SourceKind {
        match self {
            RawPayload::Runways { .. } => SourceKind::Runways,
            RawPayload::ChartSupplement { .. } => SourceKind::ChartSupplement,
            RawPayload::Fuel { .. } => SourceKind::Fuel,
            RawPayload::Flights { .. } => SourceKind::Flights,
        }
    }
}

/// Whole-payload failures. Row-level problems are [`Diagnostic`]s instead.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("{got} payload handed to the {expected} normalizer")]
    WrongPayload {
        expected: SourceKind,
        got: SourceKind,
    },
    #[error("{document}: missing required column '{column}'")]
    MissingColumn {
        document: &'static str,
        column: &'static str,
    },
    #[error("{document}: {message}")]
    Unreadable {
        document: &'static str,
        message: String,
    },
}

/// Settings the normalizer needs beyond the payload itself.
#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Flights older than this many days before the fetch are ignored.
    pub flight_history_days: i64,
}

/// Stage 1 output: records keyed by source identifier.
#[derive(Debug, Clone, Default)]
pub struct ParsedSource {
    pub records: Vec<SourcePartialRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Stage 2 output: records keyed by canonical airport.
#[derive(Debug, Clone, Default)]
pub struct NormalizedSource {
    pub records: BTreeMap<AirportId, SourcePartialRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse + resolve in one step.
pub fn normalize(
    source: SourceKind,
    raw: RawPayload,
    fetched_at: DateTime<Utc>,
    config: &NormalizeConfig,
    aliases: &AliasTable,
) -> Result<NormalizedSource, NormalizeError> {
    let parsed = parse_payload(source, raw, fetched_at, config)?;
    let mut resolved = resolve_identifiers(parsed.records, aliases);
    let mut diagnostics = parsed.diagnostics;
    diagnostics.append(&mut resolved.diagnostics);
    resolved.diagnostics = diagnostics;
    Ok(resolved)
}

/// Parse a raw payload into partial records keyed by source identifier.
pub fn parse_payload(
    source: SourceKind,
    raw: RawPayload,
    fetched_at: DateTime<Utc>,
    config: &NormalizeConfig,
) -> Result<ParsedSource, NormalizeError> {
    if raw.source() != source {
        return Err(NormalizeError::WrongPayload {
            expected: source,
            got: raw.source(),
        });
    }

    let parsed = match raw {
        RawPayload::Runways {
            base,
            runways,
            runway_ends,
        } => parse_runways(&base, &runways, &runway_ends, fetched_at)?,
        RawPayload::ChartSupplement { pages } => parse_chart_supplement(&pages, fetched_at),
        RawPayload::Fuel { csv } => parse_fuel(&csv, fetched_at)?,
        RawPayload::Flights { json } => parse_flights(&json, fetched_at, config)?,
    };

    tracing::debug!(
        "[{}] parsed {} records ({} diagnostics)",
        source,
        parsed.records.len(),
        parsed.diagnostics.len()
    );
    Ok(parsed)
}

/// Map source identifiers onto canonical airports.
///
/// Two rows that land on the same airport are folded with
/// [`PartialFields::absorb`].
pub fn resolve_identifiers(
    records: Vec<SourcePartialRecord>,
    aliases: &AliasTable,
) -> NormalizedSource {
    let mut resolved: BTreeMap<AirportId, SourcePartialRecord> = BTreeMap::new();
    let mut diagnostics = Vec::new();

    for record in records {
        match aliases.resolve(&record.source_id) {
            Ok(id) => match resolved.entry(id) {
                Entry::Occupied(mut existing) => existing.get_mut().fields.absorb(record.fields),
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            },
            Err(e) => diagnostics.push(Diagnostic::aliasing(
                Some(record.source),
                format!("dropped row: {}", e),
            )),
        }
    }

    NormalizedSource {
        records: resolved,
        diagnostics,
    }
}

// ---------------------------------------------------------------------------
// Cell parsing
// ---------------------------------------------------------------------------

/// Parse a length cell into feet.
///
/// Accepts plain numbers (feet), `ft`/`'` suffixes, `m` suffix (metres), and
/// thousands separators. Blank is `Ok(None)`. Anything else is rejected, never
/// zero-filled.
pub(crate) fn parse_length_ft(raw: &str) -> Result<Option<u32>, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let cleaned = s.replace(',', "").to_ascii_lowercase();
    let (number, metres) = if let Some(n) = cleaned.strip_suffix("ft") {
        (n.trim(), false)
    } else if let Some(n) = cleaned.strip_suffix('\'') {
        (n.trim(), false)
    } else if let Some(n) = cleaned.strip_suffix('m') {
        (n.trim(), true)
    } else {
        (cleaned.as_str(), false)
    };

    let value: f64 = number
        .parse()
        .map_err(|_| format!("unparseable length '{}'", s))?;
    let feet = if metres { value * FEET_PER_METRE } else { value };
    if !feet.is_finite() || feet <= 0.0 || feet > MAX_PLAUSIBLE_LENGTH_FT {
        return Err(format!("length out of range '{}'", s));
    }
    Ok(Some(feet.round() as u32))
}

/// Parse a decimal-degree coordinate pair. Both blank is `Ok(None)`.
pub(crate) fn parse_coordinates(lat: &str, lon: &str) -> Result<Option<(Decimal, Decimal)>, String> {
    let (lat, lon) = (lat.trim(), lon.trim());
    match (lat.is_empty(), lon.is_empty()) {
        (true, true) => return Ok(None),
        (false, false) => {}
        _ => return Err("only one of latitude/longitude present".to_string()),
    }
    let lat_d = Decimal::from_str(lat).map_err(|_| format!("unparseable latitude '{}'", lat))?;
    let lon_d = Decimal::from_str(lon).map_err(|_| format!("unparseable longitude '{}'", lon))?;
    if lat_d.abs() > Decimal::from(90) || lon_d.abs() > Decimal::from(180) {
        return Err(format!("coordinates out of range ({}, {})", lat, lon));
    }
    Ok(Some((lat_d, lon_d)))
}

fn csv_reader(text: &str) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes())
}

fn headers(
    rdr: &mut csv::Reader<&[u8]>,
    document: &'static str,
) -> Result<csv::StringRecord, NormalizeError> {
    rdr.headers()
        .map(|h| h.clone())
        .map_err(|e| NormalizeError::Unreadable {
            document,
            message: e.to_string(),
        })
}

fn column(
    headers: &csv::StringRecord,
    document: &'static str,
    name: &'static str,
) -> Result<usize, NormalizeError> {
    headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .ok_or(NormalizeError::MissingColumn {
            document,
            column: name,
        })
}

fn cell(row: &csv::StringRecord, idx: usize) -> &str {
    row.get(idx).unwrap_or("")
}

fn partial(source: SourceKind, source_id: String, fetched_at: DateTime<Utc>, fields: PartialFields) -> SourcePartialRecord {
    SourcePartialRecord {
        source,
        fetched_at,
        source_id,
        fields,
    }
}

// ---------------------------------------------------------------------------
// Runways (NASR)
// ---------------------------------------------------------------------------

fn parse_runways(
    base: &str,
    runways: &str,
    runway_ends: &str,
    fetched_at: DateTime<Utc>,
) -> Result<ParsedSource, NormalizeError> {
    let src = Some(SourceKind::Runways);
    let mut diagnostics = Vec::new();

    // APT_RWY: runway length per (airport, runway)
    let mut rdr = csv_reader(runways);
    let hdr = headers(&mut rdr, "APT_RWY")?;
    let (c_arpt, c_rwy, c_len) = (
        column(&hdr, "APT_RWY", "ARPT_ID")?,
        column(&hdr, "APT_RWY", "RWY_ID")?,
        column(&hdr, "APT_RWY", "RWY_LEN")?,
    );
    let mut lengths: BTreeMap<(String, String), Option<u32>> = BTreeMap::new();
    for (i, result) in rdr.records().enumerate() {
        let line = i + 2;
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                diagnostics.push(Diagnostic::malformed_row(src, format!("APT_RWY line {}: {}", line, e)));
                continue;
            }
        };
        let Some(arpt) = normalize_identifier(cell(&row, c_arpt)) else {
            diagnostics.push(Diagnostic::malformed_row(
                src,
                format!("APT_RWY line {}: invalid ARPT_ID '{}'", line, cell(&row, c_arpt)),
            ));
            continue;
        };
        let len = match parse_length_ft(cell(&row, c_len)) {
            Ok(v) => v,
            Err(msg) => {
                diagnostics.push(Diagnostic::malformed_row(
                    src,
                    format!("APT_RWY line {} ({}): {}", line, arpt, msg),
                ));
                None
            }
        };
        lengths.insert((arpt, cell(&row, c_rwy).to_string()), len);
    }

    // APT_RWY_END: declared LDA per runway end, falling back to runway length
    let mut rdr = csv_reader(runway_ends);
    let hdr = headers(&mut rdr, "APT_RWY_END")?;
    let (c_arpt, c_rwy, c_end, c_lda) = (
        column(&hdr, "APT_RWY_END", "ARPT_ID")?,
        column(&hdr, "APT_RWY_END", "RWY_ID")?,
        column(&hdr, "APT_RWY_END", "RWY_END_ID")?,
        column(&hdr, "APT_RWY_END", "LNDG_DIST_AVBL")?,
    );
    let mut ends: BTreeMap<String, Vec<RunwayLda>> = BTreeMap::new();
    for (i, result) in rdr.records().enumerate() {
        let line = i + 2;
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                diagnostics.push(Diagnostic::malformed_row(src, format!("APT_RWY_END line {}: {}", line, e)));
                continue;
            }
        };
        let Some(arpt) = normalize_identifier(cell(&row, c_arpt)) else {
            diagnostics.push(Diagnostic::malformed_row(
                src,
                format!("APT_RWY_END line {}: invalid ARPT_ID '{}'", line, cell(&row, c_arpt)),
            ));
            continue;
        };
        let runway_id = cell(&row, c_rwy).to_string();
        let Some(runway_len) = lengths.get(&(arpt.clone(), runway_id.clone())) else {
            diagnostics.push(Diagnostic::malformed_row(
                src,
                format!("APT_RWY_END line {}: {} runway {} not in APT_RWY", line, arpt, runway_id),
            ));
            continue;
        };
        let lda = match parse_length_ft(cell(&row, c_lda)) {
            Ok(Some(declared)) => declared,
            Ok(None) => match runway_len {
                Some(len) => *len,
                None => {
                    diagnostics.push(Diagnostic::malformed_row(
                        src,
                        format!("APT_RWY_END line {}: {} runway {} has no usable length", line, arpt, runway_id),
                    ));
                    continue;
                }
            },
            Err(msg) => {
                diagnostics.push(Diagnostic::malformed_row(
                    src,
                    format!("APT_RWY_END line {} ({} {}): {}", line, arpt, runway_id, msg),
                ));
                continue;
            }
        };
        ends.entry(arpt).or_default().push(RunwayLda {
            runway_id,
            end_id: cell(&row, c_end).to_string(),
            lda_ft: lda,
        });
    }

    // APT_BASE: identity, position, ownership
    let mut rdr = csv_reader(base);
    let hdr = headers(&mut rdr, "APT_BASE")?;
    let (c_arpt, c_icao, c_lat, c_lon, c_own) = (
        column(&hdr, "APT_BASE", "ARPT_ID")?,
        column(&hdr, "APT_BASE", "ICAO_ID")?,
        column(&hdr, "APT_BASE", "LAT_DECIMAL")?,
        column(&hdr, "APT_BASE", "LONG_DECIMAL")?,
        column(&hdr, "APT_BASE", "OWNERSHIP_TYPE_CODE")?,
    );
    let mut records = Vec::new();
    for (i, result) in rdr.records().enumerate() {
        let line = i + 2;
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                diagnostics.push(Diagnostic::malformed_row(src, format!("APT_BASE line {}: {}", line, e)));
                continue;
            }
        };
        let Some(faa) = normalize_identifier(cell(&row, c_arpt)) else {
            diagnostics.push(Diagnostic::malformed_row(
                src,
                format!("APT_BASE line {}: invalid ARPT_ID '{}'", line, cell(&row, c_arpt)),
            ));
            continue;
        };
        // Airports without any usable runway end are not candidates.
        let Some(mut runway_list) = ends.remove(&faa) else {
            continue;
        };

        let icao_raw = cell(&row, c_icao);
        let icao = if icao_raw.is_empty() {
            None
        } else {
            let code = normalize_identifier(icao_raw);
            if code.is_none() {
                diagnostics.push(Diagnostic::malformed_row(
                    src,
                    format!("APT_BASE line {}: invalid ICAO_ID '{}', keeping FAA id {}", line, icao_raw, faa),
                ));
            }
            code
        };

        let coordinates = match parse_coordinates(cell(&row, c_lat), cell(&row, c_lon)) {
            Ok(c) => c,
            Err(msg) => {
                diagnostics.push(Diagnostic::malformed_row(
                    src,
                    format!("APT_BASE line {} ({}): {}", line, faa, msg),
                ));
                None
            }
        };

        runway_list.sort_by(|a, b| (&a.runway_id, &a.end_id).cmp(&(&b.runway_id, &b.end_id)));
        let lda_ft = runway_list.iter().map(|r| r.lda_ft).max();
        let military = MIL_CODES.contains(&cell(&row, c_own));

        records.push(partial(
            SourceKind::Runways,
            icao.unwrap_or_else(|| faa.clone()),
            fetched_at,
            PartialFields {
                faa_id: Some(faa),
                latitude: coordinates.map(|c| c.0),
                longitude: coordinates.map(|c| c.1),
                lda_ft,
                runways: runway_list,
                military: Some(military),
                ..Default::default()
            },
        ));
    }

    for faa in ends.keys() {
        diagnostics.push(Diagnostic::malformed_row(
            src,
            format!("runway data for {} has no APT_BASE row", faa),
        ));
    }

    Ok(ParsedSource {
        records,
        diagnostics,
    })
}

// ---------------------------------------------------------------------------
// Chart supplement (JASU)
// ---------------------------------------------------------------------------

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\(\s*(K\s*[A-Z0-9]{3}|P\s*A\s*[A-Z0-9]{2})\s*\)")
            .expect("identifier pattern is a valid regex")
    })
}

/// Attribute each JASU listing to the closest preceding airport heading on the
/// same page. A listing only counts if a known equipment designator appears on
/// the JASU line or the line after it.
fn parse_chart_supplement(pages: &[String], fetched_at: DateTime<Utc>) -> ParsedSource {
    let src = Some(SourceKind::ChartSupplement);
    let mut diagnostics = Vec::new();
    let mut found: BTreeSet<String> = BTreeSet::new();

    for (page_no, page) in pages.iter().enumerate() {
        let lines: Vec<&str> = page.lines().collect();
        let mut heading: Option<String> = None;

        for (idx, line) in lines.iter().enumerate() {
            if let Some(caps) = identifier_pattern().captures(line) {
                heading = Some(caps[1].to_string());
            }
            if !line.contains("JASU") {
                continue;
            }
            let next = lines.get(idx + 1).copied().unwrap_or("");
            let has_equipment = JASU_EQUIPMENT
                .iter()
                .any(|eq| line.contains(eq) || next.contains(eq));
            if !has_equipment {
                continue;
            }
            match heading.as_deref().map(|h| (h, normalize_identifier(h))) {
                Some((_, Some(code))) => {
                    found.insert(code);
                }
                Some((raw, None)) => diagnostics.push(Diagnostic::malformed_row(
                    src,
                    format!("page {}: JASU heading '{}' is not a valid identifier", page_no + 1, raw),
                )),
                None => diagnostics.push(Diagnostic::malformed_row(
                    src,
                    format!("page {}: JASU listing with no preceding airport heading", page_no + 1),
                )),
            }
        }
    }

    let records = found
        .into_iter()
        .map(|code| {
            partial(
                SourceKind::ChartSupplement,
                code,
                fetched_at,
                PartialFields {
                    jasu: Some(true),
                    ..Default::default()
                },
            )
        })
        .collect();

    ParsedSource {
        records,
        diagnostics,
    }
}

// ---------------------------------------------------------------------------
// Contract fuel (DLA)
// ---------------------------------------------------------------------------

/// The DLA export has free-text preamble rows; the header is the first row
/// with an `ICAO` cell.
fn parse_fuel(text: &str, fetched_at: DateTime<Utc>) -> Result<ParsedSource, NormalizeError> {
    let src = Some(SourceKind::Fuel);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut diagnostics = Vec::new();
    let mut icao_col: Option<usize> = None;
    let mut found: BTreeSet<String> = BTreeSet::new();

    for (i, result) in rdr.records().enumerate() {
        let line = i + 1;
        let row = match result {
            Ok(r) => r,
            Err(e) => {
                diagnostics.push(Diagnostic::malformed_row(src, format!("line {}: {}", line, e)));
                continue;
            }
        };
        let Some(col) = icao_col else {
            icao_col = row.iter().position(|c| c.eq_ignore_ascii_case("ICAO"));
            continue;
        };
        let raw = cell(&row, col);
        if raw.is_empty() {
            continue;
        }
        match normalize_identifier(raw) {
            Some(code) => {
                found.insert(code);
            }
            None => diagnostics.push(Diagnostic::malformed_row(
                src,
                format!("line {}: invalid ICAO '{}'", line, raw),
            )),
        }
    }

    if icao_col.is_none() {
        return Err(NormalizeError::MissingColumn {
            document: "fuel",
            column: "ICAO",
        });
    }

    let records = found
        .into_iter()
        .map(|code| {
            partial(
                SourceKind::Fuel,
                code,
                fetched_at,
                PartialFields {
                    contract_fuel: Some(true),
                    ..Default::default()
                },
            )
        })
        .collect();

    Ok(ParsedSource {
        records,
        diagnostics,
    })
}

// ---------------------------------------------------------------------------
// Flights (AOD)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FlightEntry {
    #[serde(rename = "Airport")]
    airport: Option<String>,
    #[serde(rename = "FlightDate")]
    flight_date: Option<String>,
    #[serde(rename = "ABVs", default)]
    abvs: Option<serde_json::Value>,
}

/// "FRONT, BACK" → "FRONT / BACK".
fn crew_from_abvs(abvs: Option<&serde_json::Value>) -> Option<String> {
    let raw = abvs?.as_str()?;
    let seats: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(2)
        .collect();
    (!seats.is_empty()).then(|| seats.join(" / "))
}

fn parse_flights(
    json: &serde_json::Value,
    fetched_at: DateTime<Utc>,
    config: &NormalizeConfig,
) -> Result<ParsedSource, NormalizeError> {
    let src = Some(SourceKind::Flights);
    let entries = json.as_array().ok_or_else(|| NormalizeError::Unreadable {
        document: "flights",
        message: "expected a JSON array".to_string(),
    })?;

    let cutoff = fetched_at.date_naive() - Duration::days(config.flight_history_days);
    let mut diagnostics = Vec::new();
    let mut latest: BTreeMap<String, (NaiveDate, Option<String>)> = BTreeMap::new();

    for (i, value) in entries.iter().enumerate() {
        let entry: FlightEntry = match serde_json::from_value(value.clone()) {
            Ok(e) => e,
            Err(e) => {
                diagnostics.push(Diagnostic::malformed_row(src, format!("entry {}: {}", i, e)));
                continue;
            }
        };
        let Some(code) = entry.airport.as_deref().and_then(normalize_identifier) else {
            diagnostics.push(Diagnostic::malformed_row(
                src,
                format!("entry {}: invalid airport {:?}", i, entry.airport),
            ));
            continue;
        };
        let Some(date) = entry.flight_date.as_deref().and_then(parse_date) else {
            diagnostics.push(Diagnostic::malformed_row(
                src,
                format!("entry {} ({}): invalid flight date {:?}", i, code, entry.flight_date),
            ));
            continue;
        };
        if date < cutoff {
            continue;
        }

        let newer = latest.get(&code).map_or(true, |(seen, _)| date > *seen);
        if newer {
            latest.insert(code, (date, crew_from_abvs(entry.abvs.as_ref())));
        }
    }

    let records = latest
        .into_iter()
        .map(|(code, (date, crew))| {
            partial(
                SourceKind::Flights,
                code,
                fetched_at,
                PartialFields {
                    last_landed: Some(date),
                    crew,
                    ..Default::default()
                },
            )
        })
        .collect();

    Ok(ParsedSource {
        records,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DiagnosticKind;

    const APT_BASE: &str = "\
ARPT_ID,ICAO_ID,LAT_DECIMAL,LONG_DECIMAL,OWNERSHIP_TYPE_CODE
ELP,KELP,31.8072,-106.3776,PU
BIF,KBIF,31.8495,-106.38,MA
SML,,30.1,-97.2,PR
NOR,KNOR,31.0,-100.0,PU
";

    const APT_RWY: &str = "\
ARPT_ID,RWY_ID,RWY_LEN
ELP,04/22,12020
ELP,08R/26L,9025
BIF,04/22,13554
SML,17/35,3200
NOR,18/36,not-a-number
";

    const APT_RWY_END: &str = "\
ARPT_ID,RWY_ID,RWY_END_ID,LNDG_DIST_AVBL
ELP,04/22,04,11010
ELP,04/22,22,
ELP,08R/26L,08R,
BIF,04/22,04,4131 m
SML,17/35,17,
NOR,18/36,18,
";

    fn fetched() -> DateTime<Utc> {
        "2026-10-01T12:00:00Z".parse().unwrap()
    }

    fn config() -> NormalizeConfig {
        NormalizeConfig {
            flight_history_days: 4 * 365,
        }
    }

    fn runways_payload() -> RawPayload {
        RawPayload::Runways {
            base: APT_BASE.to_string(),
            runways: APT_RWY.to_string(),
            runway_ends: APT_RWY_END.to_string(),
        }
    }

    fn find<'a>(parsed: &'a ParsedSource, id: &str) -> &'a SourcePartialRecord {
        parsed
            .records
            .iter()
            .find(|r| r.source_id == id)
            .unwrap_or_else(|| panic!("no record for {}", id))
    }

    #[test]
    fn test_parse_length_ft_units() {
        assert_eq!(parse_length_ft("7000"), Ok(Some(7000)));
        assert_eq!(parse_length_ft("7,000 ft"), Ok(Some(7000)));
        assert_eq!(parse_length_ft("7000.0"), Ok(Some(7000)));
        assert_eq!(parse_length_ft("2134m"), Ok(Some(7001)));
        assert_eq!(parse_length_ft("  "), Ok(None));
    }

    #[test]
    fn test_parse_length_ft_rejects_instead_of_zero_fill() {
        assert!(parse_length_ft("N/A").is_err());
        assert!(parse_length_ft("0").is_err());
        assert!(parse_length_ft("-500").is_err());
        assert!(parse_length_ft("900000").is_err());
    }

    #[test]
    fn test_parse_coordinates() {
        let (lat, lon) = parse_coordinates("31.8072", "-106.3776").unwrap().unwrap();
        assert_eq!(lat, Decimal::from_str("31.8072").unwrap());
        assert_eq!(lon, Decimal::from_str("-106.3776").unwrap());
        assert_eq!(parse_coordinates("", ""), Ok(None));
        assert!(parse_coordinates("31.8", "").is_err());
        assert!(parse_coordinates("95.0", "10.0").is_err());
    }

    #[test]
    fn test_runways_declared_lda_with_runway_length_fallback() {
        let parsed = parse_payload(SourceKind::Runways, runways_payload(), fetched(), &config()).unwrap();
        let elp = find(&parsed, "KELP");

        assert_eq!(elp.fields.faa_id.as_deref(), Some("ELP"));
        // 04 declares 11010; 22 falls back to the 12020 runway length
        assert_eq!(elp.fields.lda_ft, Some(12020));
        assert_eq!(elp.fields.runways.len(), 3);
        let end_04 = elp.fields.runways.iter().find(|r| r.end_id == "04").unwrap();
        assert_eq!(end_04.lda_ft, 11010);
        assert_eq!(elp.fields.military, Some(false));
        assert_eq!(elp.fields.latitude, Some(Decimal::from_str("31.8072").unwrap()));
    }

    #[test]
    fn test_runways_metres_and_military_ownership() {
        let parsed = parse_payload(SourceKind::Runways, runways_payload(), fetched(), &config()).unwrap();
        let bif = find(&parsed, "KBIF");
        assert_eq!(bif.fields.lda_ft, Some(13553));
        assert_eq!(bif.fields.military, Some(true));
    }

    #[test]
    fn test_runways_without_icao_keep_faa_id() {
        let parsed = parse_payload(SourceKind::Runways, runways_payload(), fetched(), &config()).unwrap();
        let sml = find(&parsed, "SML");
        assert_eq!(sml.fields.lda_ft, Some(3200));
    }

    #[test]
    fn test_runways_unparseable_length_is_rejected_with_diagnostic() {
        let parsed = parse_payload(SourceKind::Runways, runways_payload(), fetched(), &config()).unwrap();
        assert!(
            parsed.records.iter().all(|r| r.source_id != "KNOR"),
            "NOR has no usable length and must not be zero-filled"
        );
        assert!(parsed
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::MalformedRow && d.message.contains("not-a-number")));
    }

    #[test]
    fn test_runways_missing_column_is_payload_error() {
        let raw = RawPayload::Runways {
            base: APT_BASE.to_string(),
            runways: "ARPT_ID,RWY_ID\nELP,04/22\n".to_string(),
            runway_ends: APT_RWY_END.to_string(),
        };
        let err = parse_payload(SourceKind::Runways, raw, fetched(), &config()).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MissingColumn {
                document: "APT_RWY",
                column: "RWY_LEN"
            }
        ));
    }

    #[test]
    fn test_wrong_payload_rejected() {
        let raw = RawPayload::Fuel {
            csv: "ICAO\nKELP\n".to_string(),
        };
        assert!(matches!(
            parse_payload(SourceKind::Runways, raw, fetched(), &config()),
            Err(NormalizeError::WrongPayload { .. })
        ));
    }

    #[test]
    fn test_chart_supplement_attributes_jasu_to_preceding_heading() {
        let page = "\
EL PASO INTL ( K ELP ) 4 NE UTC-7(-6DT)
  SERVICE: FUEL 100LL, JET A OX 1, 2
  JASU: 2(AM32A-60A) 1(A/M32A-95)
BIGGS AAF (FORT BLISS) ( K BIF ) 1 NE
  SERVICE: FUEL JP8
  JASU: none listed
";
        let raw = RawPayload::ChartSupplement {
            pages: vec![page.to_string()],
        };
        let parsed = parse_payload(SourceKind::ChartSupplement, raw, fetched(), &config()).unwrap();
        let ids: Vec<&str> = parsed.records.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["KELP"]);
        assert_eq!(parsed.records[0].fields.jasu, Some(true));
    }

    #[test]
    fn test_chart_supplement_equipment_on_following_line() {
        let page = "ANCHORAGE INTL ( PA NC )\n  JASU:\n    3(MSU-200NAV)\n";
        let raw = RawPayload::ChartSupplement {
            pages: vec![page.to_string()],
        };
        let parsed = parse_payload(SourceKind::ChartSupplement, raw, fetched(), &config()).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].source_id, "PANC");
    }

    #[test]
    fn test_chart_supplement_alaskan_headings_compact_and_spaced() {
        let page = "\
FAIRBANKS INTL (PAFA) 3 SW UTC-9(-8DT)
  JASU: 1(A/M32A-95)
KETCHIKAN INTL ( P A KT ) 1 W
  JASU: 1(AM32A-60A)
";
        let raw = RawPayload::ChartSupplement {
            pages: vec![page.to_string()],
        };
        let parsed = parse_payload(SourceKind::ChartSupplement, raw, fetched(), &config()).unwrap();
        let ids: Vec<&str> = parsed.records.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["PAFA", "PAKT"]);
        assert!(parsed.diagnostics.is_empty());
    }

    #[test]
    fn test_chart_supplement_orphan_jasu_is_diagnosed() {
        let raw = RawPayload::ChartSupplement {
            pages: vec!["JASU: 1(A/M32A-95)".to_string()],
        };
        let parsed = parse_payload(SourceKind::ChartSupplement, raw, fetched(), &config()).unwrap();
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.diagnostics.len(), 1);
    }

    #[test]
    fn test_fuel_skips_preamble_and_collects_identifiers() {
        let csv = "\
Defense Logistics Agency Into-Plane Contract Locations
ICAO,LOCATION,VENDOR
KELP,EL PASO TX,ATLANTIC
kbif ,FORT BLISS TX,GOV
,,
K!!,BROKEN,ROW
";
        let raw = RawPayload::Fuel { csv: csv.to_string() };
        let parsed = parse_payload(SourceKind::Fuel, raw, fetched(), &config()).unwrap();
        let ids: Vec<&str> = parsed.records.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["KBIF", "KELP"]);
        assert!(parsed.records.iter().all(|r| r.fields.contract_fuel == Some(true)));
        assert_eq!(parsed.diagnostics.len(), 1);
    }

    #[test]
    fn test_fuel_without_icao_header_is_payload_error() {
        let raw = RawPayload::Fuel {
            csv: "LOCATION,VENDOR\nEL PASO,ATLANTIC\n".to_string(),
        };
        assert!(matches!(
            parse_payload(SourceKind::Fuel, raw, fetched(), &config()),
            Err(NormalizeError::MissingColumn { column: "ICAO", .. })
        ));
    }

    #[test]
    fn test_flights_keep_latest_within_history_window() {
        let json = serde_json::json!([
            { "Airport": "KELP", "FlightDate": "2025-03-01T10:00:00", "ABVs": "ABC, DEF" },
            { "Airport": "KELP", "FlightDate": "2026-05-20T09:00:00", "ABVs": "GHI" },
            { "Airport": "KBIF", "FlightDate": "2019-01-01T00:00:00", "ABVs": "OLD" },
            { "Airport": "KSAT", "FlightDate": "garbage" },
            { "FlightDate": "2026-01-01" }
        ]);
        let raw = RawPayload::Flights { json };
        let parsed = parse_payload(SourceKind::Flights, raw, fetched(), &config()).unwrap();

        assert_eq!(parsed.records.len(), 1, "KBIF is outside the window");
        let elp = &parsed.records[0];
        assert_eq!(elp.source_id, "KELP");
        assert_eq!(elp.fields.last_landed, NaiveDate::from_ymd_opt(2026, 5, 20));
        assert_eq!(elp.fields.crew.as_deref(), Some("GHI"));
        assert_eq!(parsed.diagnostics.len(), 2);
    }

    #[test]
    fn test_crew_from_abvs() {
        let v = serde_json::json!("ABC , DEF, GHI");
        assert_eq!(crew_from_abvs(Some(&v)).as_deref(), Some("ABC / DEF"));
        assert_eq!(crew_from_abvs(Some(&serde_json::json!(42))), None);
        assert_eq!(crew_from_abvs(None), None);
    }

    #[test]
    fn test_normalize_resolves_aliases_and_drops_unknown_rows() {
        let runways = parse_payload(SourceKind::Runways, runways_payload(), fetched(), &config()).unwrap();
        let aliases = AliasTable::from_runway_records(&runways.records, &BTreeMap::new());

        let json = serde_json::json!([
            { "Airport": "ELP", "FlightDate": "2026-09-01", "ABVs": "ABC" },
            { "Airport": "KELP", "FlightDate": "2026-08-01", "ABVs": "XYZ" },
            { "Airport": "ZZZ", "FlightDate": "2026-08-01" }
        ]);
        let normalized = normalize(
            SourceKind::Flights,
            RawPayload::Flights { json },
            fetched(),
            &config(),
            &aliases,
        )
        .unwrap();

        assert_eq!(normalized.records.len(), 1);
        let (id, rec) = normalized.records.iter().next().unwrap();
        assert_eq!(id.as_str(), "KELP");
        assert_eq!(rec.fields.last_landed, NaiveDate::from_ymd_opt(2026, 9, 1));
        assert_eq!(rec.fields.crew.as_deref(), Some("ABC"));
        assert!(normalized
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::IdentifierAliasing && d.message.contains("ZZZ")));
    }
}
