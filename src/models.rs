//! Domain types shared by the acquisition, merge, and classification stages.
//!
//! - [`SourcePartialRecord`]: what one source knows about one airport
//! - [`AirportRecord`]: the merged per-airport state, rebuilt every run
//! - [`ClassificationResult`]: verdict + marker + reasons derived from a record

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use utoipa::ToSchema;

/// Canonical airport identifier (uppercase, ICAO-style where one exists).
///
/// Only produced by [`crate::services::identifiers::AliasTable::resolve`], so two
/// sources that spell the same airport differently still join on one key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AirportId(String);

impl AirportId {
    pub(crate) fn from_normalized(code: String) -> Self {
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AirportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The automated sources the cache manager acquires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// FAA NASR airport / runway / runway-end master records.
    Runways,
    /// Chart supplement page text (JASU listings).
    ChartSupplement,
    /// DLA contract fuel listing.
    Fuel,
    /// AOD recent T-38 landings.
    Flights,
}

impl SourceKind {
    /// Fixed acquisition and tie-break order.
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Runways,
        SourceKind::ChartSupplement,
        SourceKind::Fuel,
        SourceKind::Flights,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SourceKind::Runways => "runways",
            SourceKind::ChartSupplement => "chart_supplement",
            SourceKind::Fuel => "fuel",
            SourceKind::Flights => "flights",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Declared landing distance for one runway end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunwayLda {
    /// Runway identifier, e.g. "04/22"
    pub runway_id: String,
    /// Runway end identifier, e.g. "04"
    pub end_id: String,
    /// Landing distance available in feet
    pub lda_ft: u32,
}

/// Typed fields a single source may supply. `None` means "this source says nothing".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faa_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lda_ft: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runways: Vec<RunwayLda>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub military: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_fuel: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jasu: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_landed: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crew: Option<String>,
}

impl PartialFields {
    /// Fold a second row for the same airport from the same source into this one.
    ///
    /// Existing values win, except `last_landed` (and its crew) where the later
    /// date wins.
    pub fn absorb(&mut self, other: PartialFields) {
        let later_landing = match (self.last_landed, other.last_landed) {
            (Some(mine), Some(theirs)) => theirs > mine,
            (None, Some(_)) => true,
            _ => false,
        };
        if later_landing {
            self.last_landed = other.last_landed;
            self.crew = other.crew.clone();
        }

        self.faa_id = self.faa_id.take().or(other.faa_id);
        self.latitude = self.latitude.or(other.latitude);
        self.longitude = self.longitude.or(other.longitude);
        self.lda_ft = match (self.lda_ft, other.lda_ft) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if self.runways.is_empty() {
            self.runways = other.runways;
        }
        self.military = self.military.or(other.military);
        self.contract_fuel = self.contract_fuel.or(other.contract_fuel);
        self.jasu = self.jasu.or(other.jasu);
        if self.crew.is_none() && !later_landing {
            self.crew = other.crew;
        }
    }
}

/// One source's view of one airport, produced by the normalizer on each fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePartialRecord {
    pub source: SourceKind,
    pub fetched_at: DateTime<Utc>,
    /// Identifier as the source spelled it (after normalization, before alias resolution).
    pub source_id: String,
    pub fields: PartialFields,
}

/// Airfield restriction tier. Only the override sheet sets it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub enum Category {
    #[default]
    Unrestricted,
    One,
    Two,
    Three,
}

impl Category {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            0 => Some(Category::Unrestricted),
            1 => Some(Category::One),
            2 => Some(Category::Two),
            3 => Some(Category::Three),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Category::Unrestricted => 0,
            Category::One => 1,
            Category::Two => 2,
            Category::Three => 3,
        }
    }

    /// Planning text attached to restricted categories.
    pub fn restriction_text(self) -> Option<&'static str> {
        match self {
            Category::Unrestricted => None,
            Category::One => Some("T-38 operations prohibited"),
            Category::Two => Some("Form 740A required"),
            Category::Three => Some("particular caution and prior planning required"),
        }
    }
}

/// Blacklist / whitelist membership from the override sheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ListMembership {
    #[default]
    None,
    Blacklisted,
    Whitelisted,
}

/// Free-text comment from the override sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub text: String,
    pub date: Option<NaiveDate>,
}

impl fmt::Display for Comment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date {
            Some(date) => write!(f, "{}: {}", date.format("%m/%d/%Y"), self.text),
            None => f.write_str(&self.text),
        }
    }
}

/// Merged fields that carry provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Coordinates,
    Lda,
    Runways,
    Military,
    ContractFuel,
    Jasu,
    LastLanded,
}

impl RecordField {
    pub fn label(self) -> &'static str {
        match self {
            RecordField::Coordinates => "coordinates",
            RecordField::Lda => "landing distance",
            RecordField::Runways => "runway list",
            RecordField::Military => "ownership",
            RecordField::ContractFuel => "contract fuel",
            RecordField::Jasu => "JASU",
            RecordField::LastLanded => "last landing",
        }
    }
}

/// Where a merged field value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldOrigin {
    Override,
    Source {
        source: SourceKind,
        fetched_at: DateTime<Utc>,
        /// True when the value came from a cache entry past its cycle.
        stale: bool,
    },
}

/// The merged, authoritative state of one airport for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirportRecord {
    pub id: AirportId,
    pub faa_id: Option<String>,
    pub latitude: Option<Decimal>,
    pub longitude: Option<Decimal>,
    pub lda_ft: Option<u32>,
    pub runways: Vec<RunwayLda>,
    pub military: Option<bool>,
    pub contract_fuel: Option<bool>,
    pub jasu: Option<bool>,
    pub category: Category,
    pub list: ListMembership,
    pub comment: Option<Comment>,
    pub last_landed: Option<NaiveDate>,
    pub crew: Option<String>,
    /// Set when the override sheet marks the airport as recently landed.
    pub recent_landing_override: Option<bool>,
    /// Recent landings exist but were flagged with problems.
    pub landing_issues: bool,
    pub provenance: BTreeMap<RecordField, FieldOrigin>,
}

impl AirportRecord {
    pub fn empty(id: AirportId) -> Self {
        Self {
            id,
            faa_id: None,
            latitude: None,
            longitude: None,
            lda_ft: None,
            runways: Vec::new(),
            military: None,
            contract_fuel: None,
            jasu: None,
            category: Category::Unrestricted,
            list: ListMembership::None,
            comment: None,
            last_landed: None,
            crew: None,
            recent_landing_override: None,
            landing_issues: false,
            provenance: BTreeMap::new(),
        }
    }

    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    pub fn is_blacklisted(&self) -> bool {
        self.list == ListMembership::Blacklisted
    }

    pub fn is_whitelisted(&self) -> bool {
        self.list == ListMembership::Whitelisted
    }
}

/// Eligibility verdict for an airport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Eligible,
    EligibleWithRestriction,
    EligibleWithCaveat,
    EligibleNeedsVerification,
    InsufficientData,
    Ineligible,
}

impl Verdict {
    pub fn is_eligible(self) -> bool {
        !matches!(self, Verdict::Ineligible | Verdict::InsufficientData)
    }
}

/// Map marker assigned to an airport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Marker {
    RedCircle,
    RedDiamond,
    Green,
    Blue,
    Yellow,
    /// Not drawn on the map.
    Hidden,
}

impl Marker {
    pub fn name(self) -> &'static str {
        match self {
            Marker::RedCircle => "red-circle",
            Marker::RedDiamond => "red-diamond",
            Marker::Green => "green",
            Marker::Blue => "blue",
            Marker::Yellow => "yellow",
            Marker::Hidden => "hidden",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Marker::RedCircle,
            Marker::RedDiamond,
            Marker::Green,
            Marker::Blue,
            Marker::Yellow,
            Marker::Hidden,
        ]
        .into_iter()
        .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
    }
}

/// Output of the classification engine for one airport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ClassificationResult {
    pub verdict: Verdict,
    pub marker: Marker,
    /// Contributing reasons, primary reason first.
    pub reasons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_absorb_prefers_existing_values() {
        let mut a = PartialFields {
            lda_ft: Some(8000),
            jasu: Some(true),
            ..Default::default()
        };
        a.absorb(PartialFields {
            lda_ft: Some(7000),
            jasu: Some(false),
            contract_fuel: Some(true),
            ..Default::default()
        });
        assert_eq!(a.lda_ft, Some(8000));
        assert_eq!(a.jasu, Some(true));
        assert_eq!(a.contract_fuel, Some(true));
    }

    #[test]
    fn test_absorb_keeps_latest_landing_with_its_crew() {
        let mut a = PartialFields {
            last_landed: Some(date("2025-01-10")),
            crew: Some("ABC".to_string()),
            ..Default::default()
        };
        a.absorb(PartialFields {
            last_landed: Some(date("2026-02-01")),
            crew: Some("XYZ / QRS".to_string()),
            ..Default::default()
        });
        assert_eq!(a.last_landed, Some(date("2026-02-01")));
        assert_eq!(a.crew.as_deref(), Some("XYZ / QRS"));
    }

    #[test]
    fn test_category_round_trip_numbers() {
        for n in 0..=3u8 {
            assert_eq!(Category::from_number(n).unwrap().number(), n);
        }
        assert_eq!(Category::from_number(4), None);
    }

    #[test]
    fn test_insufficient_data_is_not_eligible() {
        assert!(Verdict::EligibleWithCaveat.is_eligible());
        assert!(Verdict::EligibleNeedsVerification.is_eligible());
        assert!(!Verdict::InsufficientData.is_eligible());
        assert!(!Verdict::Ineligible.is_eligible());
    }

    #[test]
    fn test_marker_parse() {
        assert_eq!(Marker::parse("red-diamond"), Some(Marker::RedDiamond));
        assert_eq!(Marker::parse(" BLUE "), Some(Marker::Blue));
        assert_eq!(Marker::parse("purple"), None);
    }

    #[test]
    fn test_comment_display_with_date() {
        let c = Comment {
            text: "FBO closes at 2200L".to_string(),
            date: Some(date("2026-03-04")),
        };
        assert_eq!(c.to_string(), "03/04/2026: FBO closes at 2200L");
    }
}
