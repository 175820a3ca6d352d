//! Classification Engine: merged record → verdict, map marker, and reasons.
//!
//! Rules run in a fixed order and the first decisive rule picks the marker:
//!
//! | # | condition                                   | verdict / marker                 |
//! |---|---------------------------------------------|----------------------------------|
//! | 1 | blacklisted or category 1                   | Ineligible / red-circle          |
//! | 2 | category 2 or 3                             | EligibleWithRestriction / red-diamond |
//! | 3 | whitelisted without coordinates             | InsufficientData / yellow        |
//! | 4 | LDA below minimum (not whitelisted)         | Ineligible / hidden              |
//! | 5 | recent landing, no reported issues          | Eligible / green                 |
//! | 6 | JASU listed                                 | Eligible / blue                  |
//! | 7 | otherwise                                   | EligibleNeedsVerification / yellow |
//!
//! A whitelisted airport short on LDA falls through rule 4 with a caveat and
//! ends up `EligibleWithCaveat` under whatever marker rules 5–7 assign.
//! Contract fuel is informational only and never changes the verdict.

use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::models::{
    AirportRecord, Category, ClassificationResult, FieldOrigin, Marker, RecordField, Verdict,
};

/// Classifier thresholds, fixed for one run.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub min_lda_ft: u32,
    /// A landing at most this many days before `as_of` counts as recent.
    pub recent_landing_days: i64,
    pub as_of: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, record: &AirportRecord) -> ClassificationResult {
        let mut reasons = Vec::new();
        let (verdict, marker) = self.decide(record, &mut reasons);
        self.secondary_reasons(record, verdict, &mut reasons);
        ClassificationResult {
            verdict,
            marker,
            reasons,
        }
    }

    fn decide(&self, r: &AirportRecord, reasons: &mut Vec<String>) -> (Verdict, Marker) {
        // 1. hard exclusions
        if r.is_blacklisted() || r.category == Category::One {
            if r.category == Category::One {
                reasons.push("category 1 / T-38 prohibited".to_string());
            }
            if r.is_blacklisted() {
                reasons.push("blacklisted by override".to_string());
            }
            return (Verdict::Ineligible, Marker::RedCircle);
        }

        // 2. restricted categories
        if let Some(text) = r.category.restriction_text() {
            reasons.push(format!("category {}: {}", r.category.number(), text));
            return (Verdict::EligibleWithRestriction, Marker::RedDiamond);
        }

        // 3. whitelisted but cannot be placed on the map
        if r.is_whitelisted() && !r.has_coordinates() {
            reasons.push("insufficient data: no coordinates for whitelisted airport".to_string());
            return (Verdict::InsufficientData, Marker::Yellow);
        }

        // 4. landing distance gate
        let min = self.config.min_lda_ft;
        let mut caveat = false;
        let mut notes = Vec::new();
        match r.lda_ft {
            Some(lda) if lda < min => {
                let reason = format!("insufficient landing distance ({} ft < {} ft)", lda, min);
                if !r.is_whitelisted() {
                    reasons.push(reason);
                    return (Verdict::Ineligible, Marker::Hidden);
                }
                reasons.push(reason);
                reasons.push("whitelisted override".to_string());
                caveat = true;
            }
            Some(_) => {}
            None => notes.push("landing distance unknown".to_string()),
        }

        // 5–7. marker by operational evidence
        let (verdict, marker) = if self.has_recent_ops(r) {
            reasons.push("recent verified ops".to_string());
            (Verdict::Eligible, Marker::Green)
        } else if r.jasu == Some(true) {
            reasons.push("JASU listed, no recent ops recorded".to_string());
            (Verdict::Eligible, Marker::Blue)
        } else {
            reasons.push("no JASU on record — verify with FBO".to_string());
            if r.jasu.is_none() {
                notes.push("JASU status unknown".to_string());
            }
            (Verdict::EligibleNeedsVerification, Marker::Yellow)
        };
        reasons.append(&mut notes);

        if caveat {
            (Verdict::EligibleWithCaveat, marker)
        } else {
            (verdict, marker)
        }
    }

    fn has_recent_ops(&self, r: &AirportRecord) -> bool {
        if r.landing_issues {
            return false;
        }
        // The sheet's RECENTLY_LANDED answer is authoritative both ways.
        if let Some(flag) = r.recent_landing_override {
            return flag;
        }
        r.last_landed
            .is_some_and(|d| (self.config.as_of - d).num_days() <= self.config.recent_landing_days)
    }

    fn secondary_reasons(&self, r: &AirportRecord, verdict: Verdict, reasons: &mut Vec<String>) {
        let fuel = match (r.contract_fuel, r.military) {
            (Some(true), _) | (_, Some(true)) => "contract fuel available",
            (Some(false), _) => "no contract fuel on record",
            (None, _) => "contract fuel status unknown",
        };
        reasons.push(fuel.to_string());

        if let Some(date) = r.last_landed {
            match &r.crew {
                Some(crew) => reasons.push(format!("last landed {} ({})", date.format("%d %b %Y"), crew)),
                None => reasons.push(format!("last landed {}", date.format("%d %b %Y"))),
            }
        }

        if r.landing_issues {
            reasons.push("issues reported with recent landing".to_string());
        }

        // Rule 3 already explains missing coordinates.
        if !r.has_coordinates() && verdict != Verdict::InsufficientData {
            reasons.push("coordinates unknown".to_string());
        }

        // Stale provenance, one line per source.
        let mut stale: BTreeMap<_, (chrono::DateTime<chrono::Utc>, Vec<&str>)> = BTreeMap::new();
        for (field, origin) in &r.provenance {
            if let FieldOrigin::Source {
                source,
                fetched_at,
                stale: true,
            } = origin
            {
                stale
                    .entry(*source)
                    .or_insert_with(|| (*fetched_at, Vec::new()))
                    .1
                    .push(RecordField::label(*field));
            }
        }
        for (source, (fetched_at, fields)) in stale {
            reasons.push(format!(
                "{} from stale {} cache (fetched {})",
                fields.join(", "),
                source,
                fetched_at.format("%Y-%m-%d")
            ));
        }

        if let Some(comment) = &r.comment {
            reasons.push(comment.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AirportId, ListMembership, SourceKind};
    use crate::services::identifiers::AliasTable;
    use rust_decimal::Decimal;

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig {
            min_lda_ft: 7000,
            recent_landing_days: 365,
            as_of: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
        })
    }

    fn airport(code: &str, lda: Option<u32>) -> AirportRecord {
        let id: AirportId = AliasTable::new().resolve(code).unwrap();
        let mut r = AirportRecord::empty(id);
        r.latitude = Some(Decimal::new(318, 1));
        r.longitude = Some(Decimal::new(-1064, 1));
        r.lda_ft = lda;
        r
    }

    fn has(result: &ClassificationResult, needle: &str) -> bool {
        result.reasons.iter().any(|r| r.contains(needle))
    }

    #[test]
    fn test_airport_x_jasu_without_recent_ops_is_blue() {
        let mut x = airport("KXXX", Some(7200));
        x.jasu = Some(true);
        x.recent_landing_override = Some(false);

        let result = classifier().classify(&x);
        assert_eq!(result.verdict, Verdict::Eligible);
        assert_eq!(result.marker, Marker::Blue);
        assert_eq!(result.reasons[0], "JASU listed, no recent ops recorded");
    }

    #[test]
    fn test_airport_y_whitelisted_short_runway_gets_caveat() {
        let mut y = airport("KYYY", Some(6500));
        y.list = ListMembership::Whitelisted;

        let result = classifier().classify(&y);
        assert_eq!(result.verdict, Verdict::EligibleWithCaveat);
        assert!(result.verdict.is_eligible());
        assert!(has(&result, "insufficient landing distance"));
        assert!(has(&result, "whitelisted override"));
        assert_eq!(result.marker, Marker::Yellow);
    }

    #[test]
    fn test_airport_z_blacklist_wins_regardless_of_lda() {
        let mut z = airport("KZZZ", Some(9000));
        z.list = ListMembership::Blacklisted;
        z.jasu = Some(true);

        let result = classifier().classify(&z);
        assert_eq!(result.verdict, Verdict::Ineligible);
        assert_eq!(result.marker, Marker::RedCircle);
        assert_eq!(result.reasons[0], "blacklisted by override");
    }

    #[test]
    fn test_category_one_is_red_circle() {
        let mut r = airport("KAAA", Some(10000));
        r.category = Category::One;
        let result = classifier().classify(&r);
        assert_eq!(result.marker, Marker::RedCircle);
        assert!(has(&result, "category 1 / T-38 prohibited"));
    }

    #[test]
    fn test_category_beats_lda_and_jasu() {
        let mut r = airport("KAAA", Some(5000));
        r.category = Category::Two;
        r.jasu = Some(true);
        let result = classifier().classify(&r);
        assert_eq!(result.verdict, Verdict::EligibleWithRestriction);
        assert_eq!(result.marker, Marker::RedDiamond);
        assert_eq!(result.reasons[0], "category 2: Form 740A required");
    }

    #[test]
    fn test_whitelisted_without_coordinates_is_insufficient_data() {
        let mut r = airport("KAAA", None);
        r.latitude = None;
        r.longitude = None;
        r.list = ListMembership::Whitelisted;
        let result = classifier().classify(&r);
        assert_eq!(result.verdict, Verdict::InsufficientData);
        assert_eq!(result.marker, Marker::Yellow);
    }

    #[test]
    fn test_short_runway_is_hidden() {
        let mut r = airport("KAAA", Some(6999));
        r.jasu = Some(true);
        let result = classifier().classify(&r);
        assert_eq!(result.verdict, Verdict::Ineligible);
        assert_eq!(result.marker, Marker::Hidden);
    }

    #[test]
    fn test_exact_minimum_passes() {
        let r = airport("KAAA", Some(7000));
        assert!(classifier().classify(&r).verdict.is_eligible());
    }

    #[test]
    fn test_recent_landing_is_green_unless_issues() {
        let mut r = airport("KAAA", Some(8000));
        r.last_landed = NaiveDate::from_ymd_opt(2026, 3, 1);
        r.crew = Some("ABC / DEF".to_string());
        let result = classifier().classify(&r);
        assert_eq!(result.marker, Marker::Green);
        assert!(has(&result, "last landed 01 Mar 2026 (ABC / DEF)"));

        r.landing_issues = true;
        r.jasu = Some(true);
        let result = classifier().classify(&r);
        assert_eq!(result.marker, Marker::Blue);
        assert!(has(&result, "issues reported"));
    }

    #[test]
    fn test_old_landing_is_not_recent() {
        let mut r = airport("KAAA", Some(8000));
        r.last_landed = NaiveDate::from_ymd_opt(2024, 1, 1);
        r.jasu = Some(false);
        let result = classifier().classify(&r);
        assert_eq!(result.verdict, Verdict::EligibleNeedsVerification);
        assert_eq!(result.marker, Marker::Yellow);
        assert!(!has(&result, "JASU status unknown"));
    }

    #[test]
    fn test_unknowns_are_reasons_not_verdicts() {
        let r = airport("KAAA", None);
        let result = classifier().classify(&r);
        assert_eq!(result.verdict, Verdict::EligibleNeedsVerification);
        assert_eq!(result.reasons[0], "no JASU on record — verify with FBO");
        assert!(has(&result, "landing distance unknown"));
        assert!(has(&result, "JASU status unknown"));
        assert!(has(&result, "contract fuel status unknown"));
    }

    #[test]
    fn test_fuel_never_gates() {
        let mut with_fuel = airport("KAAA", Some(8000));
        with_fuel.jasu = Some(true);
        with_fuel.contract_fuel = Some(true);
        let mut without = with_fuel.clone();
        without.contract_fuel = Some(false);

        let a = classifier().classify(&with_fuel);
        let b = classifier().classify(&without);
        assert_eq!((a.verdict, a.marker), (b.verdict, b.marker));
        assert!(has(&a, "contract fuel available"));
        assert!(has(&b, "no contract fuel on record"));
    }

    #[test]
    fn test_military_field_counts_as_fuel() {
        let mut r = airport("KAAA", Some(8000));
        r.military = Some(true);
        r.contract_fuel = Some(false);
        assert!(has(&classifier().classify(&r), "contract fuel available"));
    }

    #[test]
    fn test_stale_provenance_and_comment_reasons() {
        let mut r = airport("KAAA", Some(8000));
        let fetched: chrono::DateTime<chrono::Utc> = "2026-07-01T00:00:00Z".parse().unwrap();
        for field in [RecordField::Coordinates, RecordField::Lda] {
            r.provenance.insert(
                field,
                FieldOrigin::Source {
                    source: SourceKind::Runways,
                    fetched_at: fetched,
                    stale: true,
                },
            );
        }
        r.comment = Some(crate::models::Comment {
            text: "PPR required".to_string(),
            date: None,
        });
        let result = classifier().classify(&r);
        assert!(has(&result, "coordinates, landing distance from stale runways cache (fetched 2026-07-01)"));
        assert_eq!(result.reasons.last().map(String::as_str), Some("PPR required"));
    }

    #[test]
    fn test_recently_landed_no_overrides_flight_history() {
        let mut r = airport("KAAA", Some(8000));
        r.jasu = Some(true);
        r.last_landed = NaiveDate::from_ymd_opt(2026, 9, 1);
        r.recent_landing_override = Some(false);
        let result = classifier().classify(&r);
        assert_eq!(result.verdict, Verdict::Eligible);
        assert_eq!(result.marker, Marker::Blue);
        assert!(!has(&result, "recent verified ops"));
        assert!(has(&result, "last landed 01 Sep 2026"));

        r.recent_landing_override = None;
        assert_eq!(classifier().classify(&r).marker, Marker::Green);
    }

    #[test]
    fn test_missing_coordinates_is_reported() {
        let mut r = airport("KAAA", Some(8000));
        r.latitude = None;
        r.longitude = None;
        r.jasu = Some(true);
        r.comment = Some(crate::models::Comment {
            text: "PPR required".to_string(),
            date: None,
        });
        let result = classifier().classify(&r);
        assert_eq!(result.marker, Marker::Blue);
        assert!(has(&result, "coordinates unknown"));
        assert_eq!(result.reasons.last().map(String::as_str), Some("PPR required"));

        r.list = ListMembership::Whitelisted;
        let result = classifier().classify(&r);
        assert_eq!(result.verdict, Verdict::InsufficientData);
        assert!(!result.verdict.is_eligible());
        assert!(!has(&result, "coordinates unknown"));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let mut r = airport("KAAA", Some(8000));
        r.jasu = Some(true);
        r.contract_fuel = Some(true);
        assert_eq!(classifier().classify(&r), classifier().classify(&r));
    }
}
