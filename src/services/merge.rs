//! Merge Engine: per-source partial records + overrides → one record per airport.
//!
//! Each field is merged independently. Candidate sources for a field are ranked:
//!
//! 1. the field's authoritative source
//! 2. fresh before stale
//! 3. most recently fetched
//! 4. fixed source order ([`SourceKind::ALL`])
//!
//! The first source that has a value wins. Overrides are applied on top.
//! Membership-list sources that were acquired turn "not listed" into `false`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::models::{
    AirportId, AirportRecord, FieldOrigin, PartialFields, RecordField, RunwayLda, SourceKind,
    SourcePartialRecord,
};
use crate::services::overrides::OverrideSet;

/// One source's resolved records for this run.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub source: SourceKind,
    pub fetched_at: DateTime<Utc>,
    /// Came from an expired cache entry after a failed fetch.
    pub stale: bool,
    pub records: BTreeMap<AirportId, SourcePartialRecord>,
}

/// Which source is authoritative for each field.
#[derive(Debug, Clone)]
pub struct FieldAuthority {
    authorities: BTreeMap<RecordField, SourceKind>,
}

impl Default for FieldAuthority {
    fn default() -> Self {
        let authorities = BTreeMap::from([
            (RecordField::Coordinates, SourceKind::Runways),
            (RecordField::Lda, SourceKind::Runways),
            (RecordField::Runways, SourceKind::Runways),
            (RecordField::Military, SourceKind::Runways),
            (RecordField::ContractFuel, SourceKind::Fuel),
            (RecordField::Jasu, SourceKind::ChartSupplement),
            (RecordField::LastLanded, SourceKind::Flights),
        ]);
        Self { authorities }
    }
}

impl FieldAuthority {
    pub fn with(mut self, field: RecordField, source: SourceKind) -> Self {
        self.authorities.insert(field, source);
        self
    }

    pub fn authority(&self, field: RecordField) -> Option<SourceKind> {
        self.authorities.get(&field).copied()
    }
}

/// The field a membership-list source enumerates.
fn listed_field(source: SourceKind) -> Option<RecordField> {
    match source {
        SourceKind::Fuel => Some(RecordField::ContractFuel),
        SourceKind::ChartSupplement => Some(RecordField::Jasu),
        _ => None,
    }
}

/// Snapshots ordered by precedence for `field`.
fn ranked<'a>(
    snapshots: &'a BTreeMap<SourceKind, SourceSnapshot>,
    authority: Option<SourceKind>,
) -> Vec<&'a SourceSnapshot> {
    let mut order: Vec<&SourceSnapshot> = snapshots.values().collect();
    order.sort_by(|a, b| {
        let key = |s: &SourceSnapshot| {
            (
                Some(s.source) != authority,
                s.stale,
                std::cmp::Reverse(s.fetched_at),
                s.source,
            )
        };
        key(a).cmp(&key(b))
    });
    order
}

fn origin(snapshot: &SourceSnapshot) -> FieldOrigin {
    FieldOrigin::Source {
        source: snapshot.source,
        fetched_at: snapshot.fetched_at,
        stale: snapshot.stale,
    }
}

/// First value for `field` across the ranked snapshots.
///
/// `get` receives the airport's fields from that source (or `None` when the
/// source does not list it) and the source kind.
fn pick<T>(
    id: &AirportId,
    order: &[&SourceSnapshot],
    get: impl Fn(Option<&PartialFields>, SourceKind) -> Option<T>,
) -> Option<(T, FieldOrigin)> {
    order.iter().find_map(|snapshot| {
        let fields = snapshot.records.get(id).map(|r| &r.fields);
        get(fields, snapshot.source).map(|v| (v, origin(snapshot)))
    })
}

/// Membership value: listed → the source's value; acquired but not listed → `false`.
fn membership(
    field: RecordField,
    fields: Option<&PartialFields>,
    source: SourceKind,
    get: impl Fn(&PartialFields) -> Option<bool>,
) -> Option<bool> {
    match fields.and_then(|f| get(f)) {
        Some(v) => Some(v),
        None if listed_field(source) == Some(field) => Some(false),
        None => None,
    }
}

pub fn merge(
    snapshots: &BTreeMap<SourceKind, SourceSnapshot>,
    overrides: &OverrideSet,
    authority: &FieldAuthority,
) -> BTreeMap<AirportId, AirportRecord> {
    let ids: BTreeSet<&AirportId> = snapshots
        .values()
        .flat_map(|s| s.records.keys())
        .chain(overrides.ids())
        .collect();

    let orders: BTreeMap<RecordField, Vec<&SourceSnapshot>> = [
        RecordField::Coordinates,
        RecordField::Lda,
        RecordField::Runways,
        RecordField::Military,
        RecordField::ContractFuel,
        RecordField::Jasu,
        RecordField::LastLanded,
    ]
    .into_iter()
    .map(|f| (f, ranked(snapshots, authority.authority(f))))
    .collect();
    let order = |f: RecordField| orders.get(&f).map(Vec::as_slice).unwrap_or(&[]);

    let mut merged = BTreeMap::new();
    for id in ids {
        let mut record = AirportRecord::empty(id.clone());

        record.faa_id = pick(id, order(RecordField::Coordinates), |f, _| f?.faa_id.clone()).map(|(v, _)| v);

        let coords: Option<((Decimal, Decimal), FieldOrigin)> =
            pick(id, order(RecordField::Coordinates), |f, _| {
                let f = f?;
                f.latitude.zip(f.longitude)
            });
        if let Some(((lat, lon), from)) = coords {
            record.latitude = Some(lat);
            record.longitude = Some(lon);
            record.provenance.insert(RecordField::Coordinates, from);
        }

        if let Some((lda, from)) = pick(id, order(RecordField::Lda), |f, _| f?.lda_ft) {
            record.lda_ft = Some(lda);
            record.provenance.insert(RecordField::Lda, from);
        }

        let runways: Option<(Vec<RunwayLda>, FieldOrigin)> = pick(id, order(RecordField::Runways), |f, _| {
            let f = f?;
            (!f.runways.is_empty()).then(|| f.runways.clone())
        });
        if let Some((runways, from)) = runways {
            record.runways = runways;
            record.provenance.insert(RecordField::Runways, from);
        }

        if let Some((military, from)) = pick(id, order(RecordField::Military), |f, _| f?.military) {
            record.military = Some(military);
            record.provenance.insert(RecordField::Military, from);
        }

        if let Some((fuel, from)) = pick(id, order(RecordField::ContractFuel), |f, src| {
            membership(RecordField::ContractFuel, f, src, |p| p.contract_fuel)
        }) {
            record.contract_fuel = Some(fuel);
            record.provenance.insert(RecordField::ContractFuel, from);
        }

        if let Some((jasu, from)) = pick(id, order(RecordField::Jasu), |f, src| {
            membership(RecordField::Jasu, f, src, |p| p.jasu)
        }) {
            record.jasu = Some(jasu);
            record.provenance.insert(RecordField::Jasu, from);
        }

        let landing: Option<((NaiveDate, Option<String>), FieldOrigin)> =
            pick(id, order(RecordField::LastLanded), |f, _| {
                let f = f?;
                f.last_landed.map(|d| (d, f.crew.clone()))
            });
        if let Some(((date, crew), from)) = landing {
            record.last_landed = Some(date);
            record.crew = crew;
            record.provenance.insert(RecordField::LastLanded, from);
        }

        apply_override(&mut record, overrides);
        merged.insert(id.clone(), record);
    }

    tracing::debug!(
        "Merged {} airports from {} sources and {} overrides",
        merged.len(),
        snapshots.len(),
        overrides.len()
    );
    merged
}

fn apply_override(record: &mut AirportRecord, overrides: &OverrideSet) {
    let Some(row) = overrides.get(&record.id) else {
        return;
    };

    record.list = row.list;
    record.category = row.category.unwrap_or_default();
    record.comment = row.comment.clone();
    record.recent_landing_override = row.recently_landed;
    record.landing_issues = row.landing_issues;

    if let Some(date) = row.date_landed {
        record.last_landed = Some(date);
        record.crew = row.crew.clone();
        record.provenance.insert(RecordField::LastLanded, FieldOrigin::Override);
    }

    if !record.has_coordinates() {
        if let Some((lat, lon)) = row.coordinates {
            record.latitude = Some(lat);
            record.longitude = Some(lon);
            record.provenance.insert(RecordField::Coordinates, FieldOrigin::Override);
        }
    }
}
