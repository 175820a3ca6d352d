//! Airport identifier normalization and alias resolution.
//!
//! Sources spell the same airport differently: NASR carries both the FAA
//! location id ("ELP") and the ICAO code ("KELP"), the chart supplement prints
//! "( K ELP )", and hand-typed sheets add stray whitespace and lowercase.
//!
//! Normalization ([`normalize_identifier`]):
//! 1. strip parentheses and every whitespace character
//! 2. uppercase (ASCII)
//! 3. accept only 3–4 ASCII alphanumerics
//!
//! Resolution ([`AliasTable::resolve`]), first match wins:
//! 1. an alias claimed by two different airports is rejected as ambiguous
//! 2. a known canonical id resolves to itself
//! 3. a known alias resolves to its canonical id
//! 4. a 3-character code resolves to `K` + code if that is a known canonical id
//! 5. a 4-letter code is accepted as an ICAO-shaped canonical id
//! 6. anything else is unknown and the row is dropped

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{AirportId, SourceKind, SourcePartialRecord};

/// Why an identifier could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AliasError {
    #[error("'{0}' is not a valid airport identifier")]
    Invalid(String),
    #[error("'{0}' is claimed by more than one airport")]
    Ambiguous(String),
    #[error("'{0}' does not match any known airport")]
    Unknown(String),
}

/// Normalize a raw identifier cell. Returns `None` if it cannot be an airport code.
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let code: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '(' && *c != ')')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let valid = (3..=4).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then_some(code)
}

/// Deterministic identifier → canonical id lookup.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    canonical: BTreeSet<String>,
    aliases: BTreeMap<String, String>,
    ambiguous: BTreeSet<String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from runway master records plus fixed configured aliases.
    ///
    /// Each runway record contributes its own id as canonical and its FAA id
    /// as an alias of it.
    pub fn from_runway_records<'a>(
        records: impl IntoIterator<Item = &'a SourcePartialRecord>,
        fixed: &BTreeMap<String, String>,
    ) -> Self {
        let mut table = Self::new();
        let records: Vec<&SourcePartialRecord> = records
            .into_iter()
            .filter(|r| r.source == SourceKind::Runways)
            .collect();

        for record in &records {
            table.insert_canonical(&record.source_id);
        }
        for canonical in fixed.values() {
            table.insert_canonical(canonical);
        }
        for record in &records {
            if let Some(faa) = &record.fields.faa_id {
                table.insert_alias(faa, &record.source_id);
            }
        }
        for (alias, canonical) in fixed {
            table.insert_alias(alias, canonical);
        }

        tracing::debug!(
            "Alias table: {} canonical ids, {} aliases, {} ambiguous",
            table.canonical.len(),
            table.aliases.len(),
            table.ambiguous.len()
        );
        table
    }

    pub fn insert_canonical(&mut self, id: &str) {
        if let Some(code) = normalize_identifier(id) {
            self.canonical.insert(code);
        }
    }

    /// Register `alias` → `canonical`. An alias seen with two different targets
    /// is marked ambiguous and never resolves.
    pub fn insert_alias(&mut self, alias: &str, canonical: &str) {
        let (Some(alias), Some(canonical)) =
            (normalize_identifier(alias), normalize_identifier(canonical))
        else {
            return;
        };
        if alias == canonical || self.ambiguous.contains(&alias) {
            return;
        }
        if self.canonical.contains(&alias) {
            // An FAA id that is also some other airport's canonical id.
            tracing::warn!(
                "Alias '{}' → '{}' collides with a canonical id; marking ambiguous",
                alias,
                canonical
            );
            self.ambiguous.insert(alias);
            return;
        }
        match self.aliases.get(&alias) {
            Some(existing) if *existing != canonical => {
                tracing::warn!(
                    "Alias '{}' claimed by both '{}' and '{}'; marking ambiguous",
                    alias,
                    existing,
                    canonical
                );
                self.aliases.remove(&alias);
                self.ambiguous.insert(alias);
            }
            Some(_) => {}
            None => {
                self.aliases.insert(alias, canonical);
            }
        }
    }

    pub fn resolve(&self, raw: &str) -> Result<AirportId, AliasError> {
        let code = normalize_identifier(raw).ok_or_else(|| AliasError::Invalid(raw.to_string()))?;

        if self.ambiguous.contains(&code) {
            return Err(AliasError::Ambiguous(code));
        }
        if self.canonical.contains(&code) {
            return Ok(AirportId::from_normalized(code));
        }
        if let Some(canonical) = self.aliases.get(&code) {
            return Ok(AirportId::from_normalized(canonical.clone()));
        }
        if code.len() == 3 {
            let prefixed = format!("K{}", code);
            if self.canonical.contains(&prefixed) {
                return Ok(AirportId::from_normalized(prefixed));
            }
        }
        if code.len() == 4 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Ok(AirportId::from_normalized(code));
        }
        Err(AliasError::Unknown(code))
    }
}
