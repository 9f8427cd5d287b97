// ABOUTME: Field-name normalization applied to every extracted record
// ABOUTME: Aliases raw keys to canonical names without ever dropping a field

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::record::Record;

/// Ordered raw-name to canonical-name table for one sync unit.
///
/// Order matters: when several raw fields map to the same canonical name the
/// pair applied last determines the surviving value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMapping {
    pairs: Vec<(String, String)>,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, R, C>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (R, C)>,
        R: Into<String>,
        C: Into<String>,
    {
        Self {
            pairs: pairs
                .into_iter()
                .map(|(raw, canonical)| (raw.into(), canonical.into()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs
            .iter()
            .map(|(raw, canonical)| (raw.as_str(), canonical.as_str()))
    }

    /// Canonical names produced by this mapping, in application order.
    pub fn canonical_names(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(_, canonical)| canonical.as_str())
    }
}

impl Serialize for FieldMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for (raw, canonical) in &self.pairs {
            map.serialize_entry(raw, canonical)?;
        }
        map.end()
    }
}

struct FieldMappingVisitor;

impl<'de> Visitor<'de> for FieldMappingVisitor {
    type Value = FieldMapping;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a table of raw field name = canonical field name")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<FieldMapping, A::Error> {
        let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((raw, canonical)) = access.next_entry::<String, String>()? {
            pairs.push((raw, canonical));
        }
        Ok(FieldMapping { pairs })
    }
}

impl<'de> Deserialize<'de> for FieldMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(FieldMappingVisitor)
    }
}

/// Normalize a record, discarding the collision count.
pub fn normalize(record: &Record, mapping: &FieldMapping) -> Record {
    normalize_with_report(record, mapping).0
}

/// Normalize a record and report how many canonical-name collisions occurred.
///
/// Every raw key is kept under its original name. For each mapping pair whose
/// raw key is present, the canonical key is set to the raw value. A canonical
/// key that already exists (as another raw field, or set by an earlier pair)
/// is overwritten and counted as a collision. Values are always read from the
/// input record, so pairs never chain.
pub fn normalize_with_report(record: &Record, mapping: &FieldMapping) -> (Record, usize) {
    let mut normalized = record.clone();
    let mut collisions = 0usize;

    for (raw, canonical) in mapping.iter() {
        if raw == canonical {
            continue;
        }
        let Some(value) = record.get(raw) else {
            continue;
        };
        if normalized.contains_key(canonical) {
            collisions += 1;
            tracing::trace!(
                "Canonical field '{}' already present; value from '{}' wins",
                canonical,
                raw
            );
        }
        normalized.insert(canonical.to_string(), value.clone());
    }

    (normalized, collisions)
}
