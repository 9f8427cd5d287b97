// ABOUTME: Cursor values tracked as watermarks (integer ordinals or UTC timestamps)
// ABOUTME: Handles parsing, JSON extraction, ordering checks and range splitting

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A comparable cursor value.
///
/// Values of the same kind are totally ordered. Comparing an `Int` with a
/// `Timestamp` means the cursor field changed type, which [`compare`]
/// reports as an error instead of inventing an order.
///
/// [`compare`]: WatermarkValue::compare
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WatermarkValue {
    Int(i64),
    Timestamp(DateTime<Utc>),
}

impl WatermarkValue {
    /// Parse a configured literal: an integer, an RFC 3339 timestamp, or a
    /// `YYYY-MM-DD` date (midnight UTC).
    pub fn parse(literal: &str) -> Result<Self> {
        let trimmed = literal.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return Ok(WatermarkValue::Int(i));
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(WatermarkValue::Timestamp(ts.with_timezone(&Utc)));
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(WatermarkValue::Timestamp(Utc.from_utc_datetime(&midnight)));
            }
        }
        bail!(
            "Cannot parse '{}' as a cursor value (expected an integer, an RFC 3339 timestamp or YYYY-MM-DD)",
            literal
        )
    }

    /// Extract a cursor value from a record field.
    ///
    /// Integral numbers become `Int`, including doubles with no fractional
    /// part (MongoDB drivers often store counters as doubles). Strings
    /// holding RFC 3339 timestamps become `Timestamp`. Anything else has no
    /// cursor value.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().and_then(integral_f64))
                .map(WatermarkValue::Int),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| WatermarkValue::Timestamp(ts.with_timezone(&Utc))),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WatermarkValue::Int(_) => "int",
            WatermarkValue::Timestamp(_) => "timestamp",
        }
    }

    pub fn same_kind(&self, other: &WatermarkValue) -> bool {
        self.kind() == other.kind()
    }

    /// Order two values of the same kind.
    pub fn compare(&self, other: &WatermarkValue) -> Result<Ordering> {
        match (self, other) {
            (WatermarkValue::Int(a), WatermarkValue::Int(b)) => Ok(a.cmp(b)),
            (WatermarkValue::Timestamp(a), WatermarkValue::Timestamp(b)) => Ok(a.cmp(b)),
            _ => bail!(
                "Cannot compare cursor values of different kinds ({} vs {})",
                self.kind(),
                other.kind()
            ),
        }
    }

    /// True when `self` lies in `[lower, upper)`; a missing bound is open.
    pub fn in_range(
        &self,
        lower: Option<&WatermarkValue>,
        upper: Option<&WatermarkValue>,
    ) -> Result<bool> {
        if let Some(lower) = lower {
            if self.compare(lower)? == Ordering::Less {
                return Ok(false);
            }
        }
        if let Some(upper) = upper {
            if self.compare(upper)? != Ordering::Less {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Interior cut points dividing `[lower, upper]` into `parts` sub-ranges.
    ///
    /// Returns at most `parts - 1` strictly increasing values strictly between
    /// the bounds. Narrow ranges yield fewer cut points (possibly none).
    pub fn split_points(
        lower: &WatermarkValue,
        upper: &WatermarkValue,
        parts: usize,
    ) -> Result<Vec<WatermarkValue>> {
        if parts < 2 || lower.compare(upper)? != Ordering::Less {
            return Ok(Vec::new());
        }

        let (lo, hi) = match (lower, upper) {
            (WatermarkValue::Int(a), WatermarkValue::Int(b)) => (*a as i128, *b as i128),
            (WatermarkValue::Timestamp(a), WatermarkValue::Timestamp(b)) => (
                a.timestamp_millis() as i128,
                b.timestamp_millis() as i128,
            ),
            _ => bail!("cannot split a range of mixed cursor kinds"),
        };

        let span = hi - lo;
        let mut points: Vec<i128> = (1..parts as i128)
            .map(|i| lo + span * i / parts as i128)
            .filter(|p| *p > lo && *p < hi)
            .collect();
        points.dedup();

        Ok(points
            .into_iter()
            .filter_map(|p| match lower {
                WatermarkValue::Int(_) => Some(WatermarkValue::Int(p as i64)),
                WatermarkValue::Timestamp(_) => Utc
                    .timestamp_millis_opt(p as i64)
                    .single()
                    .map(WatermarkValue::Timestamp),
            })
            .collect())
    }
}

fn integral_f64(f: f64) -> Option<i64> {
    // i64::MAX is not exactly representable, hence the strict upper bound
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

impl std::fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatermarkValue::Int(i) => write!(f, "{}", i),
            WatermarkValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}
