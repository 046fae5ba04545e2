use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Two descriptors of different length were compared or stored together.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("descriptor length mismatch: expected {expected} values, found {found}")]
pub struct LengthMismatch {
    pub expected: usize,
    pub found: usize,
}

/// Fixed-length face embedding produced by the descriptor extractor.
///
/// Serialised as a bare array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Fails unless `other` has the same length as `self`.
    pub fn ensure_same_len(&self, other: &Descriptor) -> Result<(), LengthMismatch> {
        if self.len() == other.len() {
            Ok(())
        } else {
            Err(LengthMismatch {
                expected: self.len(),
                found: other.len(),
            })
        }
    }

    /// Euclidean distance `sqrt(sum((a_i - b_i)^2))`.
    ///
    /// Undefined for descriptors of different length, which is reported
    /// instead of silently truncating to the shorter one.
    pub fn distance(&self, other: &Descriptor) -> Result<f32, LengthMismatch> {
        self.ensure_same_len(other)?;
        Ok(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// One enrolled identity as persisted by the identity store.
///
/// Names are not unique: enrolling the same name twice yields two
/// independent records, and both take part in matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    #[serde(rename = "vector")]
    pub descriptor: Descriptor,
    /// Stored as epoch milliseconds under `timestamp`.
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub enrolled_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn new(name: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            name: name.into(),
            descriptor,
            enrolled_at: now_millis(),
        }
    }
}

/// Current time truncated to millisecond precision, the resolution the
/// stores persist.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
