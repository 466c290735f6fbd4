use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const F32_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    #[error("feature payload of {0} bytes is not a whole number of f32 values")]
    RaggedBytes(usize),
    #[error("feature vector length mismatch: query has {query}, template has {template}")]
    LengthMismatch { query: usize, template: usize },
}

/// Fixed-length face feature vector as produced by the capture device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Decode consecutive little-endian `f32` values.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, FeatureError> {
        if bytes.len() % F32_BYTES != 0 {
            return Err(FeatureError::RaggedBytes(bytes.len()));
        }
        let values = bytes
            .chunks_exact(F32_BYTES)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self(values))
    }

    /// Encode as consecutive little-endian `f32` values.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance between two vectors of equal length.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> Result<f32, FeatureError> {
        if self.len() != other.len() {
            return Err(FeatureError::LengthMismatch {
                query: self.len(),
                template: other.len(),
            });
        }
        Ok(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }

    /// Similarity in [0, 1]: `1 - distance / scale`, clamped.
    ///
    /// `scale` is the calibration distance at which two vectors are
    /// considered entirely dissimilar.
    pub fn similarity(&self, other: &FeatureVector, scale: f32) -> Result<f32, FeatureError> {
        let distance = self.euclidean_distance(other)?;
        Ok((1.0 - distance / scale).clamp(0.0, 1.0))
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// One capture attempt reported by the device. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSample {
    pub features: FeatureVector,
    /// Device-reported detection confidence (0–1).
    pub confidence: f32,
    pub detected: bool,
}

impl CaptureSample {
    pub fn detected(features: FeatureVector, confidence: f32) -> Self {
        Self {
            features,
            confidence,
            detected: true,
        }
    }

    /// A sample for a frame in which no face was found.
    pub fn empty() -> Self {
        Self {
            features: FeatureVector::default(),
            confidence: 0.0,
            detected: false,
        }
    }
}

/// A stored feature vector bound to a user.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceTemplate {
    pub owner_id: String,
    pub features: FeatureVector,
    /// Sample confidence at enrollment time.
    pub confidence: f32,
}

impl FaceTemplate {
    pub fn from_sample(owner_id: impl Into<String>, sample: &CaptureSample) -> Self {
        Self {
            owner_id: owner_id.into(),
            features: sample.features.clone(),
            confidence: sample.confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub absence_count: u32,
    #[serde(default)]
    pub is_dropped: bool,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            absence_count: 0,
            is_dropped: false,
        }
    }

    /// Whether `id` can key a user. Ids double as template file names, so
    /// blanks, `.`/`..`, path separators and NUL are rejected.
    pub fn is_valid_id(id: &str) -> bool {
        !id.trim().is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
    Dropped,
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Present => "present",
            Self::Late => "late",
            Self::Absent => "absent",
            Self::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

/// One ledger entry. At most one per user per local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
}

/// Status of a user on a given day. Days without a record are never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayStatus {
    NoRecord,
    Marked(AttendanceStatus),
}

/// Ledger row for reporting, joined with the user's name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEntry {
    pub user_id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
}

/// Per-status tally of one local day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayReport {
    pub date: NaiveDate,
    pub present: usize,
    pub late: usize,
    pub absent: usize,
    pub dropped: usize,
    /// Eligible users with no record that day.
    pub unmarked: usize,
}

impl DayReport {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            present: 0,
            late: 0,
            absent: 0,
            dropped: 0,
            unmarked: 0,
        }
    }

    pub fn count(&mut self, status: AttendanceStatus) {
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Dropped => self.dropped += 1,
        }
    }

    /// Records counted for the day.
    pub fn recorded(&self) -> usize {
        self.present + self.late + self.absent + self.dropped
    }
}

/// Roster row for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub id: String,
    pub name: String,
    pub absence_count: u32,
    pub is_dropped: bool,
}

impl From<&User> for UserEntry {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            name: user.name.clone(),
            absence_count: user.absence_count,
            is_dropped: user.is_dropped,
        }
    }
}
