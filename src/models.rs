//! Data models for HAT Core.
//!
//! This module defines the core entities: LocationSample, NoteRecord,
//! RemoteTableHandle and AuthToken. All timestamps are UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HatError, HatResult};

/// One location fix.
///
/// `horizontal_accuracy` is never negative once stored; the sensor uses
/// negative values to signal an invalid fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Local row id (None until inserted)
    pub id: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of uncertainty in meters
    pub horizontal_accuracy: f64,
    pub captured_at: DateTime<Utc>,
    pub synced: bool,
}

impl LocationSample {
    /// Create a new, not yet stored sample
    pub fn new(latitude: f64, longitude: f64, horizontal_accuracy: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            latitude,
            longitude,
            horizontal_accuracy,
            captured_at,
            synced: false,
        }
    }

    /// Check if the fix carries a usable accuracy
    pub fn is_valid_measurement(&self) -> bool {
        self.horizontal_accuracy >= 0.0
    }
}

/// The kind of a note. Three types are available: note, blog or list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    Note,
    Blog,
    List,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Note => "note",
            NoteKind::Blog => "blog",
            NoteKind::List => "list",
        }
    }
}

impl fmt::Display for NoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteKind {
    type Err = HatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(NoteKind::Note),
            "blog" => Ok(NoteKind::Blog),
            "list" => Ok(NoteKind::List),
            other => Err(HatError::validation(
                "kind",
                format!("unknown note kind '{}'", other),
            )),
        }
    }
}

/// A user-authored note, either fetched from the HAT or written locally.
///
/// Two records are the same logical note iff `created_at` and `message` are
/// identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    /// Remote record id on the HAT (None until first sync)
    pub id: Option<i64>,
    /// Local row id (None for records that only exist remotely)
    pub local_id: Option<i64>,
    pub message: String,
    pub kind: NoteKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the record last changed on the HAT or on this device
    pub last_local_update: DateTime<Utc>,
    /// Comma separated list of services the note is shared on
    pub shared_on: String,
    pub shared: bool,
    pub public_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: NoteAttachments,
}

/// Optional sub-records a HAT note may carry. Kept as raw JSON and written
/// back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteAttachments {
    /// `authorv1`
    pub author: Option<serde_json::Value>,
    /// `photov1`
    pub photo: Option<serde_json::Value>,
    /// `locationv1`
    pub location: Option<serde_json::Value>,
}

impl NoteRecord {
    /// Create a new local note, stamped with the current time
    pub fn new(message: impl Into<String>, kind: NoteKind) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            local_id: None,
            message: message.into(),
            kind,
            created_at: now,
            updated_at: now,
            last_local_update: now,
            shared_on: String::new(),
            shared: false,
            public_until: None,
            attachments: NoteAttachments::default(),
        }
    }

    /// The logical-note equivalence key
    pub fn dedup_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.message.as_str())
    }

    /// Check if the record exists on the HAT
    pub fn is_remote(&self) -> bool {
        self.id.is_some()
    }
}

/// A remote table resolved by schema negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTableHandle {
    pub table_id: i64,
    pub table_name: String,
    pub source_name: String,
}

/// The HAT access token. Replaced wholesale on refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub value: String,
    pub obtained_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            obtained_at: Utc::now(),
        }
    }
}

// Keep token values out of logs.
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

/// Upper bound for `max_stale_secs` (one year)
pub const MAX_STALE_SECS: u64 = 365 * 24 * 3600;

/// User preferences driving the sample filter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationPreferences {
    /// Required accuracy in meters
    #[serde(default = "default_desired_accuracy")]
    pub desired_accuracy: f64,
    /// Minimum movement in meters between samples
    #[serde(default = "default_distance_filter")]
    pub distance_filter: f64,
    /// Seconds of silence after which any valid fix is accepted
    #[serde(default = "default_max_stale_secs")]
    pub max_stale_secs: u64,
}

fn default_desired_accuracy() -> f64 {
    100.0
}

fn default_distance_filter() -> f64 {
    50.0
}

fn default_max_stale_secs() -> u64 {
    3600
}

impl Default for LocationPreferences {
    fn default() -> Self {
        Self {
            desired_accuracy: default_desired_accuracy(),
            distance_filter: default_distance_filter(),
            max_stale_secs: default_max_stale_secs(),
        }
    }
}

impl LocationPreferences {
    /// The stale interval, capped at [`MAX_STALE_SECS`].
    pub fn max_stale_interval(&self) -> chrono::Duration {
        let secs = self.max_stale_secs.min(MAX_STALE_SECS) as i64;
        chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::zero())
    }

    /// Reject values the sample filter cannot work with.
    pub fn validate(&self) -> HatResult<()> {
        if !self.desired_accuracy.is_finite() || self.desired_accuracy < 0.0 {
            return Err(HatError::validation(
                "desired_accuracy",
                "must be a non-negative number of meters",
            ));
        }
        if !self.distance_filter.is_finite() || self.distance_filter < 0.0 {
            return Err(HatError::validation(
                "distance_filter",
                "must be a non-negative number of meters",
            ));
        }
        if self.max_stale_secs > MAX_STALE_SECS {
            return Err(HatError::validation(
                "max_stale_secs",
                format!("must be at most {}", MAX_STALE_SECS),
            ));
        }
        Ok(())
    }
}
