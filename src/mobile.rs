//! Mobile bindings for HAT Core.
//!
//! A flat API over [`HatContext`] for Swift and Kotlin, exposed via UniFFI.
//! Async operations run to completion on the client's own current-thread
//! runtime, which also owns the HTTP connection pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::auth::FileSecureStore;
use crate::context::HatContext;
use crate::error::HatError;
use crate::models::{LocationPreferences, NoteKind, NoteRecord};
use crate::recorder::{LocationFix, RecordOutcome};
use crate::sync_engine::SyncOutcome;

/// Error type exposed to Swift and Kotlin via UniFFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum HatCoreError {
    #[error("Invalid measurement: {msg}")]
    InvalidMeasurement { msg: String },
    #[error("Storage error: {msg}")]
    Storage { msg: String },
    #[error("Not logged in: {msg}")]
    Unauthorized { msg: String },
    #[error("Network error: {msg}")]
    Network { msg: String },
    #[error("Server error: {msg}")]
    Server { msg: String },
    #[error("Validation error: {msg}")]
    Validation { msg: String },
    #[error("Configuration error: {msg}")]
    Config { msg: String },
}

impl From<HatError> for HatCoreError {
    fn from(err: HatError) -> Self {
        match err {
            HatError::InvalidMeasurement(msg) => HatCoreError::InvalidMeasurement { msg },
            HatError::StoreUnavailable(msg) => HatCoreError::Storage { msg },
            HatError::Unauthorized(msg) => HatCoreError::Unauthorized { msg },
            HatError::Network(msg) => HatCoreError::Network { msg },
            e @ HatError::TableNotFound { .. } => HatCoreError::Server { msg: e.to_string() },
            e @ HatError::UnexpectedResponse { .. } => HatCoreError::Server { msg: e.to_string() },
            HatError::NotFound(msg) => HatCoreError::Server { msg },
            HatError::Validation { field, message } => HatCoreError::Validation {
                msg: format!("{}: {}", field, message),
            },
            HatError::Config(msg) => HatCoreError::Config { msg },
            HatError::Io(e) => HatCoreError::Storage { msg: e.to_string() },
            HatError::Json(e) => HatCoreError::Config { msg: e.to_string() },
        }
    }
}

/// A note as shown to the user
#[derive(Debug, Clone, uniffi::Record)]
pub struct NoteData {
    pub remote_id: Option<i64>,
    pub local_id: Option<i64>,
    pub message: String,
    pub kind: String,
    /// RFC 3339
    pub created_at: String,
    pub updated_at: String,
    pub shared: bool,
    pub shared_on: String,
    pub public_until: Option<String>,
}

impl From<NoteRecord> for NoteData {
    fn from(note: NoteRecord) -> Self {
        Self {
            remote_id: note.id,
            local_id: note.local_id,
            message: note.message,
            kind: note.kind.to_string(),
            created_at: note.created_at.to_rfc3339(),
            updated_at: note.updated_at.to_rfc3339(),
            shared: note.shared,
            shared_on: note.shared_on,
            public_until: note.public_until.map(|t| t.to_rfc3339()),
        }
    }
}

/// Sync cycle result
#[derive(Debug, Clone, uniffi::Record)]
pub struct SyncResultData {
    pub success: bool,
    /// completed, reauth_required, retry_later, failed, timed_out or already_running
    pub outcome: String,
    pub notes_posted: u32,
    pub notes_fetched: u32,
    pub samples_uploaded: u32,
    pub samples_purged: u32,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct LocationPreferencesData {
    pub desired_accuracy: f64,
    pub distance_filter: f64,
    pub max_stale_secs: u64,
}

fn outcome_name(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Completed => "completed",
        SyncOutcome::ReauthRequired => "reauth_required",
        SyncOutcome::RetryLater => "retry_later",
        SyncOutcome::Failed => "failed",
        SyncOutcome::TimedOut => "timed_out",
        SyncOutcome::AlreadyRunning => "already_running",
    }
}

/// Check a HAT address before offering log in
#[uniffi::export]
pub fn is_valid_hat_domain(domain: String) -> bool {
    crate::auth::verify_hat_domain(&domain)
}

/// Main client for HAT operations on mobile hosts
#[derive(uniffi::Object)]
pub struct HatClient {
    context: HatContext,
    runtime: tokio::runtime::Runtime,
}

impl HatClient {
    fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

#[uniffi::export]
impl HatClient {
    /// Create a client keeping its files under `data_dir`
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Result<Arc<Self>, HatCoreError> {
        let data_path = PathBuf::from(&data_dir);
        std::fs::create_dir_all(&data_path).map_err(|e| HatCoreError::Storage {
            msg: format!("Failed to create data directory: {}", e),
        })?;

        let secure_store = Arc::new(FileSecureStore::open(data_path.join("secure.json"))?);
        let context = HatContext::open(data_path, secure_store)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| HatCoreError::Config {
                msg: format!("Failed to create runtime: {}", e),
            })?;

        Ok(Arc::new(Self { context, runtime }))
    }

    pub fn log_in(&self, domain: String, token: String) -> Result<(), HatCoreError> {
        Ok(self.context.log_in(&domain, &token)?)
    }

    pub fn log_out(&self) -> Result<(), HatCoreError> {
        Ok(self.context.log_out()?)
    }

    pub fn is_logged_in(&self) -> bool {
        self.context.is_logged_in()
    }

    pub fn hat_domain(&self) -> Option<String> {
        self.context.hat_domain()
    }

    pub fn get_notes(&self) -> Result<Vec<NoteData>, HatCoreError> {
        Ok(self
            .context
            .notes()?
            .into_iter()
            .map(NoteData::from)
            .collect())
    }

    /// Save a note locally; `kind` is note, blog or list
    pub fn create_note(&self, message: String, kind: String) -> Result<NoteData, HatCoreError> {
        let kind: NoteKind = kind.parse()?;
        Ok(self.context.create_note(&message, kind)?.into())
    }

    pub fn delete_note(&self, note: NoteData) -> Result<(), HatCoreError> {
        let mut record = NoteRecord::new(note.message, NoteKind::Note);
        record.id = note.remote_id;
        record.local_id = note.local_id;
        self.block_on(self.context.delete_note(&record))?;
        Ok(())
    }

    /// Run a sync cycle; `window_secs` is the time the OS granted
    pub fn sync_now(&self, window_secs: Option<u32>) -> Result<SyncResultData, HatCoreError> {
        let window = window_secs.map(|s| Duration::from_secs(u64::from(s)));
        let result = self.block_on(self.context.force_sync(window))?;

        Ok(SyncResultData {
            success: result.success(),
            outcome: outcome_name(result.outcome).to_string(),
            notes_posted: result.notes_posted as u32,
            notes_fetched: result.notes_fetched as u32,
            samples_uploaded: result.samples_uploaded as u32,
            samples_purged: result.samples_purged as u32,
            error_message: if result.errors.is_empty() {
                None
            } else {
                Some(result.errors.join("; "))
            },
        })
    }

    /// Returns the number of samples purged
    pub fn on_foreground(&self) -> Result<u32, HatCoreError> {
        Ok(self.context.on_foreground()? as u32)
    }

    /// Offer a sensor fix. Returns true when it was stored.
    pub fn record_fix(
        &self,
        latitude: f64,
        longitude: f64,
        horizontal_accuracy: f64,
        timestamp_millis: i64,
    ) -> Result<bool, HatCoreError> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(timestamp_millis).ok_or_else(|| {
            HatCoreError::Validation {
                msg: format!("timestamp out of range: {}", timestamp_millis),
            }
        })?;

        let outcome = self.context.record_fix(LocationFix {
            latitude,
            longitude,
            horizontal_accuracy,
            timestamp,
        })?;
        Ok(matches!(outcome, RecordOutcome::Stored(_)))
    }

    pub fn set_location_preferences(&self, prefs: LocationPreferencesData) -> Result<(), HatCoreError> {
        Ok(self.context.set_location_preferences(LocationPreferences {
            desired_accuracy: prefs.desired_accuracy,
            distance_filter: prefs.distance_filter,
            max_stale_secs: prefs.max_stale_secs,
        })?)
    }

    pub fn set_tracking_enabled(&self, enabled: bool) -> Result<(), HatCoreError> {
        Ok(self.context.set_tracking_enabled(enabled)?)
    }

    pub fn pending_sample_count(&self) -> Result<i64, HatCoreError> {
        Ok(self.context.pending_sample_count()?)
    }
}
