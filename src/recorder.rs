//! Location capture.
//!
//! Fixes from the host's location sensor pass through the sample filter and
//! the accepted ones are appended to the local store.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::HatResult;
use crate::models::{LocationPreferences, LocationSample};
use crate::sample_filter;
use crate::store::LocalStore;

/// A raw fix as delivered by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Negative when the sensor could not estimate a position
    pub horizontal_accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Stored under the given row id
    Stored(i64),
    /// Valid but not significant
    Filtered,
    /// Negative accuracy
    Invalid,
    TrackingDisabled,
}

pub struct LocationRecorder {
    store: Arc<Mutex<LocalStore>>,
    config: Arc<Mutex<Config>>,
}

impl LocationRecorder {
    pub fn new(store: Arc<Mutex<LocalStore>>, config: Arc<Mutex<Config>>) -> Self {
        Self { store, config }
    }

    /// Filter a fix and store it if significant.
    pub fn record_fix(&self, fix: LocationFix) -> HatResult<RecordOutcome> {
        let (enabled, prefs) = {
            let config = self.config.lock()?;
            (config.is_tracking_enabled(), config.location_preferences())
        };
        if !enabled {
            return Ok(RecordOutcome::TrackingDisabled);
        }

        let sample = LocationSample::new(
            fix.latitude,
            fix.longitude,
            fix.horizontal_accuracy,
            fix.timestamp,
        );
        if !sample.is_valid_measurement() {
            tracing::debug!(accuracy = fix.horizontal_accuracy, "Dropping invalid fix");
            return Ok(RecordOutcome::Invalid);
        }

        // Read and insert under one lock so the previous sample cannot change
        let store = self.store.lock()?;
        let previous = store.last_sample()?;
        if !sample_filter::accept_with_preferences(&sample, previous.as_ref(), &prefs) {
            return Ok(RecordOutcome::Filtered);
        }

        let id = store.insert_sample(&sample)?;
        tracing::debug!(id, accuracy = sample.horizontal_accuracy, "Stored location sample");
        Ok(RecordOutcome::Stored(id))
    }

    pub fn preferences(&self) -> HatResult<LocationPreferences> {
        Ok(self.config.lock()?.location_preferences())
    }

    /// Replace the filter preferences (persisted)
    pub fn set_preferences(&self, prefs: LocationPreferences) -> HatResult<()> {
        self.config.lock()?.set_location_preferences(prefs)
    }

    pub fn set_tracking_enabled(&self, enabled: bool) -> HatResult<()> {
        self.config.lock()?.set_tracking_enabled(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn recorder() -> (LocationRecorder, Arc<Mutex<LocalStore>>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Mutex::new(Config::new(dir.path().to_path_buf()).unwrap()));
        let store = Arc::new(Mutex::new(LocalStore::open_in_memory().unwrap()));
        (LocationRecorder::new(store.clone(), config), store, dir)
    }

    fn fix(lat: f64, accuracy: f64, secs: i64) -> LocationFix {
        LocationFix {
            latitude: lat,
            longitude: -0.1,
            horizontal_accuracy: accuracy,
            timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_first_fix_is_stored() {
        let (recorder, store, _dir) = recorder();
        let outcome = recorder.record_fix(fix(51.5, 300.0, 0)).unwrap();
        assert!(matches!(outcome, RecordOutcome::Stored(_)));
        assert_eq!(store.lock().unwrap().sample_count().unwrap(), 1);
    }

    #[test]
    fn test_insignificant_fix_is_filtered() {
        let (recorder, store, _dir) = recorder();
        recorder.record_fix(fix(51.5, 5.0, 0)).unwrap();
        let outcome = recorder.record_fix(fix(51.50001, 5.0, 30)).unwrap();
        assert_eq!(outcome, RecordOutcome::Filtered);
        assert_eq!(store.lock().unwrap().sample_count().unwrap(), 1);
    }

    #[test]
    fn test_invalid_fix_is_dropped() {
        let (recorder, store, _dir) = recorder();
        assert_eq!(
            recorder.record_fix(fix(51.5, -1.0, 0)).unwrap(),
            RecordOutcome::Invalid
        );
        assert_eq!(store.lock().unwrap().sample_count().unwrap(), 0);
    }

    #[test]
    fn test_tracking_disabled() {
        let (recorder, store, _dir) = recorder();
        recorder.set_tracking_enabled(false).unwrap();
        assert_eq!(
            recorder.record_fix(fix(51.5, 5.0, 0)).unwrap(),
            RecordOutcome::TrackingDisabled
        );
        assert_eq!(store.lock().unwrap().sample_count().unwrap(), 0);
    }

    #[test]
    fn test_preferences_apply_to_next_fix() {
        let (recorder, _store, _dir) = recorder();
        recorder.record_fix(fix(51.5, 5.0, 0)).unwrap();

        // ~111 m north with the default 50 m filter is accepted
        assert!(matches!(
            recorder.record_fix(fix(51.501, 5.0, 30)).unwrap(),
            RecordOutcome::Stored(_)
        ));

        let prefs = LocationPreferences {
            distance_filter: 500.0,
            ..recorder.preferences().unwrap()
        };
        recorder.set_preferences(prefs).unwrap();
        assert_eq!(
            recorder.record_fix(fix(51.502, 5.0, 60)).unwrap(),
            RecordOutcome::Filtered
        );
    }
}
