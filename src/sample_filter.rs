//! Significance filter for location fixes.
//!
//! Decides whether a new reading is worth persisting, based on its accuracy,
//! the time since the previous stored sample, and the distance moved.
//! All functions here are pure.

use chrono::Duration;

use crate::models::{LocationPreferences, LocationSample};

/// Mean Earth radius in meters (IUGG)
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance between two samples in meters (haversine).
pub fn distance_meters(a: &LocationSample, b: &LocationSample) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Decide whether `candidate` should be stored.
///
/// Rules, in order:
/// 1. Negative accuracy is an invalid fix and is rejected.
/// 2. With no previous sample, or once more than `max_stale_interval` has
///    elapsed since it, any valid fix is accepted.
/// 3. Otherwise the fix must meet `desired_accuracy` and have moved at least
///    `distance_filter` minus the combined accuracy of both fixes.
pub fn accept(
    candidate: &LocationSample,
    previous: Option<&LocationSample>,
    desired_accuracy: f64,
    distance_filter: f64,
    max_stale_interval: Duration,
) -> bool {
    if candidate.horizontal_accuracy < 0.0 {
        return false;
    }

    let previous = match previous {
        Some(p) => p,
        None => return true,
    };

    if candidate.captured_at - previous.captured_at > max_stale_interval {
        return true;
    }

    accept_movement(
        candidate.horizontal_accuracy,
        previous.horizontal_accuracy,
        distance_meters(candidate, previous),
        desired_accuracy,
        distance_filter,
    )
}

/// Same as [`accept`] with thresholds taken from user preferences.
pub fn accept_with_preferences(
    candidate: &LocationSample,
    previous: Option<&LocationSample>,
    prefs: &LocationPreferences,
) -> bool {
    accept(
        candidate,
        previous,
        prefs.desired_accuracy,
        prefs.distance_filter,
        prefs.max_stale_interval(),
    )
}

/// Rule 3 on its own: accuracy bound plus uncertainty-adjusted distance.
pub fn accept_movement(
    candidate_accuracy: f64,
    previous_accuracy: f64,
    distance: f64,
    desired_accuracy: f64,
    distance_filter: f64,
) -> bool {
    candidate_accuracy <= desired_accuracy
        && distance >= distance_filter - (candidate_accuracy + previous_accuracy)
}
