//! HatCore - the synchronization core of a local-first HAT client.
//!
//! This library provides what a mobile HAT client needs below its UI:
//! - Location capture with a significance filter
//! - Local buffering of samples and notes (SQLite)
//! - Remote table negotiation and a windowed sync cycle against a HAT
//! - Note deduplication
//! - Access token handling and configuration management
//!
//! Hosts construct a [`HatContext`] per session, or use the UniFFI bindings.
//!
//! # Feature Flags
//!
//! - `uniffi`: Generate UniFFI bindings for mobile platforms (iOS, Android).

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod dedup;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod recorder;
pub mod sample_filter;
pub mod schema;
pub mod store;
pub mod sync_engine;

// Mobile bindings module
#[cfg(feature = "uniffi")]
pub mod mobile;

// UniFFI scaffolding (must be at crate root)
#[cfg(feature = "uniffi")]
uniffi::setup_scaffolding!();

// Re-export commonly used types
pub use api::{HatApi, HttpTransport, Transport};
pub use auth::{AuthSession, FileSecureStore, MemorySecureStore, SecureStore};
pub use config::Config;
pub use context::HatContext;
pub use error::{HatError, HatResult};
pub use events::SyncEvent;
pub use models::{
    AuthToken, LocationPreferences, LocationSample, NoteAttachments, NoteKind, NoteRecord,
    RemoteTableHandle,
};
pub use recorder::{LocationFix, LocationRecorder, RecordOutcome};
pub use store::LocalStore;
pub use sync_engine::{SyncEngine, SyncOutcome, SyncResult};

// Re-export mobile types when uniffi feature is enabled
#[cfg(feature = "uniffi")]
pub use mobile::{
    is_valid_hat_domain, HatClient, HatCoreError, LocationPreferencesData, NoteData,
    SyncResultData,
};
