//! Application session for HAT Core.
//!
//! [`HatContext`] builds every component once and wires them together. Hosts
//! construct one per session and route user actions through it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::api::{HatApi, HttpTransport, Transport};
use crate::auth::{self, AuthSession, SecureStore, HAT_DOMAIN_KEY};
use crate::config::Config;
use crate::error::{HatError, HatResult};
use crate::events::{self, EventSender, SyncEvent};
use crate::models::{LocationPreferences, NoteKind, NoteRecord};
use crate::recorder::{LocationFix, LocationRecorder, RecordOutcome};
use crate::schema::SchemaNegotiator;
use crate::store::LocalStore;
use crate::sync_engine::{SyncEngine, SyncResult};

pub struct HatContext<T: Transport = HttpTransport> {
    config: Arc<Mutex<Config>>,
    store: Arc<Mutex<LocalStore>>,
    secure_store: Arc<dyn SecureStore>,
    auth: Arc<AuthSession>,
    api: Arc<HatApi<T>>,
    negotiator: Arc<SchemaNegotiator>,
    engine: SyncEngine<T>,
    recorder: LocationRecorder,
    events: EventSender,
}

impl HatContext<HttpTransport> {
    /// Open a session with its config and database under `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>, secure_store: Arc<dyn SecureStore>) -> HatResult<Self> {
        let config = Config::new(data_dir.into())?;
        let transport = HttpTransport::new(config.sync_config().request_timeout())?;
        let store = LocalStore::open(config.database_file())?;
        Self::assemble(config, store, secure_store, transport)
    }
}

impl<T: Transport> HatContext<T> {
    /// Wire the components around an explicit store and transport.
    pub fn assemble(
        config: Config,
        store: LocalStore,
        secure_store: Arc<dyn SecureStore>,
        transport: T,
    ) -> HatResult<Self> {
        let auth = Arc::new(AuthSession::restore(secure_store.clone())?);
        let domain = secure_store
            .get(HAT_DOMAIN_KEY)?
            .or_else(|| config.hat_domain().map(str::to_string));

        let config = Arc::new(Mutex::new(config));
        let store = Arc::new(Mutex::new(store));
        let events = events::channel();
        let api = Arc::new(HatApi::new(transport, auth.clone(), domain));
        let negotiator = Arc::new(SchemaNegotiator::new(events.clone()));
        let engine = SyncEngine::new(
            store.clone(),
            config.clone(),
            api.clone(),
            negotiator.clone(),
            events.clone(),
        );
        let recorder = LocationRecorder::new(store.clone(), config.clone());

        Ok(Self {
            config,
            store,
            secure_store,
            auth,
            api,
            negotiator,
            engine,
            recorder,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &Arc<Mutex<Config>> {
        &self.config
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth.is_valid()
    }

    pub fn hat_domain(&self) -> Option<String> {
        self.api.domain().ok()
    }

    /// Start (or resume) a session for `domain` with a fresh token.
    pub fn log_in(&self, domain: &str, token: &str) -> HatResult<()> {
        let domain = domain.trim();
        if !auth::verify_hat_domain(domain) {
            return Err(HatError::validation(
                "domain",
                format!("'{}' is not a known HAT address", domain),
            ));
        }

        self.auth.refresh(token)?;
        self.secure_store.set(HAT_DOMAIN_KEY, domain)?;
        self.api.set_domain(Some(domain.to_string()))?;
        self.config.lock()?.set_hat_domain(Some(domain))?;
        self.negotiator.invalidate_all()?;

        tracing::info!(domain, "Logged in");
        Ok(())
    }

    /// End the session and wipe everything kept for it.
    pub fn log_out(&self) -> HatResult<()> {
        self.auth.log_out()?;
        self.api.set_domain(None)?;
        self.negotiator.invalidate_all()?;
        self.engine.clear_latest_notes()?;
        self.store.lock()?.clear()?;
        self.config.lock()?.set_hat_domain(None)?;

        tracing::info!("Logged out");
        Ok(())
    }

    /// Write a note locally. It is posted on the next sync cycle.
    pub fn create_note(&self, message: &str, kind: NoteKind) -> HatResult<NoteRecord> {
        if message.trim().is_empty() {
            return Err(HatError::validation("message", "note must not be empty"));
        }

        let mut note = NoteRecord::new(message, kind);
        note.local_id = Some(self.store.lock()?.insert_note(&note)?);
        Ok(note)
    }

    /// Delete a note, on the HAT too when it has a remote id.
    pub async fn delete_note(&self, note: &NoteRecord) -> HatResult<()> {
        if let Some(remote_id) = note.id {
            match self.api.delete_record(remote_id).await {
                Ok(()) => self.tickle_bulletin().await,
                Err(HatError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            self.engine.forget_note(remote_id)?;
        }
        if let Some(local_id) = note.local_id {
            self.store.lock()?.delete_note(local_id)?;
        }
        Ok(())
    }

    async fn tickle_bulletin(&self) {
        let bulletin_url = match self.config.lock() {
            Ok(config) => config.sync_config().bulletin_url.clone(),
            Err(_) => None,
        };
        if let Some(url) = bulletin_url {
            if let Err(e) = self.api.tickle(&url).await {
                tracing::warn!(error = %e, "Bulletin tickle after delete failed");
            }
        }
    }

    /// Notes as of the last sync, plus local notes not yet posted.
    pub fn notes(&self) -> HatResult<Vec<NoteRecord>> {
        let mut notes = self.store.lock()?.pending_notes()?;
        notes.extend(self.engine.latest_notes()?);
        Ok(crate::dedup::sort_by_updated(notes))
    }

    /// Run a sync cycle now. Without a window the configured one is used.
    pub async fn force_sync(&self, window: Option<Duration>) -> HatResult<SyncResult> {
        let window = match window {
            Some(window) => window,
            None => self.config.lock()?.sync_config().cycle_window(),
        };
        Ok(self.engine.run_cycle(window).await)
    }

    /// Called when the app comes to the foreground. Returns purged samples.
    pub fn on_foreground(&self) -> HatResult<usize> {
        self.engine.purge_expired()
    }

    pub fn record_fix(&self, fix: LocationFix) -> HatResult<RecordOutcome> {
        self.recorder.record_fix(fix)
    }

    pub fn set_location_preferences(&self, prefs: LocationPreferences) -> HatResult<()> {
        self.recorder.set_preferences(prefs)
    }

    pub fn set_tracking_enabled(&self, enabled: bool) -> HatResult<()> {
        self.recorder.set_tracking_enabled(enabled)
    }

    pub fn pending_sample_count(&self) -> HatResult<i64> {
        self.store.lock()?.pending_sample_count()
    }
}
