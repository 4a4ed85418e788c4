//! The sync cycle.
//!
//! One cycle, in order:
//! 1. Check the access token. Without one, report `ReauthRequired`.
//! 2. Notes: negotiate the notes table, post pending local notes, fetch the
//!    remote records, merge them and publish the result.
//! 3. Location samples: upload one pending batch and mark it synced.
//! 4. Purge aged samples. This runs once per cycle whatever happened above.
//!
//! Steps 1 to 3 run under the host-granted window. Work still in flight when
//! the window closes is dropped and retried next cycle; local state is only
//! changed after a remote call has returned success.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::api::{self, HatApi, Transport};
use crate::config::{Config, SyncConfig};
use crate::dedup;
use crate::error::{HatError, HatResult};
use crate::events::{self, EventSender, SyncEvent};
use crate::models::NoteRecord;
use crate::schema::{EnsureOutcome, SchemaNegotiator};
use crate::store::LocalStore;

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// No valid token; nothing remote was attempted after detection
    ReauthRequired,
    /// Transient failure or a table was just created
    RetryLater,
    /// Unexpected response or local failure; the cycle was aborted
    Failed,
    /// The execution window closed first
    TimedOut,
    /// Another cycle was running
    AlreadyRunning,
}

/// Result of a sync cycle
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub outcome: SyncOutcome,
    pub notes_posted: usize,
    pub notes_fetched: usize,
    pub notes_skipped: usize,
    pub samples_uploaded: usize,
    pub samples_purged: usize,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn new(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            notes_posted: 0,
            notes_fetched: 0,
            notes_skipped: 0,
            samples_uploaded: 0,
            samples_purged: 0,
            errors: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome == SyncOutcome::Completed
    }
}

enum NoteStep {
    Done,
    TableCreated,
}

pub struct SyncEngine<T: Transport> {
    store: Arc<Mutex<LocalStore>>,
    config: Arc<Mutex<Config>>,
    api: Arc<HatApi<T>>,
    negotiator: Arc<SchemaNegotiator>,
    events: EventSender,
    cycle_lock: tokio::sync::Mutex<()>,
    latest_notes: Mutex<Vec<NoteRecord>>,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(
        store: Arc<Mutex<LocalStore>>,
        config: Arc<Mutex<Config>>,
        api: Arc<HatApi<T>>,
        negotiator: Arc<SchemaNegotiator>,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            config,
            api,
            negotiator,
            events,
            cycle_lock: tokio::sync::Mutex::new(()),
            latest_notes: Mutex::new(Vec::new()),
        }
    }

    /// The merged note list from the last successful fetch
    pub fn latest_notes(&self) -> HatResult<Vec<NoteRecord>> {
        Ok(self.latest_notes.lock()?.clone())
    }

    /// Drop a deleted note from the merged set.
    pub fn forget_note(&self, remote_id: i64) -> HatResult<()> {
        self.latest_notes
            .lock()?
            .retain(|note| note.id != Some(remote_id));
        Ok(())
    }

    pub fn clear_latest_notes(&self) -> HatResult<()> {
        self.latest_notes.lock()?.clear();
        Ok(())
    }

    /// Run one cycle within `window`.
    ///
    /// Returns immediately with `AlreadyRunning` if a cycle is in progress.
    pub async fn run_cycle(&self, window: Duration) -> SyncResult {
        let _guard = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Sync cycle already running");
                return SyncResult::new(SyncOutcome::AlreadyRunning);
            }
        };

        let settings = match self.config.lock() {
            Ok(config) => config.sync_config().clone(),
            Err(_) => {
                let mut result = SyncResult::new(SyncOutcome::Failed);
                result.errors.push("configuration lock poisoned".to_string());
                self.finish(&result);
                return result;
            }
        };

        tracing::info!(window_secs = window.as_secs_f64(), "Starting sync cycle");
        let mut result = SyncResult::new(SyncOutcome::Completed);

        let outcome = tokio::time::timeout(window, self.remote_work(&settings, &mut result)).await;
        result.outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!("Sync cycle window elapsed, remaining work abandoned");
                result.errors.push("execution window elapsed".to_string());
                SyncOutcome::TimedOut
            }
        };

        match self.purge_expired_with(settings.retention_window()) {
            Ok(purged) => result.samples_purged = purged,
            Err(e) => result.errors.push(format!("purge: {}", e)),
        }

        self.finish(&result);
        result
    }

    /// Delete samples older than the configured retention window.
    pub fn purge_expired(&self) -> HatResult<usize> {
        let retention = self.config.lock()?.sync_config().retention_window();
        self.purge_expired_with(retention)
    }

    fn purge_expired_with(&self, retention: chrono::Duration) -> HatResult<usize> {
        let cutoff = Utc::now().checked_sub_signed(retention).ok_or_else(|| {
            HatError::Config(format!("retention window out of range: {}", retention))
        })?;
        self.store.lock()?.purge_older_than(cutoff)
    }

    fn finish(&self, result: &SyncResult) {
        for error in &result.errors {
            events::emit(&self.events, SyncEvent::Error(error.clone()));
        }
        events::emit(&self.events, SyncEvent::CycleFinished(result.clone()));

        tracing::info!(
            outcome = ?result.outcome,
            notes_posted = result.notes_posted,
            notes_fetched = result.notes_fetched,
            samples_uploaded = result.samples_uploaded,
            samples_purged = result.samples_purged,
            errors = result.errors.len(),
            "Sync cycle finished"
        );
    }

    async fn remote_work(&self, settings: &SyncConfig, result: &mut SyncResult) -> SyncOutcome {
        if let Err(e) = self.api.auth().current_token() {
            result.errors.push(e.to_string());
            events::emit(&self.events, SyncEvent::ReauthRequired);
            return SyncOutcome::ReauthRequired;
        }

        let mut outcome = SyncOutcome::Completed;

        match self.sync_notes(settings, result).await {
            Ok(NoteStep::Done) => {}
            Ok(NoteStep::TableCreated) => outcome = SyncOutcome::RetryLater,
            Err(e) => match self.step_failed("notes", e, result) {
                Some(abort) => return abort,
                None => outcome = SyncOutcome::RetryLater,
            },
        }

        if let Err(e) = self.sync_samples(settings, result).await {
            match self.step_failed("samples", e, result) {
                Some(abort) => return abort,
                None => outcome = SyncOutcome::RetryLater,
            }
        }

        outcome
    }

    /// Record a failed step. Returns the outcome to abort with, or None when
    /// the cycle may continue.
    fn step_failed(&self, step: &str, err: HatError, result: &mut SyncResult) -> Option<SyncOutcome> {
        if let HatError::TableNotFound { table, source_name } = &err {
            tracing::info!(step, table = %table, source = %source_name, "Remote table gone, renegotiating next cycle");
            if let Err(e) = self.negotiator.invalidate(table, source_name) {
                result.errors.push(format!("{}: {}", step, e));
            }
            return None;
        }

        result.errors.push(format!("{}: {}", step, err));

        if err.is_unauthorized() {
            tracing::warn!(step, "Sync stopped, re-authentication required");
            events::emit(&self.events, SyncEvent::ReauthRequired);
            Some(SyncOutcome::ReauthRequired)
        } else if err.is_transient() {
            tracing::warn!(step, error = %err, "Sync step failed, will retry");
            None
        } else {
            tracing::error!(step, error = %err, "Sync step failed, aborting cycle");
            Some(SyncOutcome::Failed)
        }
    }

    async fn sync_notes(&self, settings: &SyncConfig, result: &mut SyncResult) -> HatResult<NoteStep> {
        let table = &settings.notes_table;
        let structure = api::notables_structure(&table.name, &table.source);
        let handle = match self
            .negotiator
            .ensure(&self.api, &table.name, &table.source, &structure)
            .await?
        {
            EnsureOutcome::Existing(handle) => handle,
            EnsureOutcome::Created(_) => return Ok(NoteStep::TableCreated),
        };

        let pending = self.store.lock()?.pending_notes()?;
        let mut posted = Vec::new();
        let mut post_error = None;

        for note in &pending {
            match self.api.post_note(&handle, note).await {
                Ok(remote_id) => {
                    if let Some(local_id) = note.local_id {
                        posted.push((local_id, remote_id));
                    }
                }
                Err(e) => {
                    post_error = Some(e);
                    break;
                }
            }
        }

        if !posted.is_empty() {
            self.record_posted(&posted)?;
            result.notes_posted += posted.len();

            if let Some(url) = &settings.bulletin_url {
                if let Err(e) = self.api.tickle(url).await {
                    tracing::warn!(error = %e, "Bulletin tickle failed");
                }
            }
        }
        if let Some(e) = post_error {
            return Err(e);
        }

        let fetched = self.api.fetch_notes(&handle).await?;
        result.notes_skipped += fetched.skipped;

        let merged = dedup::merge(fetched.notes);
        result.notes_fetched += merged.len();
        *self.latest_notes.lock()? = merged.clone();
        events::emit(&self.events, SyncEvent::NotesUpdated(merged));

        Ok(NoteStep::Done)
    }

    fn record_posted(&self, posted: &[(i64, Option<i64>)]) -> HatResult<()> {
        let mut store = self.store.lock()?;
        for (local_id, remote_id) in posted {
            if let Some(remote_id) = remote_id {
                store.set_note_remote_id(*local_id, *remote_id)?;
            }
        }
        let ids: Vec<i64> = posted.iter().map(|(local_id, _)| *local_id).collect();
        store.mark_notes_synced(&ids)?;
        Ok(())
    }

    async fn sync_samples(&self, settings: &SyncConfig, result: &mut SyncResult) -> HatResult<()> {
        let batch = self.store.lock()?.pending_batch(settings.batch_size)?;
        if batch.is_empty() {
            return Ok(());
        }

        let table = &settings.locations_table;
        let structure = api::locations_structure(&table.name, &table.source);
        let outcome = self
            .negotiator
            .ensure(&self.api, &table.name, &table.source, &structure)
            .await?;

        self.api.post_locations(outcome.handle(), &batch).await?;

        let ids: Vec<i64> = batch.iter().filter_map(|s| s.id).collect();
        let marked = self.store.lock()?.mark_synced(&ids)?;
        result.samples_uploaded += marked;
        tracing::debug!(uploaded = marked, "Uploaded location batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{notable, table_found, MockTransport};
    use crate::auth::{AuthSession, MemorySecureStore};
    use crate::models::{LocationSample, NoteKind};
    use crate::schema::TableState;
    use reqwest::Method;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Harness {
        _dir: TempDir,
        store: Arc<Mutex<LocalStore>>,
        api: Arc<HatApi<MockTransport>>,
        engine: SyncEngine<MockTransport>,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(Mutex::new(Config::new(dir.path().to_path_buf()).unwrap()));
        let store = Arc::new(Mutex::new(LocalStore::open_in_memory().unwrap()));
        let auth = Arc::new(AuthSession::new(Arc::new(MemorySecureStore::new())));
        auth.refresh("tok").unwrap();
        let api = Arc::new(HatApi::new(
            MockTransport::new(),
            auth,
            Some("carol.hubofallthings.net".to_string()),
        ));
        let events = events::channel();
        let negotiator = Arc::new(SchemaNegotiator::new(events.clone()));
        let rx = events.subscribe();
        let engine = SyncEngine::new(store.clone(), config, api.clone(), negotiator, events);

        Harness {
            _dir: dir,
            store,
            api,
            engine,
            events: rx,
        }
    }

    fn mock(h: &Harness) -> &MockTransport {
        h.api.transport()
    }

    fn tables_exist(h: &Harness) {
        mock(h).respond(Method::GET, "/data/table?name=notablesv1", 200, table_found(1));
        mock(h).respond(Method::GET, "/data/table?name=locations", 200, table_found(2));
    }

    fn add_samples(h: &Harness, count: usize) {
        let store = h.store.lock().unwrap();
        for i in 0..count {
            let ts = Utc::now() - chrono::Duration::minutes(10 + i as i64);
            store
                .insert_sample(&LocationSample::new(51.5, -0.1, 5.0, ts))
                .unwrap();
        }
    }

    fn pending(h: &Harness) -> i64 {
        h.store.lock().unwrap().pending_sample_count().unwrap()
    }

    fn drain(h: &mut Harness) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_successful_cycle_marks_batch_synced() {
        let mut h = harness();
        tables_exist(&h);
        mock(&h).respond(
            Method::GET,
            "/table/1/values",
            200,
            json!([
                notable(1, "x", "2017-03-01T09:00:00Z", "2017-03-01T09:00:00Z"),
                notable(2, "x", "2017-03-01T09:00:00Z", "2017-03-02T09:00:00Z"),
            ]),
        );
        mock(&h).respond(Method::POST, "/record/values", 201, Value::Null);
        add_samples(&h, 3);

        let result = h.engine.run_cycle(Duration::from_secs(25)).await;

        assert_eq!(result.outcome, SyncOutcome::Completed);
        assert_eq!(result.samples_uploaded, 3);
        assert_eq!(result.notes_fetched, 1);
        assert_eq!(h.engine.latest_notes().unwrap()[0].id, Some(1));
        assert_eq!(pending(&h), 0);

        let events = drain(&mut h);
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::NotesUpdated(notes) if notes.len() == 1)));
        assert!(matches!(events.last(), Some(SyncEvent::CycleFinished(_))));
    }

    #[tokio::test]
    async fn test_network_failure_keeps_batch_pending() {
        let h = harness();
        tables_exist(&h);
        mock(&h).respond(Method::GET, "/table/1/values", 200, json!([]));
        mock(&h).on(
            Method::POST,
            "/record/values",
            Err(HatError::Network("connection reset".to_string())),
        );
        add_samples(&h, 2);

        let result = h.engine.run_cycle(Duration::from_secs(25)).await;

        assert_eq!(result.outcome, SyncOutcome::RetryLater);
        assert_eq!(result.samples_uploaded, 0);
        assert_eq!(pending(&h), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_note_fetch_skips_upload() {
        let mut h = harness();
        tables_exist(&h);
        mock(&h).respond(Method::GET, "/table/1/values", 401, Value::Null);
        mock(&h).respond(Method::POST, "/record/values", 201, Value::Null);
        add_samples(&h, 2);

        let result = h.engine.run_cycle(Duration::from_secs(25)).await;

        assert_eq!(result.outcome, SyncOutcome::ReauthRequired);
        assert!(!h.api.auth().is_valid());
        assert_eq!(mock(&h).count(Method::POST, "/record/values"), 0);
        assert_eq!(mock(&h).count(Method::GET, "/data/table?name=locations"), 0);
        assert_eq!(pending(&h), 2);
        assert!(drain(&mut h)
            .iter()
            .any(|e| matches!(e, SyncEvent::ReauthRequired)));
    }

    #[tokio::test]
    async fn test_expired_session_aborts_before_network() {
        let mut h = harness();
        h.api.auth().note_unauthorized();
        add_samples(&h, 1);

        let result = h.engine.run_cycle(Duration::from_secs(25)).await;

        assert_eq!(result.outcome, SyncOutcome::ReauthRequired);
        assert!(mock(&h).requests().is_empty());
        assert!(drain(&mut h)
            .iter()
            .any(|e| matches!(e, SyncEvent::ReauthRequired)));
    }

    #[tokio::test]
    async fn test_created_notes_table_reports_retry_later() {
        let h = harness();
        mock(&h).respond(Method::GET, "/data/table?name=notablesv1", 404, Value::Null);
        mock(&h).respond(Method::GET, "/data/table?name=notablesv1", 200, table_found(42));
        mock(&h).respond(Method::POST, "/data/table", 201, Value::Null);

        let result = h.engine.run_cycle(Duration::from_secs(25)).await;

        assert_eq!(result.outcome, SyncOutcome::RetryLater);
        assert_eq!(mock(&h).count(Method::GET, "/values"), 0);
    }

    #[tokio::test]
    async fn test_unexpected_response_aborts_cycle() {
        let h = harness();
        tables_exist(&h);
        mock(&h).respond(Method::GET, "/table/1/values", 500, json!({ "message": "boom" }));
        mock(&h).respond(Method::POST, "/record/values", 201, Value::Null);
        add_samples(&h, 1);

        let result = h.engine.run_cycle(Duration::from_secs(25)).await;

        assert_eq!(result.outcome, SyncOutcome::Failed);
        assert_eq!(mock(&h).count(Method::POST, "/record/values"), 0);
        assert_eq!(pending(&h), 1);
    }

    #[tokio::test]
    async fn test_pending_notes_are_posted_and_tickled() {
        let h = harness();
        tables_exist(&h);
        mock(&h).respond(
            Method::POST,
            "/record/values",
            201,
            json!({ "record": { "id": 99 } }),
        );
        mock(&h).respond(Method::GET, "bulletin/tickle", 200, Value::Null);
        mock(&h).respond(Method::GET, "/table/1/values", 200, json!([]));

        let local_id = h
            .store
            .lock()
            .unwrap()
            .insert_note(&NoteRecord::new("hello", NoteKind::Note))
            .unwrap();

        let result = h.engine.run_cycle(Duration::from_secs(25)).await;

        assert_eq!(result.outcome, SyncOutcome::Completed);
        assert_eq!(result.notes_posted, 1);
        assert_eq!(mock(&h).count(Method::GET, "bulletin/tickle"), 1);

        let store = h.store.lock().unwrap();
        assert!(store.pending_notes().unwrap().is_empty());
        assert_eq!(store.get_note(local_id).unwrap().unwrap().id, Some(99));
    }

    #[tokio::test]
    async fn test_purge_runs_once_per_cycle() {
        let h = harness();
        h.api.auth().note_unauthorized();
        {
            let store = h.store.lock().unwrap();
            let old = Utc::now() - chrono::Duration::days(8);
            store
                .insert_sample(&LocationSample::new(51.5, -0.1, 5.0, old))
                .unwrap();
        }
        add_samples(&h, 1);

        let result = h.engine.run_cycle(Duration::from_secs(25)).await;

        assert_eq!(result.samples_purged, 1);
        assert_eq!(h.store.lock().unwrap().sample_count().unwrap(), 1);
    }

    #[test]
    fn test_out_of_range_retention_does_not_panic() {
        let h = harness();
        add_samples(&h, 1);

        let result = h.engine.purge_expired_with(chrono::Duration::days(100_000_000));

        assert!(matches!(result, Err(HatError::Config(_))));
        assert_eq!(h.store.lock().unwrap().sample_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vanished_notes_table_is_renegotiated() {
        let h = harness();
        tables_exist(&h);
        mock(&h).respond(Method::GET, "/table/1/values", 200, json!([]));
        mock(&h).respond(Method::GET, "/table/1/values", 404, Value::Null);
        mock(&h).respond(Method::GET, "/table/1/values", 200, json!([]));

        let first = h.engine.run_cycle(Duration::from_secs(25)).await;
        assert_eq!(first.outcome, SyncOutcome::Completed);

        let second = h.engine.run_cycle(Duration::from_secs(25)).await;
        assert_eq!(second.outcome, SyncOutcome::RetryLater);
        assert!(second.errors.is_empty());
        assert_eq!(h.engine.negotiator.state("notablesv1", "rumpel"), TableState::Unknown);

        let third = h.engine.run_cycle(Duration::from_secs(25)).await;
        assert_eq!(third.outcome, SyncOutcome::Completed);
        assert_eq!(mock(&h).count(Method::GET, "/data/table?name=notablesv1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_exceeding_window_times_out() {
        let h = harness();
        tables_exist(&h);
        mock(&h).respond(Method::GET, "/table/1/values", 200, json!([]));
        mock(&h).respond(Method::POST, "/record/values", 201, Value::Null);
        mock(&h).set_delay(Duration::from_secs(60));
        add_samples(&h, 2);

        let result = h.engine.run_cycle(Duration::from_secs(5)).await;

        assert_eq!(result.outcome, SyncOutcome::TimedOut);
        assert_eq!(pending(&h), 2);
    }

    #[tokio::test]
    async fn test_concurrent_cycle_is_rejected() {
        let h = harness();
        h.api.auth().note_unauthorized();

        let _held = h.engine.cycle_lock.lock().await;
        let result = h.engine.run_cycle(Duration::from_secs(25)).await;
        assert_eq!(result.outcome, SyncOutcome::AlreadyRunning);
    }
}
