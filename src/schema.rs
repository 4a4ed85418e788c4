//! Remote table negotiation.
//!
//! Before writing to a HAT table its id must be known. For each
//! `(table, source)` pair the negotiator runs:
//!
//! ```text
//! Unknown --200--> Ready
//!    |--404--> Creating --created, 200--> Ready (emits SchemaChanged)
//!    |--401--> Unauthorized
//!    '--other--> Failed(status)
//! ```
//!
//! `Ready` is cached until invalidated. Any other state is retried from the
//! top on the next call to [`SchemaNegotiator::ensure`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::api::{HatApi, Transport};
use crate::error::{HatError, HatResult};
use crate::events::{self, EventSender, SyncEvent};
use crate::models::RemoteTableHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableState {
    Unknown,
    Creating,
    Ready(RemoteTableHandle),
    Unauthorized,
    Failed(u16),
}

/// Whether `ensure` found the table or had to create it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    Existing(RemoteTableHandle),
    Created(RemoteTableHandle),
}

impl EnsureOutcome {
    pub fn handle(&self) -> &RemoteTableHandle {
        match self {
            EnsureOutcome::Existing(h) | EnsureOutcome::Created(h) => h,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, EnsureOutcome::Created(_))
    }
}

type TableKey = (String, String);

pub struct SchemaNegotiator {
    states: Mutex<HashMap<TableKey, TableState>>,
    events: EventSender,
}

impl SchemaNegotiator {
    pub fn new(events: EventSender) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn state(&self, table: &str, source: &str) -> TableState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&key(table, source)).cloned())
            .unwrap_or(TableState::Unknown)
    }

    fn set_state(&self, table: &str, source: &str, state: TableState) -> HatResult<()> {
        self.states.lock()?.insert(key(table, source), state);
        Ok(())
    }

    /// Drop the cached state of one table
    pub fn invalidate(&self, table: &str, source: &str) -> HatResult<()> {
        self.states.lock()?.remove(&key(table, source));
        Ok(())
    }

    pub fn invalidate_all(&self) -> HatResult<()> {
        self.states.lock()?.clear();
        Ok(())
    }

    /// Resolve the table, creating it from `structure` when the HAT has none.
    pub async fn ensure<T: Transport>(
        &self,
        api: &HatApi<T>,
        table: &str,
        source: &str,
        structure: &Value,
    ) -> HatResult<EnsureOutcome> {
        if let TableState::Ready(handle) = self.state(table, source) {
            return Ok(EnsureOutcome::Existing(handle));
        }

        match api.find_table(table, source).await {
            Ok(handle) => {
                self.set_state(table, source, TableState::Ready(handle.clone()))?;
                Ok(EnsureOutcome::Existing(handle))
            }
            Err(HatError::TableNotFound { .. }) => {
                tracing::info!(table, source, "Remote table missing, creating it");
                self.set_state(table, source, TableState::Creating)?;

                if let Err(e) = api.create_table(structure).await {
                    return Err(self.fail(table, source, e));
                }

                match api.find_table(table, source).await {
                    Ok(handle) => {
                        self.set_state(table, source, TableState::Ready(handle.clone()))?;
                        tracing::info!(table, source, table_id = handle.table_id, "Remote table created");
                        events::emit(
                            &self.events,
                            SyncEvent::SchemaChanged {
                                table: table.to_string(),
                                source_name: source.to_string(),
                            },
                        );
                        Ok(EnsureOutcome::Created(handle))
                    }
                    Err(e) => Err(self.fail(table, source, e)),
                }
            }
            Err(e) => Err(self.fail(table, source, e)),
        }
    }

    fn fail(&self, table: &str, source: &str, err: HatError) -> HatError {
        let state = match &err {
            HatError::Unauthorized(_) => TableState::Unauthorized,
            HatError::UnexpectedResponse { status, .. } => TableState::Failed(*status),
            HatError::TableNotFound { .. } | HatError::NotFound(_) => TableState::Failed(404),
            _ => TableState::Unknown,
        };
        tracing::warn!(table, source, error = %err, state = ?state, "Table negotiation failed");

        if let Err(e) = self.set_state(table, source, state) {
            tracing::error!(error = %e, "Failed to record table state");
        }
        err
    }
}

fn key(table: &str, source: &str) -> TableKey {
    (table.to_string(), source.to_string())
}
