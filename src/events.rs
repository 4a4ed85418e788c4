//! Notifications for the presentation layer.

use tokio::sync::broadcast;

use crate::models::NoteRecord;
use crate::sync_engine::SyncResult;

/// Buffered events per subscriber before the oldest are dropped
pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The merged note list after a successful fetch
    NotesUpdated(Vec<NoteRecord>),
    /// A remote table was just created
    SchemaChanged { table: String, source_name: String },
    /// The token was rejected or is missing; the user must log in again
    ReauthRequired,
    CycleFinished(SyncResult),
    /// A non-fatal failure worth showing
    Error(String),
}

pub type EventSender = broadcast::Sender<SyncEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Publish an event. Having no subscribers is not an error.
pub fn emit(events: &EventSender, event: SyncEvent) {
    if events.send(event).is_err() {
        tracing::trace!("No event subscribers");
    }
}
