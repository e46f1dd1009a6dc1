//! Events and their payload storage.

use crate::error::{Error, Result};
use crate::keys::{KeyBase, event_key};
use crate::store::StoreBackend;
use crate::ts::{EventId, Ts};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A queued event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// Instant after which the event is no longer offered.
    pub expire: Ts,
    /// Opaque payload.
    pub contents: Vec<u8>,
}

/// Payload storage: one TTL'd blob per event under the owning queue's key
/// base, kept slightly past the event's expiration so a consumer receiving
/// it right at the boundary can still read it.
pub(crate) struct EventStore {
    store: Arc<dyn StoreBackend>,
    grace: Duration,
}

impl EventStore {
    pub(crate) fn new(store: Arc<dyn StoreBackend>, grace: Duration) -> Self {
        Self { store, grace }
    }

    pub(crate) async fn put(&self, base: &KeyBase, event: &Event, now: Ts) -> Result<()> {
        let bytes = serde_json::to_vec(event).map_err(|e| Error::Store(e.into()))?;
        let ttl = event.expire.since(now) + self.grace;
        self.store
            .put_blob(&event_key(base, event.id), bytes, ttl)
            .await?;
        Ok(())
    }

    pub(crate) async fn get(&self, base: &KeyBase, id: EventId) -> Result<Option<Event>> {
        match self.store.get_blob(&event_key(base, id)).await? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| Error::Store(e.into()))?,
            )),
            None => Ok(None),
        }
    }
}
