//! Store contract for queue state.
//!
//! Defines the interface a backing store must implement: atomic execution
//! of query bundles over ordered sets, TTL'd payload blobs, plain sets for
//! the catalog, and a pub/sub fabric for waking blocked consumers. The
//! bundled [`MemoryStore`](super::MemoryStore) implements it in-process; a
//! scripted sorted-set server (Redis, Valkey, a shard cluster) is the
//! intended remote implementation.

use crate::keys::Key;
use crate::query::{QueryActions, QueryRes};
use crate::ts::EventId;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Backing store for queue state.
///
/// All backends must be thread-safe (`Send + Sync`) for use with tokio.
/// A backend must execute each bundle atomically and isolated from
/// concurrent bundles on the same key base; partial effects of a failed
/// bundle must never become visible.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Executes a bundle atomically.
    ///
    /// # Errors
    ///
    /// Fails if the bundle names a key outside its base, the bundle is
    /// malformed for this backend, or the store is unreachable.
    async fn exec(&self, bundle: QueryActions) -> Result<QueryRes>;

    /// Stores a payload blob which expires after `ttl`.
    ///
    /// Overwrites an existing blob under the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn put_blob(&self, key: &Key, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Fetches a payload blob.
    ///
    /// Returns `Ok(None)` for missing or expired blobs.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn get_blob(&self, key: &Key) -> Result<Option<Vec<u8>>>;

    /// Inserts a member into a plain string set. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn set_insert(&self, key: &Key, member: &str) -> Result<()>;

    /// Lists all members of a plain string set.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage operation fails.
    async fn set_members(&self, key: &Key) -> Result<Vec<String>>;

    /// Announces an id on a channel, waking current subscribers.
    ///
    /// Returns the number of subscribers reached.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport fails.
    async fn publish(&self, channel: &Key, id: EventId) -> Result<usize>;

    /// Subscribes to a channel.
    ///
    /// The receiver sees every id published after this call returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport fails.
    async fn subscribe(&self, channel: &Key) -> Result<broadcast::Receiver<EventId>>;

    /// Channel surfacing asynchronous backend failures (for example a lost
    /// pub/sub connection) to the background runner. Backends without such
    /// failure modes return a channel that never yields.
    fn error_channel(&self) -> mpsc::Receiver<anyhow::Error>;
}
