//! Multi-consumer-group event queue over an ordered-set backing store.
//!
//! `bananaq` turns a generic ordered-set store into a reliable,
//! at-least-once queue with acknowledgment deadlines, redelivery, blocking
//! reads, expiration, and background cleanup. Clients connect directly to
//! the shared store: any number of client and server processes operate on
//! the same queues without coordinating with each other, because every
//! operation is one atomic scripted bundle against the store.
//!
//! Each queue is shared by any number of consumer groups, and each group
//! consumes the full stream at its own pace through a per-group cursor.
//! Delivered events are never removed from a queue; they only leave
//! through expiration.
//!
//! The crate ships an in-process [`MemoryStore`]; remote backends (a
//! scripted sorted-set server such as Redis or a shard cluster) plug in
//! through the [`StoreBackend`] trait.
//!
//! # Examples
//!
//! ```rust
//! use bananaq::{AckRequest, AddRequest, Config, GetRequest, MemoryStore, QueueService};
//! use chrono::{Duration, Utc};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> bananaq::Result<()> {
//! let queues = QueueService::new(Arc::new(MemoryStore::new()), Config::default());
//!
//! let id = queues
//!     .add(AddRequest {
//!         queue: "jobs".into(),
//!         expire: Utc::now() + Duration::minutes(10),
//!         contents: b"some stuff".to_vec(),
//!     })
//!     .await?;
//!
//! let event = queues
//!     .get(GetRequest {
//!         queue: "jobs".into(),
//!         consumer_group: "workers".into(),
//!         ack_deadline: Some(Utc::now() + Duration::seconds(30)),
//!         ..Default::default()
//!     })
//!     .await?
//!     .expect("event is available");
//! assert_eq!(event.id, id);
//!
//! let acked = queues
//!     .ack(AckRequest {
//!         queue: "jobs".into(),
//!         consumer_group: "workers".into(),
//!         id: event.id,
//!     })
//!     .await?;
//! assert!(acked);
//! # Ok(())
//! # }
//! ```
//!
//! Long-lived deployments also start the background cleaner once:
//!
//! ```rust
//! # use bananaq::{Config, MemoryStore, QueueService};
//! # use std::sync::Arc;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queues = QueueService::new(Arc::new(MemoryStore::new()), Config::default());
//! let (stop, stop_rx) = tokio::sync::watch::channel(false);
//! let finished = queues.run(stop_rx);
//! // ... use the service ...
//! stop.send(true).ok();
//! assert!(finished.await.unwrap().is_ok());
//! # }
//! ```

mod catalog;
mod config;
mod error;
mod events;
pub mod keys;
pub mod query;
mod queue;
mod runner;
pub mod store;
mod ts;

pub use config::Config;
pub use error::{Error, Result};
pub use events::Event;
pub use queue::{
    AckRequest, AddRequest, GetRequest, GroupStats, QueueService, QueueStats, StatusRequest,
};
pub use store::{MemoryStore, StoreBackend};
pub use ts::{EventId, IdMinter, Ts};
