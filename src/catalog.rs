//! Deployment-wide catalog of known queues and consumer groups.
//!
//! Maintained as a by-product of adds and gets, and persisted in two
//! well-known store sets so that any client or server process can
//! enumerate the whole system. Entries are never deleted. Reads always hit
//! the store; only the write side is de-duplicated in-process, which is
//! safe because the catalog is append-only.

use crate::error::Result;
use crate::keys::{Key, catalog_groups, catalog_queues};
use crate::store::StoreBackend;
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::Arc;

/// Separator joining a (queue, group) pair into one set member.
const PAIR_SEP: char = '\u{1f}';

pub(crate) struct Catalog {
    store: Arc<dyn StoreBackend>,
    queues_key: Key,
    groups_key: Key,
    seen_queues: DashSet<String>,
    seen_groups: DashSet<String>,
}

impl Catalog {
    pub(crate) fn new(store: Arc<dyn StoreBackend>, prefix: &str) -> Self {
        Self {
            store,
            queues_key: catalog_queues(prefix),
            groups_key: catalog_groups(prefix),
            seen_queues: DashSet::new(),
            seen_groups: DashSet::new(),
        }
    }

    /// Records a queue seen by an add.
    pub(crate) async fn note_queue(&self, queue: &str) -> Result<()> {
        if self.seen_queues.insert(queue.to_string()) {
            if let Err(e) = self.store.set_insert(&self.queues_key, queue).await {
                self.seen_queues.remove(queue);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Records a (queue, consumer group) pair seen by a get.
    pub(crate) async fn note_group(&self, queue: &str, group: &str) -> Result<()> {
        let member = format!("{queue}{PAIR_SEP}{group}");
        if self.seen_groups.insert(member.clone()) {
            if let Err(e) = self.store.set_insert(&self.groups_key, &member).await {
                self.seen_groups.remove(&member);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Every known queue mapped to its known consumer groups.
    pub(crate) async fn all(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for queue in self.store.set_members(&self.queues_key).await? {
            out.entry(queue).or_default();
        }
        for member in self.store.set_members(&self.groups_key).await? {
            if let Some((queue, group)) = member.split_once(PAIR_SEP) {
                out.entry(queue.to_string())
                    .or_default()
                    .push(group.to_string());
            }
        }
        for groups in out.values_mut() {
            groups.sort();
        }
        Ok(out)
    }
}
