//! Deterministic key naming for per-queue and per-consumer-group sets.
//!
//! Every key of one queue lives under one shared base, `<prefix>/<queue>`,
//! so that a single atomic bundle can touch all of them and sharded stores
//! can co-locate them. Consumer-group keys nest one level deeper under
//! `<prefix>/<queue>/<group>/`.

use crate::ts::EventId;
use std::fmt;

/// Shared prefix constraining which keys one bundle may touch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyBase(String);

impl KeyBase {
    /// Base for all of a queue's keys: `<prefix>/<queue>`.
    pub fn queue(prefix: &str, queue: &str) -> KeyBase {
        if prefix.is_empty() {
            KeyBase(queue.to_string())
        } else {
            KeyBase(format!("{prefix}/{queue}"))
        }
    }

    /// Base for the deployment-wide catalog keys.
    pub fn catalog(prefix: &str) -> KeyBase {
        KeyBase(prefix.to_string())
    }

    pub fn key(&self, suffix: impl Into<String>) -> Key {
        Key {
            base: self.clone(),
            suffix: suffix.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully qualified store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    base: KeyBase,
    suffix: String,
}

impl Key {
    pub fn base(&self) -> &KeyBase {
        &self.base
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.base.0.is_empty() {
            f.write_str(&self.suffix)
        } else {
            write!(f, "{}/{}", self.base.0, self.suffix)
        }
    }
}

/// Keys of a queue's available set.
///
/// `by_id` orders events by creation time and is the delivery order;
/// `by_expire` orders the same members by expiration for cheap expiry
/// sweeps, and doubles as the queue's notification channel.
#[derive(Debug, Clone)]
pub struct AvailKeys {
    pub base: KeyBase,
    pub by_id: Key,
    pub by_expire: Key,
}

impl AvailKeys {
    pub fn new(prefix: &str, queue: &str) -> AvailKeys {
        let base = KeyBase::queue(prefix, queue);
        AvailKeys {
            by_id: base.key("avail/by_id"),
            by_expire: base.key("avail/by_expire"),
            base,
        }
    }

    /// Channel new events for the queue are announced on.
    pub fn channel(&self) -> &Key {
        &self.by_expire
    }
}

/// Keys of one consumer group on one queue.
///
/// `in_use` indexes the union of `inprog`, `redo` and `done` by expiration
/// so expired ids can be purged from all of them. `ptr` holds the group's
/// cursor: the creation timestamp up to which the available set has been
/// offered to this group.
#[derive(Debug, Clone)]
pub struct GroupKeys {
    pub inprog_by_id: Key,
    pub inprog_by_ack: Key,
    pub redo: Key,
    pub done: Key,
    pub in_use: Key,
    pub ptr: Key,
}

impl GroupKeys {
    pub fn new(prefix: &str, queue: &str, group: &str) -> GroupKeys {
        let base = KeyBase::queue(prefix, queue);
        GroupKeys {
            inprog_by_id: base.key(format!("{group}/inprog/by_id")),
            inprog_by_ack: base.key(format!("{group}/inprog/by_ack")),
            redo: base.key(format!("{group}/redo")),
            done: base.key(format!("{group}/done")),
            in_use: base.key(format!("{group}/in_use/by_expire")),
            ptr: base.key(format!("{group}/ptr")),
        }
    }
}

/// Key of an event's payload blob.
pub fn event_key(base: &KeyBase, id: EventId) -> Key {
    base.key(format!("event/{id}"))
}

/// Well-known set listing every queue seen by an add.
pub fn catalog_queues(prefix: &str) -> Key {
    KeyBase::catalog(prefix).key("queues")
}

/// Well-known set listing every (queue, consumer group) pair seen by a get.
pub fn catalog_groups(prefix: &str) -> Key {
    KeyBase::catalog(prefix).key("groups")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::Ts;

    #[test]
    fn test_queue_keys_share_one_base() {
        let avail = AvailKeys::new("app", "jobs");
        let group = GroupKeys::new("app", "jobs", "workers");
        assert_eq!(avail.base.as_str(), "app/jobs");
        assert_eq!(avail.by_id.to_string(), "app/jobs/avail/by_id");
        assert_eq!(avail.by_expire.to_string(), "app/jobs/avail/by_expire");
        assert_eq!(
            group.inprog_by_ack.to_string(),
            "app/jobs/workers/inprog/by_ack"
        );
        assert_eq!(group.ptr.to_string(), "app/jobs/workers/ptr");
        assert_eq!(group.ptr.base(), &avail.base);
    }

    #[test]
    fn test_empty_prefix_has_no_leading_slash() {
        let avail = AvailKeys::new("", "jobs");
        assert_eq!(avail.by_id.to_string(), "jobs/avail/by_id");
        assert_eq!(catalog_queues("").to_string(), "queues");
        assert_eq!(catalog_groups("app").to_string(), "app/groups");
    }

    #[test]
    fn test_event_key_embeds_the_id() {
        let avail = AvailKeys::new("", "jobs");
        let id = EventId { t: Ts(7), seq: 1 };
        assert_eq!(
            event_key(&avail.base, id).to_string(),
            format!("jobs/event/{id}")
        );
    }
}
