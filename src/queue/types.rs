//! Request and statistics types for the queue engine.

use crate::ts::EventId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Parameters for [`QueueService::add`](crate::QueueService::add).
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub queue: String,
    /// Instant the event stops being offered. Must be in the future.
    pub expire: DateTime<Utc>,
    /// Opaque payload.
    pub contents: Vec<u8>,
}

/// Parameters for [`QueueService::get`](crate::QueueService::get).
#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    pub queue: String,
    pub consumer_group: String,
    /// Deadline by which the event must be acknowledged before it is
    /// offered to this consumer group again. `None` means no
    /// acknowledgment is expected and the event settles on delivery.
    pub ack_deadline: Option<DateTime<Utc>>,
    /// Wait for an event until this instant instead of returning `None`
    /// immediately.
    pub block_until: Option<DateTime<Utc>>,
}

/// Parameters for [`QueueService::ack`](crate::QueueService::ack).
#[derive(Debug, Clone)]
pub struct AckRequest {
    pub queue: String,
    pub consumer_group: String,
    pub id: EventId,
}

/// Parameters for [`QueueService::status`](crate::QueueService::status).
#[derive(Debug, Clone, Default)]
pub struct StatusRequest {
    /// Specific queue to consumer-group combinations to report on. `None`
    /// or empty reports every combination known to the catalog.
    pub queues_consumer_groups: Option<HashMap<String, Vec<String>>>,
}

/// Per-consumer-group statistics for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    /// Events the group has yet to receive.
    pub available: u64,
    /// Events handed to the group, awaiting acknowledgment.
    pub in_progress: u64,
    /// Events awaiting redelivery to the group.
    pub redo: u64,
}

/// Statistics for one queue across its consumer groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Non-expired events in the queue, identical for every group.
    pub total: u64,
    /// Statistics per consumer group name.
    pub groups: HashMap<String, GroupStats>,
}
