//! The queue engine: composes atomic query bundles over the backing store.
//!
//! Every user-facing call is a short composition of one or more bundles;
//! everything that must be consistent happens inside a single bundle.
//! Concurrent callers on the same consumer group are serialized by bundle
//! atomicity: the cursor only advances through a newer-wins single-value
//! write, so no two callers can claim the same event, while different
//! callers can claim different events in parallel.

use super::types::{
    AckRequest, AddRequest, GetRequest, GroupStats, QueueStats, StatusRequest,
};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventStore};
use crate::keys::{AvailKeys, GroupKeys, Key};
use crate::query::{
    Guard, QueryAction, QueryActions, QueryOp, ScoreBound, ScoreRule, Selector,
};
use crate::runner;
use crate::store::StoreBackend;
use crate::ts::{EventId, IdMinter, Ts};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::debug;

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn StoreBackend>,
    pub(crate) config: Config,
    pub(crate) minter: IdMinter,
    pub(crate) events: EventStore,
    pub(crate) catalog: Catalog,
}

/// Handle to a queue deployment on one backing store.
///
/// Cheap to clone; all methods are safe under arbitrary concurrency from
/// any number of tasks and processes sharing the store. [`run`](Self::run)
/// must be invoked once per deployment to keep queues clean.
#[derive(Clone)]
pub struct QueueService {
    pub(crate) inner: Arc<Inner>,
}

impl QueueService {
    /// Opens a queue deployment over `store`.
    pub fn new(store: Arc<dyn StoreBackend>, config: Config) -> Self {
        let events = EventStore::new(Arc::clone(&store), config.event_ttl_grace);
        let catalog = Catalog::new(Arc::clone(&store), &config.key_prefix);
        Self {
            inner: Arc::new(Inner {
                events,
                catalog,
                minter: IdMinter::new(),
                store,
                config,
            }),
        }
    }

    /// Starts the background cleanup loop.
    ///
    /// The returned channel yields exactly one value: the first cleanup or
    /// store error, or `Ok(())` once `stop` is set to `true` (a dropped
    /// stop sender counts as a stop). After an error the loop is gone and
    /// `run` must be called again to keep using the deployment.
    pub fn run(&self, stop: watch::Receiver<bool>) -> oneshot::Receiver<Result<()>> {
        runner::spawn(self.clone(), stop)
    }

    /// Adds an event to a queue.
    ///
    /// The event is offered to every consumer group until `expire`, after
    /// which it is eventually cleaned up. On success the event is visible
    /// to subsequent [`get`](Self::get) calls and wakes currently blocked
    /// ones.
    pub async fn add(&self, req: AddRequest) -> Result<EventId> {
        if req.queue.is_empty() {
            return Err(Error::EmptyQueue);
        }
        let now = self.inner.minter.new_ts(Utc::now());
        let id = self.inner.minter.new_id(now);
        let expire = Ts::from(req.expire);
        if expire <= id.t {
            return Err(Error::ExpireNotFuture);
        }
        let event = Event {
            id,
            expire,
            contents: req.contents,
        };

        let avail = self.avail_keys(&req.queue);
        // Payload first, so no reader can see an index entry without one.
        self.inner.events.put(&avail.base, &event, now).await?;

        let mut bundle = QueryActions::new(avail.base.clone(), now);
        bundle.push(QueryAction::op(QueryOp::Select(Selector::Ids(vec![id]))));
        bundle.push(QueryAction::op(QueryOp::AddTo {
            keys: vec![avail.by_id.clone()],
            score: ScoreRule::Creation,
        }));
        bundle.push(QueryAction::op(QueryOp::AddTo {
            keys: vec![avail.by_expire.clone()],
            score: ScoreRule::Value(expire),
        }));
        self.inner.store.exec(bundle).await?;

        self.inner.catalog.note_queue(&req.queue).await?;
        self.inner.store.publish(avail.channel(), id).await?;
        debug!(queue = %req.queue, id = %id, "added event");
        Ok(id)
    }

    /// Retrieves one available event for a consumer group.
    ///
    /// With an `ack_deadline`, the consumer must [`ack`](Self::ack) the
    /// event before the deadline or it is offered to this group again.
    /// Without one, the event settles on delivery.
    ///
    /// Returns `Ok(None)` when no event is available, or — with
    /// `block_until` set — when none became available before that instant.
    ///
    /// An event whose creation time does not exceed the group's cursor
    /// (possible when writers race with this group's deliveries) is not
    /// offered to this group; other consumer groups still receive it.
    pub async fn get(&self, req: GetRequest) -> Result<Option<Event>> {
        if req.queue.is_empty() {
            return Err(Error::EmptyQueue);
        }
        if req.consumer_group.is_empty() {
            return Err(Error::EmptyConsumerGroup);
        }
        self.inner
            .catalog
            .note_group(&req.queue, &req.consumer_group)
            .await?;

        let Some(block_until) = req.block_until else {
            return self.get_direct(&req).await;
        };

        let avail = self.avail_keys(&req.queue);
        let wait = (block_until - Utc::now()).to_std().unwrap_or_default();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Subscribe before looking, so an event added between the look
            // and the wait still wakes us.
            let mut wake = self.inner.store.subscribe(avail.channel()).await?;
            if let Some(event) = self.get_direct(&req).await? {
                return Ok(Some(event));
            }
            tokio::select! {
                _ = wake.recv() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn get_direct(&self, req: &GetRequest) -> Result<Option<Event>> {
        let avail = self.avail_keys(&req.queue);
        let group = self.group_keys(&req.queue, &req.consumer_group);
        let now = self.inner.minter.new_ts(Utc::now());

        // Shared tail: advance the cursor, file the claimed id under the
        // right role sets, and stop the bundle once something was claimed.
        let mut tail = vec![QueryAction::op(QueryOp::SingleSet {
            key: group.ptr.clone(),
            if_newer: true,
        })];
        match req.ack_deadline.map(Ts::from) {
            Some(deadline) => {
                tail.push(QueryAction::op(QueryOp::AddTo {
                    keys: vec![group.inprog_by_id.clone()],
                    score: ScoreRule::Value(Ts::ZERO),
                }));
                tail.push(QueryAction::op(QueryOp::AddTo {
                    keys: vec![group.inprog_by_ack.clone()],
                    score: ScoreRule::Value(deadline),
                }));
            }
            None => tail.push(QueryAction::op(QueryOp::AddTo {
                keys: vec![group.done.clone()],
                score: ScoreRule::Value(Ts::ZERO),
            })),
        }
        tail.push(QueryAction::op(QueryOp::AddTo {
            keys: vec![group.in_use.clone()],
            score: ScoreRule::CopyFrom(avail.by_expire.clone()),
        }));
        tail.push(QueryAction::break_if(Guard::IfInput));

        let mut bundle = QueryActions::new(avail.base.clone(), now);

        // Entries that missed their ack deadline win over everything new.
        bundle.extend(sweep_expired(&group.in_use, vec![group.redo.clone()]));
        bundle.push(QueryAction::op(QueryOp::Select(first_of(&group.redo))));
        bundle.push(QueryAction::op(QueryOp::RemoveFromInput {
            keys: vec![group.redo.clone()],
        }));
        bundle.extend(tail.iter().cloned());

        // Then the next event past this group's cursor.
        bundle.extend(sweep_expired(
            &avail.by_expire,
            vec![avail.by_id.clone(), avail.by_expire.clone()],
        ));
        bundle.push(QueryAction::op(QueryOp::SingleGet {
            key: group.ptr.clone(),
        }));
        bundle.push(QueryAction::op(QueryOp::Select(Selector::Range {
            key: avail.by_id.clone(),
            min: Some(ScoreBound::Input),
            max: None,
            min_excl: true,
            max_excl: false,
            count: 1,
        })));
        bundle.extend(tail.iter().cloned());

        // A group with no cursor yet starts from the beginning. A group
        // whose cursor got this far has simply drained the queue.
        bundle.push(QueryAction::break_if(Guard::IfNotEmpty(group.ptr.clone())));
        bundle.push(QueryAction::op(QueryOp::Select(first_of(&avail.by_id))));
        bundle.extend(tail);

        let res = self.inner.store.exec(bundle).await?;
        let Some(&id) = res.ids.first() else {
            return Ok(None);
        };
        debug!(
            queue = %req.queue,
            consumer_group = %req.consumer_group,
            id = %id,
            "delivered event"
        );
        match self.inner.events.get(&avail.base, id).await? {
            Some(event) => Ok(Some(event)),
            None => Err(Error::MissingEvent(id)),
        }
    }

    /// Acknowledges an event delivered with an ack deadline.
    ///
    /// Returns `true` if the acknowledgment landed before the deadline.
    /// `false` means the deadline passed (the event will be offered to the
    /// group again) or the event was not awaiting acknowledgment; a second
    /// ack of the same event returns `false`.
    pub async fn ack(&self, req: AckRequest) -> Result<bool> {
        if req.queue.is_empty() {
            return Err(Error::EmptyQueue);
        }
        if req.consumer_group.is_empty() {
            return Err(Error::EmptyConsumerGroup);
        }
        let avail = self.avail_keys(&req.queue);
        let group = self.group_keys(&req.queue, &req.consumer_group);
        let now = self.inner.minter.new_ts(Utc::now());

        let mut bundle = QueryActions::new(avail.base, now);
        bundle.extend(sweep_expired(
            &group.in_use,
            vec![group.inprog_by_id.clone(), group.inprog_by_ack.clone()],
        ));
        bundle.push(QueryAction::op(QueryOp::Select(Selector::IdScore {
            key: group.inprog_by_ack.clone(),
            id: req.id,
            min: Some(ScoreBound::Now),
            max: None,
        })));
        bundle.push(QueryAction::op(QueryOp::RemoveFromInput {
            keys: vec![group.inprog_by_id, group.inprog_by_ack],
        }));
        bundle.push(QueryAction::op(QueryOp::AddTo {
            keys: vec![group.done],
            score: ScoreRule::Value(Ts::ZERO),
        }));
        let res = self.inner.store.exec(bundle).await?;
        Ok(!res.ids.is_empty())
    }

    /// Moves deadline-missed events of a consumer group to its redo set
    /// and purges expired events from every role set of the group.
    pub async fn clean(&self, queue: &str, consumer_group: &str) -> Result<()> {
        if queue.is_empty() {
            return Err(Error::EmptyQueue);
        }
        if consumer_group.is_empty() {
            return Err(Error::EmptyConsumerGroup);
        }
        let avail = self.avail_keys(queue);
        let group = self.group_keys(queue, consumer_group);
        let now = self.inner.minter.new_ts(Utc::now());

        let mut bundle = QueryActions::new(avail.base.clone(), now);

        // Purge expired ids from every role set and the union index.
        bundle.extend(sweep_expired(
            &group.in_use,
            vec![
                group.inprog_by_id.clone(),
                group.inprog_by_ack.clone(),
                group.redo.clone(),
                group.done.clone(),
                group.in_use.clone(),
            ],
        ));

        // Deadline missed: out of inprog, into redo.
        bundle.push(QueryAction::op(QueryOp::Select(Selector::Range {
            key: group.inprog_by_ack.clone(),
            min: None,
            max: Some(ScoreBound::Now),
            min_excl: false,
            max_excl: true,
            count: 0,
        })));
        bundle.push(QueryAction::op(QueryOp::RemoveFromInput {
            keys: vec![group.inprog_by_id.clone(), group.inprog_by_ack.clone()],
        }));
        bundle.push(QueryAction::op(QueryOp::AddTo {
            keys: vec![group.redo.clone()],
            score: ScoreRule::Value(Ts::ZERO),
        }));

        // Nothing at or before the cursor remains: drop it so the group
        // can restart from the beginning.
        bundle.push(QueryAction::op(QueryOp::SingleGet {
            key: group.ptr.clone(),
        }));
        bundle.push(QueryAction::op(QueryOp::Select(Selector::Range {
            key: avail.by_id.clone(),
            min: None,
            max: Some(ScoreBound::Input),
            min_excl: false,
            max_excl: false,
            count: 1,
        })));
        bundle.push(QueryAction::guarded(
            QueryOp::Delete { key: group.ptr },
            Guard::IfNoInput,
        ));

        self.inner.store.exec(bundle).await?;
        Ok(())
    }

    /// Purges expired events from a queue's available set.
    pub async fn clean_available(&self, queue: &str) -> Result<()> {
        if queue.is_empty() {
            return Err(Error::EmptyQueue);
        }
        let avail = self.avail_keys(queue);
        let now = self.inner.minter.new_ts(Utc::now());
        let mut bundle = QueryActions::new(avail.base.clone(), now);
        bundle.extend(sweep_expired(
            &avail.by_expire,
            vec![avail.by_id, avail.by_expire.clone()],
        ));
        self.inner.store.exec(bundle).await?;
        Ok(())
    }

    /// Cleans every queue and consumer group known to the catalog,
    /// stopping at the first error.
    pub async fn clean_all(&self) -> Result<()> {
        for (queue, groups) in self.inner.catalog.all().await? {
            self.clean_available(&queue).await?;
            for group in groups {
                self.clean(&queue, &group).await?;
            }
        }
        Ok(())
    }

    /// Reports per-queue totals and per-consumer-group progress.
    pub async fn status(&self, req: StatusRequest) -> Result<HashMap<String, QueueStats>> {
        let combos = match req.queues_consumer_groups {
            Some(map) if !map.is_empty() => map,
            _ => self.inner.catalog.all().await?,
        };
        let mut out = HashMap::new();
        for (queue, groups) in combos {
            let stats = self.queue_status(&queue, &groups).await?;
            out.insert(queue, stats);
        }
        Ok(out)
    }

    /// Every queue and consumer group the catalog knows about.
    pub async fn queues_consumer_groups(&self) -> Result<HashMap<String, Vec<String>>> {
        self.inner.catalog.all().await
    }

    async fn queue_status(&self, queue: &str, groups: &[String]) -> Result<QueueStats> {
        if queue.is_empty() {
            return Err(Error::EmptyQueue);
        }
        let avail = self.avail_keys(queue);
        let now = self.inner.minter.new_ts(Utc::now());

        let mut bundle = QueryActions::new(avail.base.clone(), now);
        bundle.extend(sweep_expired(
            &avail.by_expire,
            vec![avail.by_id.clone(), avail.by_expire.clone()],
        ));
        bundle.push(QueryAction::op(QueryOp::Select(all_of(&avail.by_id))));
        bundle.push(QueryAction::op(QueryOp::Count));

        for group in groups {
            if group.is_empty() {
                return Err(Error::EmptyConsumerGroup);
            }
            let keys = self.group_keys(queue, group);
            bundle.extend(sweep_expired(
                &keys.in_use,
                vec![
                    keys.inprog_by_id.clone(),
                    keys.inprog_by_ack.clone(),
                    keys.redo.clone(),
                    keys.done.clone(),
                    keys.in_use.clone(),
                ],
            ));
            bundle.push(QueryAction::op(QueryOp::SingleGet { key: keys.ptr }));
            bundle.push(QueryAction::op(QueryOp::Select(Selector::Range {
                key: avail.by_id.clone(),
                min: Some(ScoreBound::Input),
                max: None,
                min_excl: true,
                max_excl: false,
                count: 0,
            })));
            bundle.push(QueryAction::op(QueryOp::Count));
            bundle.push(QueryAction::op(QueryOp::Select(all_of(&keys.inprog_by_id))));
            bundle.push(QueryAction::op(QueryOp::Count));
            bundle.push(QueryAction::op(QueryOp::Select(all_of(&keys.redo))));
            bundle.push(QueryAction::op(QueryOp::Count));
        }

        let res = self.inner.store.exec(bundle).await?;
        let mut counts = res.counts.into_iter();
        let mut stats = QueueStats {
            total: counts.next().unwrap_or(0),
            groups: HashMap::new(),
        };
        for group in groups {
            let available = counts.next().unwrap_or(0);
            let in_progress = counts.next().unwrap_or(0);
            let redo = counts.next().unwrap_or(0);
            stats.groups.insert(
                group.clone(),
                GroupStats {
                    available,
                    in_progress,
                    redo,
                },
            );
        }
        Ok(stats)
    }

    fn avail_keys(&self, queue: &str) -> AvailKeys {
        AvailKeys::new(&self.inner.config.key_prefix, queue)
    }

    fn group_keys(&self, queue: &str, group: &str) -> GroupKeys {
        GroupKeys::new(&self.inner.config.key_prefix, queue, group)
    }
}

/// Selects members of `expire_view` already expired at bundle time and
/// removes them from `from`.
fn sweep_expired(expire_view: &Key, from: Vec<Key>) -> [QueryAction; 2] {
    [
        QueryAction::op(QueryOp::Select(Selector::Range {
            key: expire_view.clone(),
            min: None,
            max: Some(ScoreBound::Now),
            min_excl: false,
            max_excl: true,
            count: 0,
        })),
        QueryAction::op(QueryOp::RemoveFromInput { keys: from }),
    ]
}

fn first_of(key: &Key) -> Selector {
    Selector::Range {
        key: key.clone(),
        min: None,
        max: None,
        min_excl: false,
        max_excl: false,
        count: 1,
    }
}

fn all_of(key: &Key) -> Selector {
    Selector::Range {
        key: key.clone(),
        min: None,
        max: None,
        min_excl: false,
        max_excl: false,
        count: 0,
    }
}
