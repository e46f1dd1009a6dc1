//! Tests for the queue engine.

use super::*;
use crate::config::Config;
use crate::events::EventStore;
use crate::keys::{AvailKeys, GroupKeys, Key};
use crate::query::{QueryAction, QueryActions, QueryOp, ScoreRule, Selector};
use crate::store::{MemoryStore, StoreBackend};
use crate::ts::{EventId, Ts};
use anyhow::Result;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn service() -> (Arc<MemoryStore>, QueueService) {
    let store = Arc::new(MemoryStore::new());
    (store.clone(), QueueService::new(store, Config::default()))
}

fn add_req(queue: &str, expire_ms: i64, contents: &[u8]) -> AddRequest {
    AddRequest {
        queue: queue.into(),
        expire: Utc::now() + Duration::milliseconds(expire_ms),
        contents: contents.to_vec(),
    }
}

fn get_req(queue: &str, group: &str) -> GetRequest {
    GetRequest {
        queue: queue.into(),
        consumer_group: group.into(),
        ..Default::default()
    }
}

fn get_with_deadline(queue: &str, group: &str, deadline_ms: i64) -> GetRequest {
    GetRequest {
        ack_deadline: Some(Utc::now() + Duration::milliseconds(deadline_ms)),
        ..get_req(queue, group)
    }
}

fn ack_req(queue: &str, group: &str, id: EventId) -> AckRequest {
    AckRequest {
        queue: queue.into(),
        consumer_group: group.into(),
        id,
    }
}

async fn members(store: &MemoryStore, key: &Key) -> Vec<EventId> {
    let mut bundle = QueryActions::new(key.base().clone(), Ts::ZERO);
    bundle.push(QueryAction::op(QueryOp::Select(Selector::Range {
        key: key.clone(),
        min: None,
        max: None,
        min_excl: false,
        max_excl: false,
        count: 0,
    })));
    store.exec(bundle).await.unwrap().ids
}

async fn cursor(store: &MemoryStore, group: &GroupKeys) -> Option<Ts> {
    let mut bundle = QueryActions::new(group.ptr.base().clone(), Ts::ZERO);
    bundle.push(QueryAction::op(QueryOp::SingleGet {
        key: group.ptr.clone(),
    }));
    store
        .exec(bundle)
        .await
        .unwrap()
        .ids
        .first()
        .map(|id| id.t)
}

/// Puts ids straight into a group's redo set, the way a missed deadline
/// would.
async fn inject_redo(store: &MemoryStore, queue: &str, group: &str, ids: Vec<EventId>) {
    let avail = AvailKeys::new("", queue);
    let keys = GroupKeys::new("", queue, group);
    let mut bundle = QueryActions::new(avail.base.clone(), Ts::ZERO);
    bundle.push(QueryAction::op(QueryOp::Select(Selector::Ids(ids))));
    bundle.push(QueryAction::op(QueryOp::AddTo {
        keys: vec![keys.redo.clone()],
        score: ScoreRule::Value(Ts::ZERO),
    }));
    bundle.push(QueryAction::op(QueryOp::AddTo {
        keys: vec![keys.in_use.clone()],
        score: ScoreRule::CopyFrom(avail.by_expire.clone()),
    }));
    store.exec(bundle).await.unwrap();
}

#[tokio::test]
async fn test_add_indexes_both_views() -> Result<()> {
    let (store, queues) = service();
    let id = queues.add(add_req("q", 10_000, b"a")).await?;

    let avail = AvailKeys::new("", "q");
    assert_eq!(members(&store, &avail.by_id).await, vec![id]);
    assert_eq!(members(&store, &avail.by_expire).await, vec![id]);

    let event = queues.get(get_req("q", "cg")).await?.unwrap();
    assert_eq!(event.id, id);
    assert_eq!(event.contents, b"a");
    // Delivery never removes the event from the available set.
    assert_eq!(members(&store, &avail.by_id).await, vec![id]);
    Ok(())
}

#[tokio::test]
async fn test_delivery_order_across_roles() -> Result<()> {
    let (store, queues) = service();
    let mut ids = Vec::new();
    for i in 0..6u8 {
        ids.push(queues.add(add_req("q", 60_000, &[i])).await?);
    }
    let keys = GroupKeys::new("", "q", "cg");

    // Two gets with an ack deadline land in inprog.
    let e0 = queues.get(get_with_deadline("q", "cg", 60_000)).await?.unwrap();
    let e1 = queues.get(get_with_deadline("q", "cg", 60_000)).await?.unwrap();
    assert_eq!((e0.id, e1.id), (ids[0], ids[1]));
    assert_eq!(members(&store, &keys.inprog_by_id).await, vec![ids[0], ids[1]]);

    // Two gets without a deadline settle immediately.
    let e2 = queues.get(get_req("q", "cg")).await?.unwrap();
    let e3 = queues.get(get_req("q", "cg")).await?.unwrap();
    assert_eq!((e2.id, e3.id), (ids[2], ids[3]));
    assert_eq!(members(&store, &keys.done).await, vec![ids[2], ids[3]]);
    assert_eq!(members(&store, &keys.inprog_by_id).await, vec![ids[0], ids[1]]);

    // Redo wins over anything new in the available set.
    inject_redo(&store, "q", "cg", vec![ids[4], ids[5]]).await;
    let e4 = queues.get(get_req("q", "cg")).await?.unwrap();
    let e5 = queues.get(get_req("q", "cg")).await?.unwrap();
    assert_eq!((e4.id, e5.id), (ids[4], ids[5]));
    assert_eq!(
        members(&store, &keys.done).await,
        vec![ids[2], ids[3], ids[4], ids[5]]
    );
    assert!(members(&store, &keys.redo).await.is_empty());

    // Everything has been offered; the queue reads as drained.
    assert!(queues.get(get_req("q", "cg")).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_earlier_expire_still_delivered_in_id_order() -> Result<()> {
    let (store, queues) = service();
    let first = queues.add(add_req("q", 60_000, b"first")).await?;
    queues.get(get_req("q", "cg")).await?.unwrap();

    // An event expiring sooner than its predecessors is still next in
    // line: delivery order follows creation time, not expiration.
    let sooner = queues.add(add_req("q", 5_000, b"sooner")).await?;
    let event = queues.get(get_req("q", "cg")).await?.unwrap();
    assert_eq!(event.id, sooner);

    let keys = GroupKeys::new("", "q", "cg");
    assert_eq!(members(&store, &keys.done).await, vec![first, sooner]);
    Ok(())
}

#[tokio::test]
async fn test_ack_window() -> Result<()> {
    let (store, queues) = service();
    let keys = GroupKeys::new("", "q", "cg");

    // Acked in time: settled, and a second ack is a no-op.
    let id = queues.add(add_req("q", 60_000, b"x")).await?;
    queues.get(get_with_deadline("q", "cg", 60_000)).await?.unwrap();
    assert!(queues.ack(ack_req("q", "cg", id)).await?);
    assert!(!queues.ack(ack_req("q", "cg", id)).await?);
    assert!(members(&store, &keys.inprog_by_id).await.is_empty());
    assert_eq!(members(&store, &keys.done).await, vec![id]);

    // Acked too late: stays in inprog until clean moves it to redo.
    let late = queues.add(add_req("q", 60_000, b"y")).await?;
    queues.get(get_with_deadline("q", "cg", 40)).await?.unwrap();
    tokio::time::sleep(StdDuration::from_millis(80)).await;
    assert!(!queues.ack(ack_req("q", "cg", late)).await?);
    assert_eq!(members(&store, &keys.inprog_by_id).await, vec![late]);

    queues.clean("q", "cg").await?;
    assert!(members(&store, &keys.inprog_by_id).await.is_empty());
    assert_eq!(members(&store, &keys.redo).await, vec![late]);

    // The missed event comes around again, ahead of anything new.
    let event = queues.get(get_with_deadline("q", "cg", 60_000)).await?.unwrap();
    assert_eq!(event.id, late);
    Ok(())
}

#[tokio::test]
async fn test_clean_purges_expired_and_migrates_missed() -> Result<()> {
    let (store, queues) = service();
    let keys = GroupKeys::new("", "q", "cg");

    let a = queues.add(add_req("q", 80, b"a")).await?;
    let b = queues.add(add_req("q", 60_000, b"b")).await?;
    let c = queues.add(add_req("q", 80, b"c")).await?;
    let d = queues.add(add_req("q", 60_000, b"d")).await?;
    let f = queues.add(add_req("q", 60_000, b"f")).await?;

    queues.get(get_with_deadline("q", "cg", 40)).await?.unwrap(); // a
    queues.get(get_with_deadline("q", "cg", 60_000)).await?.unwrap(); // b
    queues.get(get_req("q", "cg")).await?.unwrap(); // c
    queues.get(get_req("q", "cg")).await?.unwrap(); // d
    queues.get(get_with_deadline("q", "cg", 40)).await?.unwrap(); // f
    assert_eq!(members(&store, &keys.in_use).await.len(), 5);

    // a and c expire; the deadlines of a and f pass.
    tokio::time::sleep(StdDuration::from_millis(120)).await;
    queues.clean("q", "cg").await?;

    // Expired ids are gone from every role set; the missed-but-live one
    // moved to redo; live settled ones stayed where they were.
    assert_eq!(members(&store, &keys.inprog_by_id).await, vec![b]);
    assert_eq!(members(&store, &keys.done).await, vec![d]);
    assert_eq!(members(&store, &keys.redo).await, vec![f]);
    assert_eq!(members(&store, &keys.in_use).await, vec![b, d, f]);
    assert!(!members(&store, &keys.in_use).await.contains(&a));
    assert!(!members(&store, &keys.in_use).await.contains(&c));
    Ok(())
}

#[tokio::test]
async fn test_clean_drops_cursor_once_nothing_remains_behind_it() -> Result<()> {
    let (store, queues) = service();
    let keys = GroupKeys::new("", "q", "cg");

    queues.add(add_req("q", 60, b"x")).await?;
    queues.get(get_req("q", "cg")).await?.unwrap();
    assert!(cursor(&store, &keys).await.is_some());

    tokio::time::sleep(StdDuration::from_millis(100)).await;
    queues.clean_available("q").await?;
    queues.clean("q", "cg").await?;
    assert_eq!(cursor(&store, &keys).await, None);

    // With no cursor the group starts from the beginning again.
    let id = queues.add(add_req("q", 60_000, b"y")).await?;
    let event = queues.get(get_req("q", "cg")).await?.unwrap();
    assert_eq!(event.id, id);
    Ok(())
}

#[tokio::test]
async fn test_late_arrival_behind_cursor_is_skipped_for_that_group() -> Result<()> {
    let (store, queues) = service();
    let delivered = queues.add(add_req("q", 60_000, b"new")).await?;
    queues.get(get_req("q", "cg")).await?.unwrap();

    // Simulate a concurrent writer whose id was minted before the cursor
    // advanced past it.
    let avail = AvailKeys::new("", "q");
    let old = EventId {
        t: Ts(delivered.t.0 - 1),
        seq: 0,
    };
    let old_event = crate::events::Event {
        id: old,
        expire: Ts(delivered.t.0 + 60_000_000),
        contents: b"old".to_vec(),
    };
    let backend: Arc<dyn StoreBackend> = store.clone();
    let events = EventStore::new(backend, StdDuration::from_secs(30));
    events.put(&avail.base, &old_event, old.t).await?;
    let mut bundle = QueryActions::new(avail.base.clone(), Ts::ZERO);
    bundle.push(QueryAction::op(QueryOp::Select(Selector::Ids(vec![old]))));
    bundle.push(QueryAction::op(QueryOp::AddTo {
        keys: vec![avail.by_id.clone()],
        score: ScoreRule::Creation,
    }));
    bundle.push(QueryAction::op(QueryOp::AddTo {
        keys: vec![avail.by_expire.clone()],
        score: ScoreRule::Value(old_event.expire),
    }));
    store.exec(bundle).await?;

    // The group that already moved past it never sees it again.
    assert!(queues.get(get_req("q", "cg")).await?.is_none());

    // A fresh group scans from the beginning and receives both.
    let first = queues.get(get_req("q", "other")).await?.unwrap();
    let second = queues.get(get_req("q", "other")).await?.unwrap();
    assert_eq!(first.id, old);
    assert_eq!(second.id, delivered);
    Ok(())
}

#[tokio::test]
async fn test_groups_consume_independently() -> Result<()> {
    let (_, queues) = service();
    let a = queues.add(add_req("q", 60_000, b"a")).await?;
    let b = queues.add(add_req("q", 60_000, b"b")).await?;

    for group in ["readers", "auditors"] {
        let first = queues.get(get_req("q", group)).await?.unwrap();
        let second = queues.get(get_req("q", group)).await?.unwrap();
        assert_eq!((first.id, second.id), (a, b));
        assert!(queues.get(get_req("q", group)).await?.is_none());
    }
    Ok(())
}

#[tokio::test]
async fn test_get_on_empty_queue_returns_none() -> Result<()> {
    let (_, queues) = service();
    assert!(queues.get(get_req("empty", "cg")).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_expired_event_is_not_delivered() -> Result<()> {
    let (_, queues) = service();
    queues.add(add_req("q", 40, b"short-lived")).await?;
    tokio::time::sleep(StdDuration::from_millis(80)).await;
    assert!(queues.get(get_req("q", "cg")).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_preconditions_rejected() {
    let (_, queues) = service();

    let err = queues.add(add_req("", 1_000, b"x")).await.unwrap_err();
    assert!(matches!(err, crate::Error::EmptyQueue));

    let err = queues.add(add_req("q", -1_000, b"x")).await.unwrap_err();
    assert!(matches!(err, crate::Error::ExpireNotFuture));

    let err = queues.get(get_req("q", "")).await.unwrap_err();
    assert!(matches!(err, crate::Error::EmptyConsumerGroup));

    let err = queues
        .ack(ack_req("", "cg", EventId { t: Ts(1), seq: 0 }))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::Error::EmptyQueue));
}

#[tokio::test]
async fn test_catalog_tracks_adds_and_gets() -> Result<()> {
    let (_, queues) = service();
    queues.add(add_req("q1", 60_000, b"x")).await?;
    queues.get(get_req("q1", "cg1")).await?;
    queues.get(get_req("q2", "cg2")).await?;

    let all = queues.queues_consumer_groups().await?;
    assert_eq!(all["q1"], vec!["cg1"]);
    // A queue only ever read from is still known.
    assert_eq!(all["q2"], vec!["cg2"]);
    Ok(())
}
