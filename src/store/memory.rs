//! In-memory store backend and reference query executor.
//!
//! Keeps every table behind one mutex, which makes bundle execution
//! trivially atomic and isolated. Doubles as the test backend and as an
//! embedded single-process store; all data is lost when the process exits.

use super::backend::StoreBackend;
use crate::keys::Key;
use crate::query::{
    Guard, QueryActions, QueryOp, QueryRes, ScoreBound, ScoreRule, Selector,
};
use crate::ts::{EventId, Ts};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};

/// Maximum number of subscribers per notification channel.
const MAX_SUBSCRIBERS_PER_CHANNEL: usize = 1024;

/// Ordered set of `(member, score)` pairs, ordered by score with ties
/// broken by member.
#[derive(Debug, Default)]
struct OrderedSet {
    scores: HashMap<EventId, u64>,
    ordered: BTreeSet<(u64, EventId)>,
}

impl OrderedSet {
    fn insert(&mut self, id: EventId, score: u64) {
        if let Some(old) = self.scores.insert(id, score) {
            self.ordered.remove(&(old, id));
        }
        self.ordered.insert((score, id));
    }

    fn remove(&mut self, id: EventId) -> bool {
        if let Some(old) = self.scores.remove(&id) {
            self.ordered.remove(&(old, id));
            true
        } else {
            false
        }
    }

    fn score(&self, id: EventId) -> Option<u64> {
        self.scores.get(&id).copied()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Members within the score bounds, ascending, at most `count`
    /// (0 selects all).
    fn range(
        &self,
        min: Option<u64>,
        min_excl: bool,
        max: Option<u64>,
        max_excl: bool,
        count: usize,
    ) -> Vec<EventId> {
        let lower = match min {
            None => Bound::Unbounded,
            Some(s) if min_excl => Bound::Excluded((s, EventId::MAX)),
            Some(s) => Bound::Included((s, EventId::MIN)),
        };
        let upper = match max {
            None => Bound::Unbounded,
            Some(s) if max_excl => Bound::Excluded((s, EventId::MIN)),
            Some(s) => Bound::Included((s, EventId::MAX)),
        };
        let iter = self.ordered.range((lower, upper)).map(|&(_, id)| id);
        if count == 0 {
            iter.collect()
        } else {
            iter.take(count).collect()
        }
    }
}

#[derive(Debug)]
struct Blob {
    bytes: Vec<u8>,
    expires_at: Instant,
}

impl Blob {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct State {
    zsets: HashMap<String, OrderedSet>,
    singles: HashMap<String, Ts>,
    sets: HashMap<String, BTreeSet<String>>,
    blobs: HashMap<String, Blob>,
}

/// In-memory backing store.
///
/// `MemoryStore` is `Send + Sync` and cheap to share behind an `Arc`. One
/// lock over all tables makes every bundle atomic; blobs expire lazily on
/// access, and pub/sub channels are broadcast channels created on first
/// subscription, so a publish with no subscribers reaches nobody.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    channels: DashMap<String, broadcast::Sender<EventId>>,
    error_senders: Mutex<Vec<mpsc::Sender<anyhow::Error>>>,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_keys(bundle: &QueryActions) -> Result<()> {
    let check = |key: &Key| -> Result<()> {
        if key.base() != &bundle.base {
            anyhow::bail!("key {key} outside bundle base {}", bundle.base);
        }
        Ok(())
    };
    for action in &bundle.actions {
        if let Some(Guard::IfNotEmpty(key)) = &action.guard {
            check(key)?;
        }
        match &action.op {
            QueryOp::Select(Selector::Range { key, .. })
            | QueryOp::Select(Selector::IdScore { key, .. })
            | QueryOp::SingleGet { key }
            | QueryOp::SingleSet { key, .. }
            | QueryOp::Delete { key } => check(key)?,
            QueryOp::AddTo { keys, score } => {
                for key in keys {
                    check(key)?;
                }
                if let ScoreRule::CopyFrom(src) = score {
                    check(src)?;
                }
            }
            QueryOp::RemoveFromInput { keys } => {
                for key in keys {
                    check(key)?;
                }
            }
            QueryOp::Select(Selector::Ids(_)) | QueryOp::Count | QueryOp::Nop => {}
        }
    }
    Ok(())
}

fn guard_holds(state: &State, guard: &Guard, input: &[EventId]) -> bool {
    match guard {
        Guard::IfInput => !input.is_empty(),
        Guard::IfNoInput => input.is_empty(),
        Guard::IfNotEmpty(key) => {
            let key = key.to_string();
            state.singles.contains_key(&key)
                || state.zsets.get(&key).is_some_and(|set| !set.is_empty())
        }
    }
}

/// Resolves a score bound. The outer `None` means the bound referenced an
/// empty working set and the selection must be empty.
fn resolve_bound(
    bound: Option<ScoreBound>,
    input: &[EventId],
    now: Ts,
) -> Option<Option<u64>> {
    match bound {
        None => Some(None),
        Some(ScoreBound::At(ts)) => Some(Some(ts.0)),
        Some(ScoreBound::Now) => Some(Some(now.0)),
        Some(ScoreBound::Input) => input.first().map(|id| Some(id.t.0)),
    }
}

fn select(state: &State, selector: &Selector, input: &[EventId], now: Ts) -> Vec<EventId> {
    match selector {
        Selector::Ids(ids) => ids.clone(),
        Selector::Range {
            key,
            min,
            max,
            min_excl,
            max_excl,
            count,
        } => {
            let (Some(min), Some(max)) = (
                resolve_bound(*min, input, now),
                resolve_bound(*max, input, now),
            ) else {
                return Vec::new();
            };
            state
                .zsets
                .get(&key.to_string())
                .map(|set| set.range(min, *min_excl, max, *max_excl, *count))
                .unwrap_or_default()
        }
        Selector::IdScore { key, id, min, max } => {
            let (Some(min), Some(max)) = (
                resolve_bound(*min, input, now),
                resolve_bound(*max, input, now),
            ) else {
                return Vec::new();
            };
            let matched = state
                .zsets
                .get(&key.to_string())
                .and_then(|set| set.score(*id))
                .is_some_and(|score| {
                    min.is_none_or(|min| score >= min) && max.is_none_or(|max| score <= max)
                });
            if matched { vec![*id] } else { Vec::new() }
        }
    }
}

fn run_bundle(state: &mut State, bundle: &QueryActions) -> QueryRes {
    let mut input: Vec<EventId> = Vec::new();
    let mut counts: Vec<u64> = Vec::new();
    for action in &bundle.actions {
        if let Some(guard) = &action.guard
            && !guard_holds(state, guard, &input)
        {
            continue;
        }
        match &action.op {
            QueryOp::Select(selector) => input = select(state, selector, &input, bundle.now),
            QueryOp::AddTo { keys, score } => {
                let scored: Vec<(EventId, u64)> = input
                    .iter()
                    .filter_map(|&id| match score {
                        ScoreRule::Value(ts) => Some((id, ts.0)),
                        ScoreRule::Creation => Some((id, id.t.0)),
                        ScoreRule::CopyFrom(src) => state
                            .zsets
                            .get(&src.to_string())
                            .and_then(|set| set.score(id))
                            .map(|score| (id, score)),
                    })
                    .collect();
                for key in keys {
                    let set = state.zsets.entry(key.to_string()).or_default();
                    for &(id, score) in &scored {
                        set.insert(id, score);
                    }
                }
            }
            QueryOp::RemoveFromInput { keys } => {
                for key in keys {
                    if let Some(set) = state.zsets.get_mut(&key.to_string()) {
                        for &id in &input {
                            set.remove(id);
                        }
                    }
                }
            }
            QueryOp::SingleGet { key } => {
                input = state
                    .singles
                    .get(&key.to_string())
                    .map(|&ts| vec![EventId::cursor(ts)])
                    .unwrap_or_default();
            }
            QueryOp::SingleSet { key, if_newer } => {
                if let Some(first) = input.first() {
                    let key = key.to_string();
                    let current = state.singles.get(&key).copied();
                    if !*if_newer || current.is_none_or(|current| first.t > current) {
                        state.singles.insert(key, first.t);
                    }
                }
            }
            QueryOp::Delete { key } => {
                state.singles.remove(&key.to_string());
            }
            QueryOp::Count => counts.push(input.len() as u64),
            QueryOp::Nop => {}
        }
        if action.brk {
            break;
        }
    }
    QueryRes { ids: input, counts }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn exec(&self, bundle: QueryActions) -> Result<QueryRes> {
        // Validate up front so a rejected bundle has no partial effects.
        check_keys(&bundle)?;
        let mut state = self.state.lock();
        Ok(run_bundle(&mut state, &bundle))
    }

    async fn put_blob(&self, key: &Key, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.state.lock().blobs.insert(
            key.to_string(),
            Blob {
                bytes: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_blob(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        let mut state = self.state.lock();
        if state.blobs.get(&key).is_some_and(Blob::is_expired) {
            state.blobs.remove(&key);
            return Ok(None);
        }
        Ok(state.blobs.get(&key).map(|blob| blob.bytes.clone()))
    }

    async fn set_insert(&self, key: &Key, member: &str) -> Result<()> {
        self.state
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &Key) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .sets
            .get(&key.to_string())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &Key, id: EventId) -> Result<usize> {
        Ok(self
            .channels
            .get(&channel.to_string())
            .map_or(0, |sender| sender.send(id).unwrap_or(0)))
    }

    async fn subscribe(&self, channel: &Key) -> Result<broadcast::Receiver<EventId>> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MAX_SUBSCRIBERS_PER_CHANNEL).0);
        Ok(sender.subscribe())
    }

    fn error_channel(&self) -> mpsc::Receiver<anyhow::Error> {
        let (sender, receiver) = mpsc::channel(1);
        // Keep the sender alive so the channel stays open and never yields.
        self.error_senders.lock().push(sender);
        receiver
    }
}
