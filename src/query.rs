//! The compound-query language executed atomically by a store backend.
//!
//! A bundle is an ordered list of actions sharing a working set of event
//! ids, scoped to one key base. Selectors replace the working set; mutating
//! actions apply it to keys; guards and breaks steer control flow. Backends
//! execute the whole bundle atomically and isolated from concurrent
//! bundles, so everything that must be consistent goes into one bundle.
//!
//! Operations that derive a bound or value from the working set are
//! uniformly no-ops (or empty selections) when the working set is empty.

use crate::keys::{Key, KeyBase};
use crate::ts::{EventId, Ts};

/// One atomic unit of work against the backing store.
#[derive(Debug, Clone)]
pub struct QueryActions {
    /// Prefix every key named by the bundle must live under.
    pub base: KeyBase,
    /// The instant the bundle is evaluated at; [`ScoreBound::Now`] resolves
    /// to it.
    pub now: Ts,
    pub actions: Vec<QueryAction>,
}

impl QueryActions {
    pub fn new(base: KeyBase, now: Ts) -> Self {
        Self {
            base,
            now,
            actions: Vec::new(),
        }
    }

    pub fn push(&mut self, action: QueryAction) {
        self.actions.push(action);
    }

    pub fn extend(&mut self, actions: impl IntoIterator<Item = QueryAction>) {
        self.actions.extend(actions);
    }
}

/// A single step of a bundle.
#[derive(Debug, Clone)]
pub struct QueryAction {
    pub op: QueryOp,
    /// Skip the action, including its `brk`, unless the guard holds.
    pub guard: Option<Guard>,
    /// Stop executing the bundle after this action.
    pub brk: bool,
}

impl QueryAction {
    pub fn op(op: QueryOp) -> QueryAction {
        QueryAction {
            op,
            guard: None,
            brk: false,
        }
    }

    pub fn guarded(op: QueryOp, guard: Guard) -> QueryAction {
        QueryAction {
            op,
            guard: Some(guard),
            brk: false,
        }
    }

    /// Short-circuit the bundle when `guard` holds.
    pub fn break_if(guard: Guard) -> QueryAction {
        QueryAction {
            op: QueryOp::Nop,
            guard: Some(guard),
            brk: true,
        }
    }
}

/// Conditions gating an action.
#[derive(Debug, Clone)]
pub enum Guard {
    /// The working set is non-empty.
    IfInput,
    /// The working set is empty.
    IfNoInput,
    /// The named key exists: a non-empty ordered set or a present single
    /// value.
    IfNotEmpty(Key),
}

/// Primitive operations, one case per action kind.
#[derive(Debug, Clone)]
pub enum QueryOp {
    /// Replace the working set.
    Select(Selector),
    /// Add every working-set member to each key with the given score.
    AddTo { keys: Vec<Key>, score: ScoreRule },
    /// Remove every working-set member from each key.
    RemoveFromInput { keys: Vec<Key> },
    /// Replace the working set with a placeholder carrying the stored
    /// timestamp, or with nothing if the key is unset.
    SingleGet { key: Key },
    /// Store the first working-set member's creation timestamp into a
    /// single-value key; with `if_newer`, only if it exceeds the current
    /// value.
    SingleSet { key: Key, if_newer: bool },
    /// Delete a single-value key.
    Delete { key: Key },
    /// Record the working-set size in the result's counts.
    Count,
    /// Do nothing; carrier for guards and breaks.
    Nop,
}

/// Ways to populate the working set.
#[derive(Debug, Clone)]
pub enum Selector {
    /// An explicit list of ids.
    Ids(Vec<EventId>),
    /// Ascending score-range select over an ordered set.
    Range {
        key: Key,
        /// Lower score bound; `None` is unbounded.
        min: Option<ScoreBound>,
        /// Upper score bound; `None` is unbounded.
        max: Option<ScoreBound>,
        min_excl: bool,
        max_excl: bool,
        /// Maximum members selected; 0 selects all.
        count: usize,
    },
    /// Match `id` only if it is present with a score within the bounds.
    IdScore {
        key: Key,
        id: EventId,
        min: Option<ScoreBound>,
        max: Option<ScoreBound>,
    },
}

/// Score endpoints resolved at execution time.
#[derive(Debug, Clone, Copy)]
pub enum ScoreBound {
    At(Ts),
    /// The first working-set member's creation timestamp. Resolves to an
    /// empty selection when the working set is empty.
    Input,
    /// The bundle's `now`.
    Now,
}

/// Scores assigned by [`QueryOp::AddTo`].
#[derive(Debug, Clone)]
pub enum ScoreRule {
    Value(Ts),
    /// The member's intrinsic creation timestamp.
    Creation,
    /// The member's score in another ordered set of the same base; members
    /// absent from the source are skipped.
    CopyFrom(Key),
}

/// Ids and counts produced by one bundle.
#[derive(Debug, Clone, Default)]
pub struct QueryRes {
    /// The working set at bundle termination.
    pub ids: Vec<EventId>,
    /// One entry per [`QueryOp::Count`] action, in encounter order.
    pub counts: Vec<u64>,
}
