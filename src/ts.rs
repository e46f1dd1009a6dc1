//! Timestamps and timestamped event identifiers.
//!
//! Identifiers combine a microsecond wall-clock timestamp with a
//! per-process sequence, so their natural ordering is chronological and
//! they can double as sorted-set members.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A point in time with microsecond resolution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Ts(pub u64);

impl Ts {
    pub const ZERO: Ts = Ts(0);

    /// Microseconds since the Unix epoch.
    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Time remaining until `self`, measured from `now`. Zero if already
    /// passed.
    pub fn since(self, now: Ts) -> Duration {
        Duration::from_micros(self.0.saturating_sub(now.0))
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.0 as i64).unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl From<DateTime<Utc>> for Ts {
    fn from(dt: DateTime<Utc>) -> Ts {
        Ts(dt.timestamp_micros().max(0) as u64)
    }
}

impl fmt::Display for Ts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique event identifier whose ordering is chronological.
///
/// `t` is the event's creation time; `seq` disambiguates ids minted within
/// the same microsecond on one process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EventId {
    pub t: Ts,
    pub seq: u32,
}

impl EventId {
    pub(crate) const MIN: EventId = EventId { t: Ts(0), seq: 0 };
    pub(crate) const MAX: EventId = EventId {
        t: Ts(u64::MAX),
        seq: u32::MAX,
    };

    /// Placeholder carrying a cursor timestamp through a query bundle.
    pub(crate) fn cursor(t: Ts) -> EventId {
        EventId { t, seq: u32::MAX }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Fixed width so the lexicographic order matches the numeric one.
        write!(f, "{:020}-{:010}", self.t.0, self.seq)
    }
}

#[derive(Debug, Default)]
struct MintState {
    last_ts: u64,
    id_ts: u64,
    seq: u32,
}

/// Per-process mint for timestamps and event ids.
#[derive(Debug, Default)]
pub struct IdMinter {
    state: Mutex<MintState>,
}

impl IdMinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a timestamp at least as large as every previously issued one
    /// on this process, regardless of wall-clock regressions.
    pub fn new_ts(&self, wall: DateTime<Utc>) -> Ts {
        let micros = wall.timestamp_micros().max(0) as u64;
        let mut st = self.state.lock();
        st.last_ts = st.last_ts.max(micros);
        Ts(st.last_ts)
    }

    /// Mint an id unique on this process for the given timestamp.
    pub fn new_id(&self, ts: Ts) -> EventId {
        let mut st = self.state.lock();
        if st.id_ts == ts.0 {
            st.seq += 1;
        } else {
            st.id_ts = ts.0;
            st.seq = 0;
        }
        EventId {
            t: ts,
            seq: st.seq,
        }
    }
}
