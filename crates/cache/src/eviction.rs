//! Eviction policies deciding which entry a full cache level gives up.
//!
//! A policy sees the level's entry index (metadata only) and keeps whatever
//! auxiliary ordering it needs. Victim selection is deterministic for a given
//! snapshot and policy state: ties are always broken by key.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use crate::level::EntryMeta;

/// Strategy for choosing eviction victims.
pub trait EvictionPolicy: Send {
    /// Short policy name used in logs.
    fn name(&self) -> &'static str;

    /// Called after an entry is inserted (or replaced).
    fn on_insert(&mut self, entry: &EntryMeta);

    /// Called after an entry is read.
    fn on_access(&mut self, entry: &EntryMeta);

    /// Called after an entry leaves the level for any reason.
    fn on_remove(&mut self, key: &str);

    /// Forgets all ordering state.
    fn clear(&mut self);

    /// Picks the entry to evict, or `None` when `entries` is empty.
    fn select_victim(&self, entries: &HashMap<String, EntryMeta>) -> Option<String>;

    /// Rebuilds ordering state from persisted metadata after a restart.
    ///
    /// The default replays inserts in creation order.
    fn restore(&mut self, entries: &[&EntryMeta]) {
        let mut ordered: Vec<&EntryMeta> = entries.to_vec();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        for entry in ordered {
            self.on_insert(entry);
        }
    }

    /// Whether entries can expire independently of capacity pressure.
    fn has_expiry(&self) -> bool {
        false
    }

    /// Returns true if `entry` has outlived its time-to-live at `now`.
    fn is_expired(&self, _entry: &EntryMeta, _now: SystemTime) -> bool {
        false
    }
}

/// Least recently used.
#[derive(Debug, Default)]
pub struct LruPolicy {
    /// Recency queue: front = least recently used, back = most recently used
    queue: VecDeque<String>,
}

impl LruPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, key: &str) {
        self.queue.retain(|k| k != key);
        self.queue.push_back(key.to_string());
    }
}

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_insert(&mut self, entry: &EntryMeta) {
        self.touch(&entry.key);
    }

    fn on_access(&mut self, entry: &EntryMeta) {
        self.touch(&entry.key);
    }

    fn on_remove(&mut self, key: &str) {
        self.queue.retain(|k| k != key);
    }

    fn clear(&mut self) {
        self.queue.clear();
    }

    fn select_victim(&self, entries: &HashMap<String, EntryMeta>) -> Option<String> {
        self.queue
            .iter()
            .find(|key| entries.contains_key(key.as_str()))
            .cloned()
            .or_else(|| oldest_by(entries, |e| e.last_accessed))
    }

    fn restore(&mut self, entries: &[&EntryMeta]) {
        let mut ordered: Vec<&EntryMeta> = entries.to_vec();
        ordered.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed).then_with(|| a.key.cmp(&b.key)));
        for entry in ordered {
            self.touch(&entry.key);
        }
    }
}

/// Least frequently used, ties broken by least recent touch.
#[derive(Debug, Default)]
pub struct LfuPolicy {
    /// key -> (access count, sequence number of last touch)
    counts: HashMap<String, (u64, u64)>,
    sequence: u64,
}

impl LfuPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn on_insert(&mut self, entry: &EntryMeta) {
        let seq = self.next_sequence();
        self.counts.insert(entry.key.clone(), (entry.access_count, seq));
    }

    fn on_access(&mut self, entry: &EntryMeta) {
        let seq = self.next_sequence();
        let slot = self.counts.entry(entry.key.clone()).or_insert((0, seq));
        slot.0 += 1;
        slot.1 = seq;
    }

    fn on_remove(&mut self, key: &str) {
        self.counts.remove(key);
    }

    fn clear(&mut self) {
        self.counts.clear();
        self.sequence = 0;
    }

    fn select_victim(&self, entries: &HashMap<String, EntryMeta>) -> Option<String> {
        entries
            .keys()
            .map(|key| {
                let (count, seq) = self.counts.get(key).copied().unwrap_or((0, 0));
                (count, seq, key)
            })
            .min()
            .map(|(_, _, key)| key.clone())
    }
}

/// First in, first out. Reads do not affect the order.
#[derive(Debug, Default)]
pub struct FifoPolicy {
    order: VecDeque<String>,
}

impl FifoPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionPolicy for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn on_insert(&mut self, entry: &EntryMeta) {
        self.order.retain(|k| k != &entry.key);
        self.order.push_back(entry.key.clone());
    }

    fn on_access(&mut self, _entry: &EntryMeta) {}

    fn on_remove(&mut self, key: &str) {
        self.order.retain(|k| k != key);
    }

    fn clear(&mut self) {
        self.order.clear();
    }

    fn select_victim(&self, entries: &HashMap<String, EntryMeta>) -> Option<String> {
        self.order
            .iter()
            .find(|key| entries.contains_key(key.as_str()))
            .cloned()
            .or_else(|| oldest_by(entries, |e| e.created_at))
    }
}

/// Time to live.
///
/// Entries expire `ttl` after creation and are purged on any probe of the
/// level. Under capacity pressure the entry closest to expiry goes first.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    ttl: Duration,
}

impl TtlPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl EvictionPolicy for TtlPolicy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    fn on_insert(&mut self, _entry: &EntryMeta) {}

    fn on_access(&mut self, _entry: &EntryMeta) {}

    fn on_remove(&mut self, _key: &str) {}

    fn clear(&mut self) {}

    fn select_victim(&self, entries: &HashMap<String, EntryMeta>) -> Option<String> {
        oldest_by(entries, |e| e.created_at)
    }

    fn has_expiry(&self) -> bool {
        true
    }

    fn is_expired(&self, entry: &EntryMeta, now: SystemTime) -> bool {
        now.duration_since(entry.created_at)
            .map(|age| age > self.ttl)
            .unwrap_or(false)
    }
}

fn oldest_by<F>(entries: &HashMap<String, EntryMeta>, stamp: F) -> Option<String>
where
    F: Fn(&EntryMeta) -> SystemTime,
{
    entries
        .values()
        .min_by(|a, b| stamp(a).cmp(&stamp(b)).then_with(|| a.key.cmp(&b.key)))
        .map(|e| e.key.clone())
}

/// Policy selector, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Lru,
    Lfu,
    Fifo,
    Ttl(Duration),
}

impl PolicyKind {
    /// Instantiates a fresh policy of this kind.
    pub fn build(&self) -> Box<dyn EvictionPolicy> {
        match *self {
            PolicyKind::Lru => Box::new(LruPolicy::new()),
            PolicyKind::Lfu => Box::new(LfuPolicy::new()),
            PolicyKind::Fifo => Box::new(FifoPolicy::new()),
            PolicyKind::Ttl(ttl) => Box::new(TtlPolicy::new(ttl)),
        }
    }

    /// Returns the same kind with `ttl` applied when this is a TTL policy.
    pub fn with_ttl(self, ttl: Duration) -> Self {
        match self {
            PolicyKind::Ttl(_) => PolicyKind::Ttl(ttl),
            other => other,
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Lru => write!(f, "lru"),
            PolicyKind::Lfu => write!(f, "lfu"),
            PolicyKind::Fifo => write!(f, "fifo"),
            PolicyKind::Ttl(ttl) => write!(f, "ttl({}s)", ttl.as_secs()),
        }
    }
}

/// Unknown policy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown eviction policy: {0}")]
pub struct UnknownPolicy(pub String);

impl FromStr for PolicyKind {
    type Err = UnknownPolicy;

    /// Parses `lru`, `lfu`, `fifo` or `ttl`. A bare `ttl` gets a zero
    /// duration; callers apply the configured one with [`PolicyKind::with_ttl`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(PolicyKind::Lru),
            "lfu" => Ok(PolicyKind::Lfu),
            "fifo" => Ok(PolicyKind::Fifo),
            "ttl" => Ok(PolicyKind::Ttl(Duration::ZERO)),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}
