//! Subscription Index
//!
//! Filters are stored as exact strings. Matching a topic does not walk a
//! tree: it synthesizes, level by level, every filter string that could
//! match the topic (the literal level, `+` at that level, `#` at that level)
//! and looks each candidate up by exact key.
//!
//! A side table counts, for every proper level prefix of every registered
//! filter, how many filters extend it. A candidate prefix is expanded only
//! when some filter extends it, so enumeration never goes deeper than the
//! deepest registered filter.
//!
//! A topic level that is itself `+` or `#` is indistinguishable from the
//! wildcard of the same name.

mod validation;


pub use validation::{
    topic_matches_filter, validate_topic_filter, validate_topic_filter_with_max_levels,
    validate_topic_name_with_max_levels, DEFAULT_MAX_TOPIC_LEVELS,
};

use std::fmt;
use std::hash::BuildHasher;

use ahash::{AHashMap, RandomState};
use smallvec::SmallVec;

use crate::protocol::QoS;
use crate::session::ConnectionId;

/// One subscriber of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber {
    pub conn: ConnectionId,
    pub qos: QoS,
}

/// Filter string -> subscriber set
#[derive(Default)]
pub struct SubscriptionIndex {
    filters: AHashMap<String, Vec<Subscriber>>,
    /// Hash of a proper level prefix -> number of registered filters
    /// extending it. A collision only costs one extra lookup.
    prefixes: AHashMap<u64, usize>,
    hasher: RandomState,
}

impl fmt::Debug for SubscriptionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionIndex")
            .field("filters", &self.filters)
            .field("prefixes", &self.prefixes.len())
            .finish()
    }
}

/// Iterate the proper level prefixes of a filter: "a/b/c" -> "a", "a/b"
fn proper_prefixes(filter: &str) -> impl Iterator<Item = &str> {
    filter
        .match_indices('/')
        .map(move |(idx, _)| &filter[..idx])
}

fn join(prefix: &str, level: &str, depth: usize) -> String {
    if depth == 0 {
        level.to_owned()
    } else {
        let mut s = String::with_capacity(prefix.len() + 1 + level.len());
        s.push_str(prefix);
        s.push('/');
        s.push_str(level);
        s
    }
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `filter`. Re-subscribing replaces the stored
    /// QoS. Returns true if the session was not subscribed before.
    pub fn subscribe(&mut self, filter: &str, conn: ConnectionId, qos: QoS) -> bool {
        if let Some(subscribers) = self.filters.get_mut(filter) {
            if let Some(existing) = subscribers.iter_mut().find(|s| s.conn == conn) {
                existing.qos = qos;
                return false;
            }
            subscribers.push(Subscriber { conn, qos });
            return true;
        }

        for prefix in proper_prefixes(filter) {
            let key = self.prefix_key(prefix);
            *self.prefixes.entry(key).or_insert(0) += 1;
        }
        self.filters
            .insert(filter.to_owned(), vec![Subscriber { conn, qos }]);
        true
    }

    /// Remove `conn` from `filter`; the filter entry goes away with its last
    /// subscriber. Returns true if the session was subscribed.
    pub fn unsubscribe(&mut self, filter: &str, conn: ConnectionId) -> bool {
        let Some(subscribers) = self.filters.get_mut(filter) else {
            return false;
        };
        let Some(pos) = subscribers.iter().position(|s| s.conn == conn) else {
            return false;
        };
        subscribers.remove(pos);

        if subscribers.is_empty() {
            self.filters.remove(filter);
            for prefix in proper_prefixes(filter) {
                let key = self.prefix_key(prefix);
                if let Some(count) = self.prefixes.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        self.prefixes.remove(&key);
                    }
                }
            }
        }
        true
    }

    pub fn subscribers(&self, filter: &str) -> Option<&[Subscriber]> {
        self.filters.get(filter).map(Vec::as_slice)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.filters.contains_key(filter)
    }

    /// Number of filters with at least one subscriber
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Call `f` once per (matching filter, subscriber). A session subscribed
    /// through several overlapping filters is visited once per filter.
    pub fn for_each_match<F>(&self, topic: &str, mut f: F)
    where
        F: FnMut(&str, &Subscriber),
    {
        if self.filters.is_empty() {
            return;
        }
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        self.enumerate(&levels, &mut f);
    }

    /// Every registered filter matching `topic`, in enumeration order
    pub fn matching_filters(&self, topic: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        self.for_each_match(topic, |filter, _| {
            if out.last().map(String::as_str) != Some(filter) {
                out.push(filter.to_owned());
            }
        });
        out
    }

    fn visit<F>(&self, candidate: &str, f: &mut F)
    where
        F: FnMut(&str, &Subscriber),
    {
        if let Some(subscribers) = self.filters.get(candidate) {
            for subscriber in subscribers {
                f(candidate, subscriber);
            }
        }
    }

    fn prefix_key(&self, prefix: &str) -> u64 {
        BuildHasher::hash_one(&self.hasher, prefix)
    }

    /// Depth-first walk over candidate filter strings. Uses an explicit
    /// work list, so topic depth never grows the call stack.
    fn enumerate<F>(&self, levels: &[&str], f: &mut F)
    where
        F: FnMut(&str, &Subscriber),
    {
        let mut pending: Vec<(usize, String)> = vec![(0, String::new())];

        while let Some((depth, prefix)) = pending.pop() {
            let level = levels[depth];
            let last = depth + 1 == levels.len();

            // '#' here matches this level and everything below it
            let multi = join(&prefix, "#", depth);
            self.visit(&multi, f);

            let mut candidates: SmallVec<[String; 2]> = SmallVec::new();
            if level != "#" {
                candidates.push(join(&prefix, level, depth));
            }
            if level != "+" {
                candidates.push(join(&prefix, "+", depth));
            }

            for candidate in candidates {
                if last {
                    self.visit(&candidate, f);
                    // "a/#" also matches its parent "a"
                    let parent = join(&candidate, "#", depth + 1);
                    self.visit(&parent, f);
                } else if self.prefixes.contains_key(&self.prefix_key(&candidate)) {
                    pending.push((depth + 1, candidate));
                }
            }
        }
    }
}
