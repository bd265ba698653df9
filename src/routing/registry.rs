//! Channel to subscriber registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::core::MessageEnvelope;

/// Subscriber callback invoked for every matching envelope.
pub type Callback = Arc<dyn Fn(&MessageEnvelope) + Send + Sync>;

/// Token identifying one subscription.
///
/// Removal goes through the handle, never through callback identity, so the
/// same closure registered twice yields two independent handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    channel: String,
    id: u64,
}

impl SubscriptionHandle {
    /// Channel or pattern this subscription was made on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Registration sequence number (global per registry).
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Ordered subscribers of one channel key.
#[derive(Default, Clone)]
struct Subscribers(BTreeMap<u64, Callback>);

/// Mapping from channel name to its ordered subscriber list.
///
/// Keys ending in `*` are prefix patterns: `metrics:*` matches every channel
/// starting with `metrics:`. Exact and pattern subscribers are merged in
/// registration order by [`ChannelRegistry::matching`].
#[derive(Default)]
pub struct ChannelRegistry {
    exact: HashMap<String, Subscribers>,
    patterns: HashMap<String, Subscribers>,
    next_id: u64,
    len: usize,
}

impl ChannelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber to `channel`.
    pub fn insert(&mut self, channel: &str, callback: Callback) -> SubscriptionHandle {
        self.next_id += 1;
        let id = self.next_id;
        let table = match pattern_prefix(channel) {
            Some(_) => &mut self.patterns,
            None => &mut self.exact,
        };
        table
            .entry(channel.to_string())
            .or_default()
            .0
            .insert(id, callback);
        self.len += 1;
        SubscriptionHandle {
            channel: channel.to_string(),
            id,
        }
    }

    /// Remove one subscription. Returns `false` if it was already gone.
    pub fn remove(&mut self, handle: &SubscriptionHandle) -> bool {
        let table = match pattern_prefix(&handle.channel) {
            Some(_) => &mut self.patterns,
            None => &mut self.exact,
        };
        let Some(subs) = table.get_mut(&handle.channel) else {
            return false;
        };
        let removed = subs.0.remove(&handle.id).is_some();
        if subs.0.is_empty() {
            table.remove(&handle.channel);
        }
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// Callbacks that should receive a message on `channel`, in registration order.
    pub fn matching(&self, channel: &str) -> Vec<Callback> {
        let mut hits: Vec<(u64, Callback)> = Vec::new();
        if let Some(subs) = self.exact.get(channel) {
            hits.extend(subs.0.iter().map(|(id, cb)| (*id, Arc::clone(cb))));
        }
        for (key, subs) in &self.patterns {
            let matches = pattern_prefix(key).is_some_and(|prefix| channel.starts_with(prefix));
            if matches {
                hits.extend(subs.0.iter().map(|(id, cb)| (*id, Arc::clone(cb))));
            }
        }
        hits.sort_unstable_by_key(|(id, _)| *id);
        hits.into_iter().map(|(_, cb)| cb).collect()
    }

    /// Subscribers registered directly on `channel` (exact key, patterns not expanded).
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let table = match pattern_prefix(channel) {
            Some(_) => &self.patterns,
            None => &self.exact,
        };
        table.get(channel).map_or(0, |subs| subs.0.len())
    }

    /// Channel keys with at least one subscriber, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .exact
            .keys()
            .chain(self.patterns.keys())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Total number of subscriptions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop every subscription. Handle ids keep increasing afterwards.
    pub fn clear(&mut self) {
        self.exact.clear();
        self.patterns.clear();
        self.len = 0;
    }
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.channels())
            .field("len", &self.len)
            .finish()
    }
}

/// Prefix of a `*` pattern, or `None` for an exact channel.
fn pattern_prefix(channel: &str) -> Option<&str> {
    channel.strip_suffix('*')
}
