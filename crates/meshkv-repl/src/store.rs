//! The local entry store: key → (envelope, digest), with change
//! notifications to subscribers.
//!
//! Entries are created on first write or first received replication and
//! never destroyed; deletion stores the tombstone envelope. The digest
//! is recomputed only on mutation, and subscribers are notified only
//! when the digest actually changed.

use crate::digest::Digest;
use crate::envelope::Envelope;
use crate::error::ReplError;
use crate::messages::{Key, SubscriptionEvent};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier a client assigns to one subscriber, so it can unsubscribe
/// and so the store can purge every bucket of a dead subscriber at once.
pub type WatcherId = u64;

/// One stored entry.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// The entry's envelope.
    pub envelope: Envelope,
    /// Fingerprint of the envelope, recomputed on every mutation.
    pub digest: Digest,
}

struct Watcher {
    id: WatcherId,
    sender: mpsc::UnboundedSender<SubscriptionEvent>,
}

/// The per-node entry store.
#[derive(Default)]
pub struct LocalStore {
    entries: BTreeMap<Key, StoredEntry>,
    subscribers: BTreeMap<Key, Vec<Watcher>>,
}

impl LocalStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&StoredEntry> {
        self.entries.get(key)
    }

    /// Store `envelope` under `key`, recomputing the digest.
    ///
    /// Subscribers of `key` are notified iff the digest changed. Returns
    /// whether the entry changed.
    pub fn set(&mut self, key: &Key, envelope: Envelope) -> Result<bool, ReplError> {
        let digest = Digest::of(&envelope)?;
        if let Some(existing) = self.entries.get(key) {
            if existing.digest == digest {
                return Ok(false);
            }
        }
        let event = if envelope.is_deleted() {
            SubscriptionEvent::Deleted { key: key.clone() }
        } else {
            SubscriptionEvent::Changed {
                key: key.clone(),
                value: envelope.data.clone(),
            }
        };
        self.entries
            .insert(key.clone(), StoredEntry { envelope, digest });
        self.notify(key, event);
        Ok(true)
    }

    /// Keys whose data is not deleted.
    pub fn live_keys(&self) -> BTreeSet<Key> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.envelope.is_deleted())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// All keys, live and deleted.
    pub fn all_keys(&self) -> Vec<Key> {
        self.entries.keys().cloned().collect()
    }

    /// The digest of every stored key.
    pub fn digests(&self) -> BTreeMap<Key, Digest> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.digest.clone()))
            .collect()
    }

    /// Number of stored entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a subscriber for `key`. If an entry already exists the
    /// subscriber immediately receives its current state.
    pub fn subscribe(
        &mut self,
        key: &Key,
        id: WatcherId,
        sender: mpsc::UnboundedSender<SubscriptionEvent>,
    ) {
        if let Some(entry) = self.entries.get(key) {
            let event = if entry.envelope.is_deleted() {
                SubscriptionEvent::Deleted { key: key.clone() }
            } else {
                SubscriptionEvent::Changed {
                    key: key.clone(),
                    value: entry.envelope.data.clone(),
                }
            };
            // A subscriber that is already gone is simply never added.
            if sender.send(event).is_err() {
                return;
            }
        }
        self.subscribers
            .entry(key.clone())
            .or_default()
            .push(Watcher { id, sender });
    }

    /// Remove watcher `id`'s subscription on `key`.
    pub fn unsubscribe(&mut self, key: &Key, id: WatcherId) {
        if let Some(bucket) = self.subscribers.get_mut(key) {
            bucket.retain(|w| w.id != id);
            if bucket.is_empty() {
                self.subscribers.remove(key);
            }
        }
    }

    /// Number of live subscriptions across all keys.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.values().map(Vec::len).sum()
    }

    fn notify(&mut self, key: &Key, event: SubscriptionEvent) {
        let mut dead: Vec<WatcherId> = Vec::new();
        if let Some(bucket) = self.subscribers.get(key) {
            for watcher in bucket {
                if watcher.sender.send(event.clone()).is_err() {
                    dead.push(watcher.id);
                }
            }
        }
        for id in dead {
            self.purge_watcher(id);
        }
    }

    /// Drop every subscription held by a terminated watcher.
    fn purge_watcher(&mut self, id: WatcherId) {
        debug!(watcher = id, "purging terminated subscriber");
        self.subscribers.retain(|_, bucket| {
            bucket.retain(|w| w.id != id);
            !bucket.is_empty()
        });
    }
}
