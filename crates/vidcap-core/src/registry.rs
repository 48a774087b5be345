//! In-memory registry of captured media assets.
//!
//! The registry is owned by whoever creates it (usually one proxy instance),
//! deduplicates by URL hash and notifies observers after every change.
//!
//! ## Notification order
//!
//! ```text
//! mutate: lock(entries) → change → queue snapshot → unlock(entries) → deliver
//! deliver: whichever thread holds the delivery lock drains the queue in order
//! ```
//!
//! Snapshots are queued while the entries lock is held, so observers see them
//! in mutation order. Each snapshot carries a version, and an observer only
//! receives snapshots newer than the version it registered at. No lock on the entries is held while observers run, so
//! callbacks may read or mutate the registry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use http::HeaderMap;
use parking_lot::Mutex;

use crate::asset::{url_hash, CapturedAsset};
use crate::matcher::is_capturable;

/// Observer called with the current asset list after each change.
pub type ChangeCallback = Arc<dyn Fn(&[CapturedAsset]) + Send + Sync>;

#[derive(Default)]
struct Entries {
    assets: HashMap<String, (u64, CapturedAsset)>,
    next_seq: u64,
    version: u64,
}

impl Entries {
    fn snapshot(&self) -> Vec<CapturedAsset> {
        let mut items: Vec<&(u64, CapturedAsset)> = self.assets.values().collect();
        items.sort_by(|(seq_a, a), (seq_b, b)| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| seq_b.cmp(seq_a))
        });
        items.into_iter().map(|(_, asset)| asset.clone()).collect()
    }
}

/// Thread-safe store of captured assets keyed by URL hash.
#[derive(Default)]
pub struct CaptureRegistry {
    entries: Mutex<Entries>,
    observers: Mutex<Vec<(u64, ChangeCallback)>>,
    pending: Mutex<VecDeque<(u64, Vec<CapturedAsset>)>>,
    delivering: Mutex<()>,
}

impl std::fmt::Debug for CaptureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRegistry")
            .field("len", &self.len())
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

impl CaptureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `url` if it looks like media and has not been seen before.
    ///
    /// Returns the new record, or `None` for non-media URLs and repeat
    /// sightings. A repeat sighting never updates the stored record.
    pub fn record_if_new(&self, url: &str, headers: &HeaderMap) -> Option<CapturedAsset> {
        if !is_capturable(url) {
            return None;
        }

        // Cheap pre-check so repeat sightings skip building the record.
        if self.entries.lock().assets.contains_key(&url_hash(url)) {
            return None;
        }

        self.insert(CapturedAsset::new(url, headers))
    }

    /// Inserts a prebuilt record unless its id is already present.
    pub fn insert(&self, asset: CapturedAsset) -> Option<CapturedAsset> {
        let mut entries = self.entries.lock();
        if entries.assets.contains_key(&asset.id) {
            return None;
        }

        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries
            .assets
            .insert(asset.id.clone(), (seq, asset.clone()));

        tracing::info!("Captured media asset {} ({})", asset.id, asset.title);
        self.notify(entries);
        Some(asset)
    }

    /// Returns all records, newest first.
    pub fn list(&self) -> Vec<CapturedAsset> {
        self.entries.lock().snapshot()
    }

    /// Returns the record with the given id.
    pub fn get(&self, id: &str) -> Option<CapturedAsset> {
        self.entries
            .lock()
            .assets
            .get(id)
            .map(|(_, asset)| asset.clone())
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.entries.lock().assets.len()
    }

    /// Returns true if nothing has been captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a record. Unknown ids are ignored.
    pub fn remove(&self, id: &str) {
        let mut entries = self.entries.lock();
        if entries.assets.remove(id).is_some() {
            tracing::debug!("Removed captured asset {}", id);
            self.notify(entries);
        }
    }

    /// Removes all records.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        if !entries.assets.is_empty() {
            entries.assets.clear();
            tracing::debug!("Cleared captured assets");
            self.notify(entries);
        }
    }

    /// Registers an observer for changes.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&[CapturedAsset]) + Send + Sync + 'static,
    {
        self.subscribe(callback);
    }

    /// Registers an observer and returns the list it starts from.
    ///
    /// The returned list and the first snapshot the observer receives are
    /// taken in that order with no change in between, so no mutation is seen
    /// twice or missed.
    pub fn subscribe<F>(&self, callback: F) -> Vec<CapturedAsset>
    where
        F: Fn(&[CapturedAsset]) + Send + Sync + 'static,
    {
        let entries = self.entries.lock();
        self.observers
            .lock()
            .push((entries.version, Arc::new(callback)));
        entries.snapshot()
    }

    fn notify(&self, mut entries: parking_lot::MutexGuard<'_, Entries>) {
        entries.version += 1;
        if self.observers.lock().is_empty() {
            return;
        }
        self.pending
            .lock()
            .push_back((entries.version, entries.snapshot()));
        drop(entries);
        self.deliver();
    }

    fn deliver(&self) {
        loop {
            let Some(guard) = self.delivering.try_lock() else {
                // The current holder drains our snapshot.
                return;
            };

            loop {
                let Some((version, snapshot)) = self.pending.lock().pop_front() else {
                    break;
                };
                let observers = self.observers.lock().clone();
                for (since, observer) in &observers {
                    if version > *since {
                        observer(&snapshot);
                    }
                }
            }

            drop(guard);
            if self.pending.lock().is_empty() {
                return;
            }
        }
    }
}
