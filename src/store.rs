//! A small informer-style cache over watched objects.
//!
//! Split into an exclusive [`Writer`] driven by a single watch event loop and
//! cheaply cloneable read handles ([`Store`]). The writer buffers objects
//! during a (re)list so that objects which vanished while the watch was
//! desynchronized can be reported back to the event loop, and flips a
//! readiness latch once the first list pass completes.

use std::sync::Arc;

use ahash::AHashMap;
use kube::{Resource, ResourceExt};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::api::obj_key;

type Cache<K> = Arc<RwLock<AHashMap<String, Arc<K>>>>;

fn key_of<K: Resource>(obj: &K) -> String {
    obj_key(obj.namespace().as_deref(), &obj.name_any())
}

/// Exclusive write handle, owned by the watch event loop.
pub struct Writer<K: Resource> {
    cache: Cache<K>,
    buffer: Option<AHashMap<String, Arc<K>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<K: Resource> Default for Writer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> Writer<K> {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            cache: Default::default(),
            buffer: None,
            ready_tx,
            ready_rx,
        }
    }

    pub fn as_reader(&self) -> Store<K> {
        Store {
            cache: self.cache.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }

    /// A (re)list has started; start buffering the listed set.
    pub fn begin_init(&mut self) {
        self.buffer = Some(AHashMap::new());
    }

    /// Record one object of the list pass. Returns the previously known
    /// version, if any, so the caller can dispatch add vs update.
    pub fn apply_init(&mut self, obj: K) -> Option<Arc<K>> {
        let key = key_of(&obj);
        let obj = Arc::new(obj);
        if let Some(buffer) = &mut self.buffer {
            buffer.insert(key.clone(), obj.clone());
        }
        self.cache.write().insert(key, obj)
    }

    /// The list pass is complete. Drops objects that vanished while the
    /// watch was down and returns them, and marks the store ready.
    pub fn end_init(&mut self) -> Vec<Arc<K>> {
        let mut vanished = Vec::new();
        if let Some(buffer) = self.buffer.take() {
            let mut cache = self.cache.write();
            cache.retain(|key, obj| {
                let keep = buffer.contains_key(key);
                if !keep {
                    vanished.push(obj.clone());
                }
                keep
            });
        }
        self.ready_tx.send_replace(true);
        vanished
    }

    /// Upsert from a watch event. Returns the previous version, if any.
    pub fn apply(&mut self, obj: K) -> Option<Arc<K>> {
        let key = key_of(&obj);
        self.cache.write().insert(key, Arc::new(obj))
    }

    /// Remove from a watch delete event.
    pub fn remove(&mut self, obj: &K) -> Option<Arc<K>> {
        self.cache.write().remove(&key_of(obj))
    }
}

/// Read handle; the controller's "lister".
pub struct Store<K> {
    cache: Cache<K>,
    ready_rx: watch::Receiver<bool>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            ready_rx: self.ready_rx.clone(),
        }
    }
}

impl<K> Store<K> {
    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.cache.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.cache.read().values().cloned().collect()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Resolves once the first list pass has completed, or immediately if the
    /// writer is gone (callers re-check [`Store::is_ready`]).
    pub async fn wait_until_ready(&self) {
        let mut rx = self.ready_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{CacheSpecImages, Image, ImageCache, ImageCacheSpec};

    fn cache(name: &str, image: &str) -> ImageCache {
        let mut ic = ImageCache::new(name, ImageCacheSpec {
            cache_spec: vec![CacheSpecImages {
                images: vec![Image {
                    name: image.into(),
                    force_full_cache: false,
                }],
                node_selector: None,
            }],
            image_pull_secrets: None,
        });
        ic.metadata.namespace = Some("kf".into());
        ic
    }

    #[test]
    fn apply_returns_previous_version() {
        let mut writer = Writer::new();
        let store = writer.as_reader();

        assert!(writer.apply(cache("foo", "a:1")).is_none());
        let old = writer.apply(cache("foo", "a:2")).unwrap();
        assert_eq!(old.spec.cache_spec[0].images[0].name, "a:1");
        assert_eq!(
            store.get("kf/foo").unwrap().spec.cache_spec[0].images[0].name,
            "a:2"
        );
    }

    #[test]
    fn relist_drops_vanished_objects() {
        let mut writer = Writer::new();
        let store = writer.as_reader();
        writer.apply(cache("foo", "a:1"));
        writer.apply(cache("bar", "b:1"));

        writer.begin_init();
        writer.apply_init(cache("foo", "a:1"));
        let vanished = writer.end_init();

        assert_eq!(vanished.len(), 1);
        assert_eq!(vanished[0].obj_key(), "kf/bar");
        assert!(store.get("kf/bar").is_none());
        assert!(store.get("kf/foo").is_some());
    }

    #[tokio::test]
    async fn readiness_latch_flips_on_first_init() {
        let mut writer = Writer::<ImageCache>::new();
        let store = writer.as_reader();
        assert!(!store.is_ready());

        writer.begin_init();
        writer.end_init();
        assert!(store.is_ready());
        store.wait_until_ready().await;
    }
}
