//! Reflector-backed cache feeding a work queue

use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use kube::{
    runtime::{
        reflector::{self, store::Writer, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RateLimiter, WorkQueue};
use crate::error::{Error, Result};

/// Build the work queue key of an object: `namespace/name`, or `name` for
/// cluster-scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> String {
    let name = obj.meta().name.clone().unwrap_or_default();
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name,
    }
}

/// Split a work queue key into `(namespace, name)`
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !name.is_empty() => Ok((Some(*ns).filter(|ns| !ns.is_empty()), *name)),
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// Turns watch events into work queue keys.
///
/// A relist (on start, after a `410 Gone` or a reconnect) swaps the cache
/// wholesale and reports no deletions, so the keys cached before `Init` that
/// the relist did not list again are emitted at `InitDone`.
#[derive(Default)]
pub struct KeyFeed {
    relist: Option<Relist>,
}

struct Relist {
    cached: HashSet<String>,
    listed: HashSet<String>,
}

impl KeyFeed {
    /// Keys to enqueue for `event`. `cache` is the store the reflector has
    /// already applied `event` to.
    pub fn keys<K>(&mut self, event: &watcher::Event<K>, cache: &Store<K>) -> Vec<String>
    where
        K: Resource + Clone + 'static,
        K::DynamicType: Eq + Hash + Clone,
    {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::Delete(obj) => vec![object_key(obj)],
            watcher::Event::Init => {
                let cached = cache.state().iter().map(|obj| object_key(&**obj)).collect();
                self.relist = Some(Relist {
                    cached,
                    listed: HashSet::new(),
                });
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = object_key(obj);
                if let Some(relist) = self.relist.as_mut() {
                    relist.listed.insert(key.clone());
                }
                vec![key]
            }
            watcher::Event::InitDone => match self.relist.take() {
                Some(relist) => {
                    let mut vanished: Vec<String> =
                        relist.cached.difference(&relist.listed).cloned().collect();
                    vanished.sort();
                    vanished
                }
                None => Vec::new(),
            },
        }
    }
}

/// One watched resource kind: a local mirror kept current by a watch stream,
/// and a work queue receiving the key of every added, modified or deleted
/// object.
///
/// Deletions carry the last known object, so a key is produced even though
/// the object is already gone from the cache by the time it is processed.
/// Deletions missed while the watch was down surface at the next relist
/// through [`KeyFeed`].
pub struct WatchedCollection<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    kind: &'static str,
    api: Api<K>,
    watcher_config: watcher::Config,
    store: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    feed: Mutex<KeyFeed>,
    queue: WorkQueue,
}

impl<K> WatchedCollection<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(
        kind: &'static str,
        api: Api<K>,
        watcher_config: watcher::Config,
        limiter: RateLimiter,
    ) -> Self {
        let (store, writer) = reflector::store();
        Self {
            kind,
            api,
            watcher_config,
            store,
            writer: Mutex::new(Some(writer)),
            feed: Mutex::new(KeyFeed::default()),
            queue: WorkQueue::new(limiter),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Read-only view of the local mirror
    pub fn cache(&self) -> &Store<K> {
        &self.store
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Look up an object by work queue key
    pub fn get(&self, key: &str) -> Result<Option<Arc<K>>> {
        let (namespace, name) = split_key(key)?;
        let mut obj_ref = ObjectRef::new(name);
        if let Some(ns) = namespace {
            obj_ref = obj_ref.within(ns);
        }
        Ok(self.store.get(&obj_ref))
    }

    /// All cached objects in `namespace`
    pub fn list_namespace(&self, namespace: &str) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| obj.namespace().as_deref() == Some(namespace))
            .collect()
    }

    /// Wait for the initial list to land in the cache
    pub async fn wait_until_synced(&self) -> Result<()> {
        self.store
            .wait_until_ready()
            .await
            .map_err(|e| Error::config(format!("{} cache never synced: {}", self.kind, e)))
    }

    /// Pump the watch stream into the cache and the queue until `shutdown`
    /// fires, then shut the queue down.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let writer = self
            .writer
            .lock()
            .ok()
            .and_then(|mut writer| writer.take())
            .ok_or_else(|| Error::config(format!("{} collection is already running", self.kind)))?;

        info!(kind = self.kind, "Starting watch");

        let stream = reflector::reflector(
            writer,
            watcher(self.api.clone(), self.watcher_config.clone()).default_backoff(),
        );
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_event(&event),
                    Some(Err(e)) => warn!(kind = self.kind, error = %e, "Watch stream error"),
                    None => break,
                },
            }
        }

        info!(kind = self.kind, "Stopping watch");
        self.queue.shutdown();
        Ok(())
    }

    fn handle_event(&self, event: &watcher::Event<K>) {
        let keys = self
            .feed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys(event, &self.store);
        for key in keys {
            debug!(kind = self.kind, key = %key, "Enqueue");
            self.queue.add(key);
        }
    }
}
