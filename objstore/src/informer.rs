//! Long-lived watchers per resource, and the per-namespace factories owning them
use crate::{
    backoff::{BackoffConfig, ResettableBackoff, ResettableBackoffWrapper},
    client::DynamicClient,
    index::ItemKey,
    watcher::{self, watcher, Event},
};
use ahash::AHashMap;
use async_trait::async_trait;
use backon::ExponentialBuilder;
use futures::{future, Stream, StreamExt};
use objstore_core::{ApiResource, Coordinate, DynamicObject, GroupVersionResource};
use parking_lot::Mutex;
use std::{collections::BTreeMap, fmt, pin::pin, sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("informer factory for namespace {0:?} is stopped")]
    FactoryStopped(String),
}

/// Callbacks invoked by an [`Informer`] for every change it observes
///
/// Callbacks of one informer are invoked one at a time, in the order the changes arrived.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_add(&self, obj: Arc<DynamicObject>);

    async fn on_update(&self, old: Arc<DynamicObject>, new: Arc<DynamicObject>);

    async fn on_delete(&self, obj: Arc<DynamicObject>);

    /// Called after every full relist with everything that currently exists
    async fn on_resync(&self, _objs: &[Arc<DynamicObject>]) {}
}

/// Configuration of the informers created by a factory
#[derive(Clone, Debug, PartialEq)]
pub struct InformerConfig {
    /// Parameters of the underlying list and watch calls
    pub watcher: watcher::Config,
    /// Delay between reconnect attempts after watch errors, reset on the next event
    pub backoff: BackoffConfig,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            watcher: watcher::Config::default(),
            backoff: BackoffConfig {
                initial: Duration::from_millis(800),
                factor: 2.0,
                jitter: 0.1,
                max_steps: usize::MAX,
                cap: Duration::from_secs(30),
            },
        }
    }
}

impl InformerConfig {
    #[must_use]
    pub fn watcher(mut self, watcher: watcher::Config) -> Self {
        self.watcher = watcher;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Default)]
struct Dispatch {
    handlers: Vec<Arc<dyn EventHandler>>,
    known: AHashMap<ItemKey, Arc<DynamicObject>>,
}

struct Shared {
    coordinate: Coordinate,
    dispatch: tokio::sync::Mutex<Dispatch>,
    // Cancelled once the first listing has been dispatched
    synced: CancellationToken,
    stop: CancellationToken,
}

/// A running watcher for one coordinate
///
/// Cloning produces another handle to the same informer.
#[derive(Clone)]
pub struct Informer {
    shared: Arc<Shared>,
}

impl fmt::Debug for Informer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Informer")
            .field("coordinate", &self.shared.coordinate)
            .field("synced", &self.is_synced())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Informer {
    fn start<S>(
        coordinate: Coordinate,
        events: S,
        backoff: BackoffConfig,
        stop: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self
    where
        S: Stream<Item = watcher::Result<Event<DynamicObject>>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            coordinate,
            dispatch: tokio::sync::Mutex::default(),
            synced: CancellationToken::new(),
            stop,
        });
        tracker.spawn(run(shared.clone(), events, backoff));
        Self { shared }
    }

    pub fn coordinate(&self) -> &Coordinate {
        &self.shared.coordinate
    }

    /// Register a handler
    ///
    /// Objects the informer already knows are replayed to the handler as additions
    /// before it sees any newer change.
    pub async fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut dispatch = self.shared.dispatch.lock().await;
        for obj in dispatch.known.values() {
            handler.on_add(obj.clone()).await;
        }
        dispatch.handlers.push(handler);
    }

    /// Whether the first full listing has been dispatched
    pub fn is_synced(&self) -> bool {
        self.shared.synced.is_cancelled()
    }

    /// Resolves once the informer is synced
    pub async fn synced(&self) {
        self.shared.synced.cancelled().await
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Stop the background task, handlers see no further events
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    /// Whether both handles refer to the same informer
    pub fn same_as(&self, other: &Informer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

async fn run<S>(shared: Arc<Shared>, events: S, config: BackoffConfig)
where
    S: Stream<Item = watcher::Result<Event<DynamicObject>>> + Send,
{
    let coordinate = &shared.coordinate;
    let mut events = pin!(events);
    let mut backoff = ResettableBackoffWrapper::<ExponentialBuilder>::new(config.builder());
    debug!(%coordinate, "informer started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            next = events.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                backoff.reset();
                // A handler stuck on a slow consumer must not keep a stopped informer alive
                tokio::select! {
                    biased;
                    _ = shared.stop.cancelled() => break,
                    _ = dispatch(&shared, event) => {}
                }
            }
            Some(Err(err)) => {
                let delay = backoff.next().map_or(config.cap, |d| config.jittered(d));
                warn!(%coordinate, error = %err, ?delay, "watch failed, backing off");
                tokio::select! {
                    _ = shared.stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => break,
        }
    }
    debug!(%coordinate, "informer stopped");
}

async fn dispatch(shared: &Shared, event: Event<DynamicObject>) {
    let mut dispatch = shared.dispatch.lock().await;
    let Dispatch { handlers, known } = &mut *dispatch;
    match event {
        Event::Applied(obj) => {
            let obj = Arc::new(obj);
            let old = known.insert(ItemKey::from_obj(&obj), obj.clone());
            for handler in handlers.iter() {
                match &old {
                    Some(old) => handler.on_update(old.clone(), obj.clone()).await,
                    None => handler.on_add(obj.clone()).await,
                }
            }
        }
        Event::Deleted(obj) => {
            let obj = known
                .remove(&ItemKey::from_obj(&obj))
                .unwrap_or_else(|| Arc::new(obj));
            for handler in handlers.iter() {
                handler.on_delete(obj.clone()).await;
            }
        }
        Event::Restarted(objs) => {
            let mut previous = std::mem::take(known);
            let objs = objs.into_iter().map(Arc::new).collect::<Vec<_>>();
            for obj in &objs {
                let key = ItemKey::from_obj(obj);
                let old = previous.remove(&key);
                known.insert(key, obj.clone());
                for handler in handlers.iter() {
                    match &old {
                        Some(old) => handler.on_update(old.clone(), obj.clone()).await,
                        None => handler.on_add(obj.clone()).await,
                    }
                }
            }
            // Whatever was not relisted got deleted while we were not watching
            for gone in previous.into_values() {
                for handler in handlers.iter() {
                    handler.on_delete(gone.clone()).await;
                }
            }
            for handler in handlers.iter() {
                handler.on_resync(&objs).await;
            }
            if !shared.synced.is_cancelled() {
                debug!(coordinate = %shared.coordinate, objects = objs.len(), "informer synced");
                shared.synced.cancel();
            }
        }
    }
}

/// Creates and owns the informers of one namespace
///
/// At most one informer exists per resource; it runs until it is deleted or the
/// factory is shut down.
pub struct InformerFactory {
    namespace: String,
    client: Arc<dyn DynamicClient>,
    config: InformerConfig,
    informers: Mutex<AHashMap<GroupVersionResource, Informer>>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl InformerFactory {
    /// A factory for `namespace`, the empty namespace being the cluster scope
    pub fn new(namespace: &str, client: Arc<dyn DynamicClient>, config: InformerConfig, tracker: TaskTracker) -> Self {
        Self {
            namespace: namespace.to_string(),
            client,
            config,
            informers: Mutex::default(),
            stop: CancellationToken::new(),
            tracker,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The running informer for a resource, started if absent
    pub fn for_resource(&self, resource: &ApiResource) -> Result<Informer, Error> {
        let mut informers = self.informers.lock();
        if self.stop.is_cancelled() {
            return Err(Error::FactoryStopped(self.namespace.clone()));
        }
        let informer = informers.entry(resource.gvr()).or_insert_with(|| {
            let coordinate = Coordinate::new(&self.namespace, resource.gvr());
            debug!(%coordinate, "starting informer");
            let namespace = (!self.namespace.is_empty()).then(|| self.namespace.clone());
            let events = watcher(self.client.clone(), resource.clone(), namespace, &self.config.watcher);
            Informer::start(
                coordinate,
                events,
                self.config.backoff.clone(),
                self.stop.child_token(),
                &self.tracker,
            )
        });
        Ok(informer.clone())
    }

    /// The informer for a resource, if one is running
    pub fn get(&self, gvr: &GroupVersionResource) -> Option<Informer> {
        self.informers.lock().get(gvr).cloned()
    }

    /// Stop the informer of a resource and forget it
    ///
    /// A later [`InformerFactory::for_resource`] starts a fresh informer.
    pub fn delete(&self, gvr: &GroupVersionResource) -> bool {
        match self.informers.lock().remove(gvr) {
            Some(informer) => {
                debug!(coordinate = %informer.coordinate(), "stopping informer");
                informer.stop();
                true
            }
            None => false,
        }
    }

    /// Wait until every registered informer has synced, or until `stop` fires
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> BTreeMap<GroupVersionResource, bool> {
        let informers = self
            .informers
            .lock()
            .iter()
            .map(|(gvr, informer)| (gvr.clone(), informer.clone()))
            .collect::<Vec<_>>();
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = future::join_all(informers.iter().map(|(_, informer)| informer.synced())) => {}
        }
        informers
            .into_iter()
            .map(|(gvr, informer)| (gvr, informer.is_synced()))
            .collect()
    }

    /// Stop every informer, the factory refuses new ones afterwards
    pub fn shutdown(&self) {
        let mut informers = self.informers.lock();
        self.stop.cancel();
        debug!(namespace = %self.namespace, informers = informers.len(), "shutting down informer factory");
        informers.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for InformerFactory {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
