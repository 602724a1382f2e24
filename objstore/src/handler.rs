//! Keeping the resource index in step with informers
use crate::{
    client::DynamicClient,
    index::ResourceIndex,
    informer::{self, EventHandler, Informer, InformerConfig, InformerFactory},
    notify::{Action, Notification, Notifier},
};
use ahash::AHashMap;
use async_trait::async_trait;
use futures::future;
use objstore_core::{ApiResource, Coordinate, DynamicObject, GroupVersionResource, Key};
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

/// Writes informer events into the [`ResourceIndex`] and notifies subscribers
pub struct IndexHandler {
    coordinate: Coordinate,
    key: Key,
    index: Arc<ResourceIndex>,
    notifier: Option<Notifier>,
}

impl IndexHandler {
    pub fn new(
        resource: &ApiResource,
        coordinate: Coordinate,
        index: Arc<ResourceIndex>,
        notifier: Option<Notifier>,
    ) -> Self {
        let key = Key::new(&resource.api_version, &resource.kind).within(&coordinate.namespace);
        Self {
            coordinate,
            key,
            index,
            notifier,
        }
    }

    async fn notify(&self, action: Action) {
        if let Some(notifier) = &self.notifier {
            notifier
                .send(Notification {
                    key: self.key.clone(),
                    action,
                })
                .await;
        }
    }

    fn store(&self, obj: Arc<DynamicObject>) -> bool {
        match self.index.add_shared(&self.coordinate, obj) {
            Ok(()) => true,
            // The coordinate was unwatched or reset while the event was in flight
            Err(err) => {
                debug!(coordinate = %self.coordinate, error = %err, "dropping event");
                false
            }
        }
    }
}

#[async_trait]
impl EventHandler for IndexHandler {
    async fn on_add(&self, obj: Arc<DynamicObject>) {
        if self.store(obj) {
            self.notify(Action::Store).await;
        }
    }

    async fn on_update(&self, _old: Arc<DynamicObject>, new: Arc<DynamicObject>) {
        if self.store(new) {
            self.notify(Action::Update).await;
        }
    }

    async fn on_delete(&self, obj: Arc<DynamicObject>) {
        match self.index.delete(&self.coordinate, &obj) {
            Ok(()) => self.notify(Action::Delete).await,
            Err(err) => debug!(coordinate = %self.coordinate, error = %err, "dropping event"),
        }
    }

    async fn on_resync(&self, objs: &[Arc<DynamicObject>]) {
        if let Err(err) = self.index.replace(&self.coordinate, objs) {
            debug!(coordinate = %self.coordinate, error = %err, "dropping resync");
        }
    }
}

/// Owns the informer factories of one cluster client
///
/// Each watched coordinate gets exactly one [`IndexHandler`]; further handlers can be
/// attached with [`Watcher::add_handler`].
pub struct Watcher {
    client: Arc<dyn DynamicClient>,
    index: Arc<ResourceIndex>,
    notifier: Option<Notifier>,
    config: InformerConfig,
    tracker: TaskTracker,
    factories: Mutex<AHashMap<String, Arc<InformerFactory>>>,
    watched: Mutex<AHashMap<Coordinate, Informer>>,
    stop: CancellationToken,
}

impl Watcher {
    pub fn new(
        client: Arc<dyn DynamicClient>,
        index: Arc<ResourceIndex>,
        notifier: Option<Notifier>,
        config: InformerConfig,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            client,
            index,
            notifier,
            config,
            tracker,
            factories: Mutex::default(),
            watched: Mutex::default(),
            stop: CancellationToken::new(),
        }
    }

    /// The factory of a namespace, created if absent
    pub fn factory(&self, namespace: &str) -> Result<Arc<InformerFactory>, informer::Error> {
        let mut factories = self.factories.lock();
        if self.stop.is_cancelled() {
            return Err(informer::Error::FactoryStopped(namespace.to_string()));
        }
        let factory = factories.entry(namespace.to_string()).or_insert_with(|| {
            debug!(namespace, "creating informer factory");
            Arc::new(InformerFactory::new(
                namespace,
                self.client.clone(),
                self.config.clone(),
                self.tracker.clone(),
            ))
        });
        Ok(factory.clone())
    }

    /// Create factories for the namespaces and the cluster scope ahead of use
    pub fn prewarm(&self, namespaces: &[String]) -> Result<(), informer::Error> {
        self.factory("")?;
        for namespace in namespaces {
            self.factory(namespace)?;
        }
        Ok(())
    }

    /// Namespaces with a factory
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces = self.factories.lock().keys().cloned().collect::<Vec<_>>();
        namespaces.sort();
        namespaces
    }

    /// Make sure an informer feeds the index for `coordinate`
    pub async fn watch(&self, resource: &ApiResource, coordinate: &Coordinate) -> Result<Informer, informer::Error> {
        let informer = self.factory(&coordinate.namespace)?.for_resource(resource)?;
        let first = {
            let mut watched = self.watched.lock();
            match watched.get(coordinate) {
                Some(existing) if existing.same_as(&informer) => false,
                _ => {
                    watched.insert(coordinate.clone(), informer.clone());
                    true
                }
            }
        };
        if first {
            debug!(%coordinate, "watching");
            let handler = IndexHandler::new(
                resource,
                coordinate.clone(),
                self.index.clone(),
                self.notifier.clone(),
            );
            informer.add_handler(Arc::new(handler)).await;
        }
        Ok(informer)
    }

    /// Attach an extra handler to the informer of `coordinate`
    pub async fn add_handler(
        &self,
        resource: &ApiResource,
        coordinate: &Coordinate,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), informer::Error> {
        let informer = self.watch(resource, coordinate).await?;
        informer.add_handler(handler).await;
        Ok(())
    }

    /// The informer of a watched coordinate
    pub fn informer(&self, coordinate: &Coordinate) -> Option<Informer> {
        self.watched.lock().get(coordinate).cloned()
    }

    /// Stop watching resources in every namespace and forget their objects
    pub fn unwatch(&self, gvrs: &[GroupVersionResource]) {
        let factories = self.factories.lock().values().cloned().collect::<Vec<_>>();
        for gvr in gvrs {
            for factory in &factories {
                factory.delete(gvr);
            }
        }
        let unwatched = {
            let mut watched = self.watched.lock();
            let unwatched = watched
                .keys()
                .filter(|c| gvrs.contains(&c.gvr))
                .cloned()
                .collect::<Vec<_>>();
            for coordinate in &unwatched {
                watched.remove(coordinate);
            }
            unwatched
        };
        for coordinate in unwatched {
            debug!(%coordinate, "unwatched");
            self.index.remove(&coordinate);
        }
    }

    /// Wait until every informer of every factory synced, or until `stop` fires
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> BTreeMap<Coordinate, bool> {
        let factories = self.factories.lock().values().cloned().collect::<Vec<_>>();
        let synced = future::join_all(factories.iter().map(|factory| factory.wait_for_cache_sync(stop))).await;
        factories
            .iter()
            .zip(synced)
            .flat_map(|(factory, synced)| {
                synced
                    .into_iter()
                    .map(|(gvr, synced)| (Coordinate::new(factory.namespace(), gvr), synced))
            })
            .collect()
    }

    /// Stop every factory and informer; the watcher refuses new work afterwards
    pub fn stop(&self) {
        let factories = {
            let mut factories = self.factories.lock();
            self.stop.cancel();
            std::mem::take(&mut *factories)
        };
        for factory in factories.values() {
            factory.shutdown();
        }
        self.watched.lock().clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}
