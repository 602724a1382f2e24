//! The object store: cached reads backed by live calls, and the informers behind them
use crate::{
    access::{self, AccessCache, AccessKey},
    backoff::BackoffEntry,
    client::{ClientError, ClusterClient, ResolveError},
    config::Config,
    handler::Watcher,
    index::{self, ItemKey, ResourceIndex},
    informer::{self, EventHandler},
    notify::{NotificationReceiver, Notifier},
    retry::{retry, Attempt},
};
use ahash::AHashMap;
use objstore_core::{
    discovery::verbs, ApiCapabilities, Coordinate, DynamicObject, GroupVersionKind, Key, KeyError, ListParams,
};
use parking_lot::{Mutex, RwLock};
use std::{collections::BTreeMap, fmt, sync::Arc};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, instrument, warn};

/// Boxed error returned by update callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("failed to resolve resource: {0}")]
    Resolution(#[from] ResolveError),

    #[error("access denied: {0}")]
    AccessDenied(AccessKey),

    #[error("remote call failed: {0}")]
    Remote(#[source] ClientError),

    #[error("resource index error: {0}")]
    Index(#[from] index::Error),

    #[error("informer error: {0}")]
    Informer(#[from] informer::Error),

    #[error("update rejected: {0}")]
    Update(#[source] BoxError),
}

impl From<access::Error> for Error {
    fn from(err: access::Error) -> Self {
        match err {
            access::Error::InvalidKey(err) => Error::InvalidKey(err),
            access::Error::Resolution(err) => Error::Resolution(err),
            access::Error::Denied(key) => Error::AccessDenied(key),
            access::Error::Check(err) => Error::Remote(err),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

type UpdateCallback = Box<dyn Fn(&ClusterClient) + Send + Sync>;

/// Everything tied to one cluster client, replaced wholesale when the client changes
struct Snapshot {
    client: ClusterClient,
    index: Arc<ResourceIndex>,
    watcher: Watcher,
    lookup: Mutex<AHashMap<GroupVersionKind, ApiCapabilities>>,
    init_locks: Mutex<AHashMap<Coordinate, Arc<tokio::sync::Mutex<()>>>>,
    backoffs: Mutex<AHashMap<Key, Arc<BackoffEntry>>>,
    notifier: Option<Notifier>,
    stop: CancellationToken,
}

impl Snapshot {
    fn new(client: &ClusterClient, config: &Config, notifier: Option<Notifier>, tracker: &TaskTracker) -> Self {
        let index = Arc::new(ResourceIndex::new());
        let watcher = Watcher::new(
            client.dynamic().clone(),
            index.clone(),
            notifier.clone(),
            config.informer.clone(),
            tracker.clone(),
        );
        Self {
            client: client.clone(),
            index,
            watcher,
            lookup: Mutex::default(),
            init_locks: Mutex::default(),
            backoffs: Mutex::default(),
            notifier,
            stop: CancellationToken::new(),
        }
    }

    fn capabilities(&self, gvk: &GroupVersionKind) -> Result<ApiCapabilities, ResolveError> {
        if let Some(caps) = self.lookup.lock().get(gvk) {
            return Ok(caps.clone());
        }
        let caps = self.client.resolver().resolve(gvk)?;
        self.lookup.lock().insert(gvk.clone(), caps.clone());
        Ok(caps)
    }

    /// Capabilities of the key's resource and the coordinate holding its objects
    ///
    /// The namespace of a key is ignored for cluster scoped resources.
    fn resolve(&self, key: &Key) -> Result<(ApiCapabilities, Coordinate)> {
        let caps = self.capabilities(&key.gvk()?)?;
        let namespace = if caps.is_namespaced() { key.namespace.as_str() } else { "" };
        let coordinate = Coordinate::new(namespace, caps.resource.gvr());
        Ok((caps, coordinate))
    }

    fn init_lock(&self, coordinate: &Coordinate) -> Arc<tokio::sync::Mutex<()>> {
        self.init_locks.lock().entry(coordinate.clone()).or_default().clone()
    }

    fn backoff(&self, key: &Key, config: &Config) -> Arc<BackoffEntry> {
        self.backoffs
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(BackoffEntry::new(key.clone(), config.backoff.clone())))
            .clone()
    }

    fn forget_backoff(&self, key: &Key) {
        self.backoffs.lock().remove(key);
    }

    /// Indexed, but the informer has not delivered its first list yet
    fn is_loading(&self, coordinate: &Coordinate) -> bool {
        self.index.has_resource(coordinate) && !self.is_synced(coordinate)
    }

    fn is_synced(&self, coordinate: &Coordinate) -> bool {
        self.watcher.informer(coordinate).is_some_and(|informer| informer.is_synced())
    }

    fn shutdown(&self) {
        self.stop.cancel();
        if let Some(notifier) = &self.notifier {
            notifier.done().cancel();
        }
        self.watcher.stop();
        self.index.reset();
        self.backoffs.lock().clear();
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(notifier) = &self.notifier {
            notifier.done().cancel();
        }
    }
}

/// A read-through cache of cluster objects
///
/// The first read of a resource in a namespace is answered by a live call, after which an
/// informer keeps an index of that resource up to date and later reads are served from it.
/// Writes always go to the cluster; the index learns about them through its informer.
///
/// ```no_run
/// # async fn doc(client: objstore::ClusterClient) -> objstore::Result<()> {
/// use objstore::{core::Key, Config, ObjectStore};
/// let store = ObjectStore::new(client, Config::default()).await;
/// let (pods, loading) = store.list(&Key::new("v1", "Pod").within("default")).await?;
/// println!("{} pods, still loading: {loading}", pods.len());
/// # Ok(())
/// # }
/// ```
pub struct ObjectStore {
    current: RwLock<Arc<Snapshot>>,
    update_lock: tokio::sync::Mutex<()>,
    access: AccessCache,
    config: Config,
    notifier: Option<Notifier>,
    tracker: TaskTracker,
    on_update: Mutex<Vec<UpdateCallback>>,
}

impl ObjectStore {
    /// Create a store without change notifications
    pub async fn new(client: ClusterClient, config: Config) -> Self {
        Self::build(client, config, None).await
    }

    /// Create a store together with the receiving half of its notification mailbox
    ///
    /// The mailbox holds [`Config::notification_capacity`] notifications. Informers wait
    /// for room when it is full, until [`ObjectStore::shutdown`] is called.
    pub async fn with_notifications(client: ClusterClient, config: Config) -> (Self, NotificationReceiver) {
        let (notifier, rx) = Notifier::channel(config.notification_capacity);
        (Self::build(client, config, Some(notifier)).await, rx)
    }

    async fn build(client: ClusterClient, config: Config, notifier: Option<Notifier>) -> Self {
        let tracker = TaskTracker::new();
        let snapshot = Arc::new(Snapshot::new(&client, &config, notifier.as_ref().map(Notifier::child), &tracker));
        let store = Self {
            current: RwLock::new(snapshot.clone()),
            update_lock: tokio::sync::Mutex::new(()),
            access: AccessCache::new(&client),
            config,
            notifier,
            tracker,
            on_update: Mutex::default(),
        };
        store.prewarm(&snapshot).await;
        store
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    async fn prewarm(&self, snapshot: &Snapshot) {
        if !self.config.prewarm {
            return;
        }
        let namespaces = match snapshot.client.namespaces().names().await {
            Ok(names) => names,
            Err(err) => {
                let namespace = snapshot.client.namespaces().initial_namespace();
                warn!(error = %err, %namespace, "unable to list namespaces, prewarming the initial namespace only");
                vec![namespace]
            }
        };
        if let Err(err) = snapshot.watcher.prewarm(&namespaces) {
            debug!(error = %err, "skipped prewarming");
        }
    }

    /// Objects matching `key`, and whether the index behind them is still loading
    ///
    /// Results are ordered by namespace, then name.
    #[instrument(skip(self, key), fields(%key))]
    pub async fn list(&self, key: &Key) -> Result<(Vec<Arc<DynamicObject>>, bool)> {
        let snapshot = self.snapshot();
        self.list_in(&snapshot, key).await
    }

    async fn list_in(&self, snapshot: &Snapshot, key: &Key) -> Result<(Vec<Arc<DynamicObject>>, bool)> {
        let (caps, coordinate) = snapshot.resolve(key)?;
        self.access.has_access(key, verbs::LIST).await?;

        if !snapshot.index.has_resource(&coordinate) {
            let lock = snapshot.init_lock(&coordinate);
            let _guard = lock.lock().await;
            // Whoever held the lock before us already listed and seeded the index
            if !snapshot.index.has_resource(&coordinate) {
                let list = snapshot
                    .client
                    .dynamic()
                    .list(&caps.resource, coordinate.namespace(), &ListParams::default())
                    .await
                    .map_err(Error::Remote)?;
                let objs = list.into_iter().map(Arc::new).collect::<Vec<_>>();
                self.start_indexing(snapshot, &caps, &coordinate, &objs).await?;
                return Ok((select(key, objs), false));
            }
        }

        let loading = snapshot.is_loading(&coordinate);
        let objs = snapshot.index.list(&coordinate)?;
        Ok((select(key, objs), loading))
    }

    /// The single object named by `key`, `None` if it does not exist
    #[instrument(skip(self, key), fields(%key))]
    pub async fn get(&self, key: &Key) -> Result<Option<Arc<DynamicObject>>> {
        let name = key.name()?;
        let snapshot = self.snapshot();
        let (caps, coordinate) = snapshot.resolve(key)?;
        self.access.has_access(key, verbs::GET).await?;

        if snapshot.index.has_resource(&coordinate) {
            if let Some(obj) = find_cached(&snapshot.index, &caps, &coordinate, key, name)? {
                return Ok(Some(obj));
            }
            if snapshot.is_synced(&coordinate) {
                return Ok(None);
            }
            return self.live_get(&snapshot, &caps, &coordinate, key, name).await;
        }

        let obj = self.live_get(&snapshot, &caps, &coordinate, key, name).await?;
        let seed = obj.iter().cloned().collect::<Vec<_>>();
        self.ensure_watched(&snapshot, &caps, &coordinate, &seed).await?;
        Ok(obj)
    }

    /// Fetch one object from the cluster, throttling keys that keep failing
    async fn live_get(
        &self,
        snapshot: &Snapshot,
        caps: &ApiCapabilities,
        coordinate: &Coordinate,
        key: &Key,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>> {
        let entry = snapshot.backoff(key, &self.config);
        if entry.is_waiting() {
            debug!(%key, "live get throttled");
            return Ok(None);
        }

        let dynamic = snapshot.client.dynamic();
        let resource = &caps.resource;
        let namespace = coordinate.namespace();
        let result = retry(&self.config.retry, move || async move {
            dynamic.get(resource, namespace, name).await.map_err(|err| {
                if err.is_not_found() || err.is_forbidden() {
                    Attempt::Stop(err)
                } else {
                    Attempt::Retry(err)
                }
            })
        })
        .await;

        match result {
            Ok(obj) => {
                snapshot.forget_backoff(key);
                Ok(Some(Arc::new(obj)))
            }
            Err(err) => {
                self.throttle(snapshot, entry);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(Error::Remote(err))
                }
            }
        }
    }

    fn throttle(&self, snapshot: &Snapshot, entry: Arc<BackoffEntry>) {
        entry.set_waiting(true);
        let delay = entry.wait();
        debug!(key = %entry.key(), ?delay, "throttling live gets");
        let stop = snapshot.stop.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            entry.set_waiting(false);
        });
    }

    /// Start indexing `coordinate` if nothing does yet, seeding the index with `seed`
    async fn ensure_watched(
        &self,
        snapshot: &Snapshot,
        caps: &ApiCapabilities,
        coordinate: &Coordinate,
        seed: &[Arc<DynamicObject>],
    ) -> Result<()> {
        let lock = snapshot.init_lock(coordinate);
        let _guard = lock.lock().await;
        if snapshot.index.has_resource(coordinate) {
            return Ok(());
        }
        self.start_indexing(snapshot, caps, coordinate, seed).await
    }

    /// Initialize the index of `coordinate` with `seed` and start the informer feeding it
    ///
    /// Callers hold the init lock of the coordinate. The seed goes in before the informer
    /// exists, so its first list always supersedes it. A snapshot that was replaced in the
    /// meantime is left alone; the caller's live result stays valid.
    async fn start_indexing(
        &self,
        snapshot: &Snapshot,
        caps: &ApiCapabilities,
        coordinate: &Coordinate,
        seed: &[Arc<DynamicObject>],
    ) -> Result<()> {
        if snapshot.stop.is_cancelled() {
            debug!(%coordinate, "client replaced, not indexing");
            return Ok(());
        }
        snapshot.index.initialize(coordinate)?;
        for obj in seed {
            snapshot.index.add_shared(coordinate, obj.clone())?;
        }
        match snapshot.watcher.watch(&caps.resource, coordinate).await {
            Ok(_) => {
                debug!(%coordinate, seeded = seed.len(), "indexing");
                Ok(())
            }
            Err(err) if snapshot.stop.is_cancelled() => {
                debug!(%coordinate, error = %err, "client replaced, not indexing");
                Ok(())
            }
            Err(err) => {
                snapshot.index.remove(coordinate);
                Err(err.into())
            }
        }
    }

    /// Delete the object named by `key` in the cluster
    ///
    /// The index is not touched; it catches up through its informer. Deleting an object that
    /// does not exist succeeds.
    #[instrument(skip(self, key), fields(%key))]
    pub async fn delete(&self, key: &Key) -> Result<()> {
        let name = key.name()?;
        let snapshot = self.snapshot();
        let (caps, coordinate) = snapshot.resolve(key)?;
        self.access.has_access(key, verbs::DELETE).await?;
        match snapshot
            .client
            .dynamic()
            .delete(&caps.resource, coordinate.namespace(), name)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(Error::Remote(err)),
        }
    }

    /// Fetch the object named by `key`, apply `updater`, and write it back
    #[instrument(skip(self, key, updater), fields(%key))]
    pub async fn update<F>(&self, key: &Key, updater: F) -> Result<DynamicObject>
    where
        F: FnOnce(&mut DynamicObject) -> Result<(), BoxError> + Send,
    {
        let name = key.name()?;
        let snapshot = self.snapshot();
        let (caps, coordinate) = snapshot.resolve(key)?;
        self.access.has_access(key, verbs::UPDATE).await?;
        let dynamic = snapshot.client.dynamic();
        let namespace = coordinate.namespace();
        let mut obj = dynamic
            .get(&caps.resource, namespace, name)
            .await
            .map_err(Error::Remote)?;
        updater(&mut obj).map_err(Error::Update)?;
        dynamic
            .replace(&caps.resource, namespace, &obj)
            .await
            .map_err(Error::Remote)
    }

    /// Attach `handler` to the informer of the key's resource, starting it if needed
    #[instrument(skip(self, key, handler), fields(%key))]
    pub async fn watch(&self, key: &Key, handler: Arc<dyn EventHandler>) -> Result<()> {
        let snapshot = self.snapshot();
        let (caps, coordinate) = snapshot.resolve(key)?;
        self.access.has_access(key, verbs::WATCH).await?;
        self.ensure_watched(&snapshot, &caps, &coordinate, &[]).await?;
        snapshot.watcher.add_handler(&caps.resource, &coordinate, handler).await?;
        Ok(())
    }

    /// Stop watching the kinds in every namespace and drop their indexed objects
    #[instrument(skip(self))]
    pub fn unwatch(&self, gvks: &[GroupVersionKind]) -> Result<()> {
        let snapshot = self.snapshot();
        let gvrs = gvks
            .iter()
            .map(|gvk| Ok(snapshot.capabilities(gvk)?.resource.gvr()))
            .collect::<Result<Vec<_>>>()?;
        snapshot.watcher.unwatch(&gvrs);
        Ok(())
    }

    /// Whether the informer behind `key` has not delivered its first list yet
    ///
    /// Unwatched resources are not loading.
    pub fn is_loading(&self, key: &Key) -> Result<bool> {
        let snapshot = self.snapshot();
        let (_, coordinate) = snapshot.resolve(key)?;
        Ok(snapshot.is_loading(&coordinate))
    }

    /// Namespaces with an informer factory
    pub fn namespaces(&self) -> Vec<String> {
        self.snapshot().watcher.namespaces()
    }

    /// Wait for every informer to sync, or for `stop` to fire
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> BTreeMap<Coordinate, bool> {
        let snapshot = self.snapshot();
        snapshot.watcher.wait_for_cache_sync(stop).await
    }

    /// Run `callback` with the new client after every [`ObjectStore::update_cluster_client`]
    pub fn register_on_update<F>(&self, callback: F)
    where
        F: Fn(&ClusterClient) + Send + Sync + 'static,
    {
        self.on_update.lock().push(Box::new(callback));
    }

    /// Switch to a different cluster client
    ///
    /// Informers, indexed objects, and cached access decisions of the previous client are
    /// dropped. Reads that started before the switch finish against the previous client,
    /// without indexing anything for it.
    #[instrument(skip_all)]
    pub async fn update_cluster_client(&self, client: ClusterClient) -> Result<()> {
        let _guard = self.update_lock.lock().await;
        let notifier = self.notifier.as_ref().map(Notifier::child);
        let fresh = Arc::new(Snapshot::new(&client, &self.config, notifier, &self.tracker));
        let previous = {
            let mut current = self.current.write();
            self.access.update_client(&client);
            self.access.reset();
            std::mem::replace(&mut *current, fresh.clone())
        };
        previous.shutdown();
        self.prewarm(&fresh).await;
        for callback in self.on_update.lock().iter() {
            callback(&client);
        }
        info!("cluster client updated");
        Ok(())
    }

    /// Stop every informer and unblock pending notifications
    ///
    /// The store serves no cached reads afterwards.
    pub fn shutdown(&self) {
        self.snapshot().shutdown();
        if let Some(notifier) = &self.notifier {
            notifier.done().cancel();
        }
        self.tracker.close();
    }

    /// Background tasks still running, informers included
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        self.snapshot().shutdown();
        if let Some(notifier) = &self.notifier {
            notifier.done().cancel();
        }
    }
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ObjectStore")
            .field("coordinates", &snapshot.index.coordinates())
            .field("active_tasks", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

fn find_cached(
    index: &ResourceIndex,
    caps: &ApiCapabilities,
    coordinate: &Coordinate,
    key: &Key,
    name: &str,
) -> Result<Option<Arc<DynamicObject>>> {
    let found = match (caps.is_namespaced(), key.namespace()) {
        (true, Some(namespace)) => index.get(coordinate, &ItemKey::new(name).within(namespace))?,
        (true, None) => index.list(coordinate)?.into_iter().find(|obj| obj.name_any() == name),
        (false, _) => index.get(coordinate, &ItemKey::new(name))?,
    };
    Ok(found)
}

fn select(key: &Key, objs: Vec<Arc<DynamicObject>>) -> Vec<Arc<DynamicObject>> {
    let mut selected = objs
        .into_iter()
        .filter(|obj| {
            key.selector
                .as_ref()
                .is_none_or(|selector| selector.matches(obj.labels_map()))
        })
        .collect::<Vec<_>>();
    selected.sort_by(|a, b| (a.namespace(), a.name_any()).cmp(&(b.namespace(), b.name_any())));
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        notify::Action,
        test_utils::{
            deployment, deployments, eventually, namespace, namespace_resource, pod, pods, pods_in,
            setup_tracing, FakeCluster, RecordingHandler,
        },
        BackoffConfig, RetryConfig,
    };
    use objstore_core::{Selector, WatchEvent};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn config() -> Config {
        Config::default().retry(RetryConfig::default().delay(Duration::from_millis(10)))
    }

    async fn store(cluster: &Arc<FakeCluster>) -> ObjectStore {
        ObjectStore::new(cluster.client(), config()).await
    }

    fn names(objs: &[Arc<DynamicObject>]) -> Vec<&str> {
        objs.iter().map(|obj| obj.name_any()).collect()
    }

    fn pod_key(ns: &str) -> Key {
        Key::new("v1", "Pod").within(ns)
    }

    #[tokio::test]
    async fn first_list_is_live_then_cached() {
        let _tracing = setup_tracing();
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "b"), pod("default", "a"), pod("other", "c")]);
        let store = store(&cluster).await;

        let (objs, loading) = store.list(&pod_key("default")).await.unwrap();
        assert_eq!(names(&objs), ["a", "b"]);
        assert!(!loading);

        store.wait_for_cache_sync(&CancellationToken::new()).await;
        let lists = cluster.list_calls();
        assert_eq!(lists, 2);

        let (objs, loading) = store.list(&pod_key("default")).await.unwrap();
        assert_eq!(names(&objs), ["a", "b"]);
        assert!(!loading);
        assert_eq!(cluster.list_calls(), lists);
    }

    #[tokio::test]
    async fn list_filters_by_selector() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(
            &pods(),
            [
                pod("default", "web").labels([("app", "web")]),
                pod("default", "db").labels([("app", "db")]),
            ],
        );
        let store = store(&cluster).await;
        let key = pod_key("default").selector(Selector::parse("app in (web)").unwrap());

        let (objs, _) = store.list(&key).await.unwrap();
        assert_eq!(names(&objs), ["web"]);

        store.wait_for_cache_sync(&CancellationToken::new()).await;
        let (objs, _) = store.list(&key).await.unwrap();
        assert_eq!(names(&objs), ["web"]);
    }

    #[tokio::test]
    async fn index_follows_watch_events() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&deployments(), [deployment("default", "deploy1")]);
        let store = store(&cluster).await;
        let key = Key::new("apps/v1", "Deployment").within("default");

        store.list(&key).await.unwrap();
        store.wait_for_cache_sync(&CancellationToken::new()).await;

        let tx = cluster.watch_sender(&deployments(), Some("default"));
        let mut modified = deployment("default", "deploy1");
        modified.metadata.annotations = Some([("rev".to_string(), "2".to_string())].into());
        tx.unbounded_send(Ok(WatchEvent::Added(deployment("default", "deploy2"))))
            .unwrap();
        tx.unbounded_send(Ok(WatchEvent::Modified(modified))).unwrap();
        tx.unbounded_send(Ok(WatchEvent::Deleted(deployment("default", "deploy2"))))
            .unwrap();

        let snapshot = store.snapshot();
        let coordinate = Coordinate::new("default", deployments().gvr());
        eventually(|| {
            snapshot.index.list(&coordinate).is_ok_and(|objs| {
                objs.len() == 1 && objs[0].annotations_map().get("rev").map(String::as_str) == Some("2")
            })
        })
        .await;

        let (objs, loading) = store.list(&key).await.unwrap();
        assert_eq!(names(&objs), ["deploy1"]);
        assert!(!loading);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_reads_share_one_informer() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a"), pod("default", "b")]);
        cluster.delay_lists(Duration::from_millis(100));
        let store = Arc::new(ObjectStore::new(cluster.client(), config().prewarm(false)).await);

        let reads = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.list(&pod_key("default")).await })
        });
        for read in futures::future::join_all(reads).await {
            let (objs, _) = read.unwrap().unwrap();
            assert_eq!(names(&objs), ["a", "b"]);
        }

        let synced = store.wait_for_cache_sync(&CancellationToken::new()).await;
        assert_eq!(synced.len(), 1);
        eventually(|| store.active_tasks() == 1).await;
        assert_eq!(cluster.can_i_calls(), 1);
        // one list answering the callers, one from the informer
        assert_eq!(cluster.list_calls(), 2);
    }

    #[tokio::test]
    async fn informer_list_supersedes_the_seed() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a"), pod("default", "b")]);
        cluster.delay_lists(Duration::from_millis(50));
        let store = store(&cluster).await;

        let (objs, _) = store.list(&pod_key("default")).await.unwrap();
        assert_eq!(names(&objs), ["a", "b"]);
        // gone before the informer's own list answers
        cluster.remove(&pods(), "default", "a");

        store.wait_for_cache_sync(&CancellationToken::new()).await;
        let (objs, loading) = store.list(&pod_key("default")).await.unwrap();
        assert_eq!(names(&objs), ["b"]);
        assert!(!loading);
    }

    #[tokio::test]
    async fn reads_racing_a_client_switch_keep_their_live_result() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        let store = store(&cluster).await;
        let stale = store.snapshot();

        store.update_cluster_client(Arc::new(FakeCluster::new()).client()).await.unwrap();
        let (objs, loading) = store.list_in(&stale, &pod_key("default")).await.unwrap();
        assert_eq!(names(&objs), ["a"]);
        assert!(!loading);
        assert!(!stale.index.has_resource(&pods_in("default")));
        assert_eq!(store.active_tasks(), 0);
    }

    #[tokio::test]
    async fn stalled_subscribers_do_not_outlive_a_client_switch() {
        let first = Arc::new(FakeCluster::new());
        first.seed(&pods(), [pod("default", "a"), pod("default", "b"), pod("default", "c")]);
        let config = config().notification_capacity(1).prewarm(false);
        let (store, mut rx) = ObjectStore::with_notifications(first.client(), config).await;

        store.list(&pod_key("default")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.active_tasks(), 1);

        let second = Arc::new(FakeCluster::new());
        second.seed(&pods(), [pod("default", "new")]);
        store.update_cluster_client(second.client()).await.unwrap();
        eventually(|| store.active_tasks() == 0).await;

        // only what fit in the mailbox before the switch
        assert_eq!(rx.recv().await.map(|n| n.action), Some(Action::Store));
        assert!(rx.try_recv().is_err());

        store.list(&pod_key("default")).await.unwrap();
        assert_eq!(rx.recv().await.map(|n| n.action), Some(Action::Store));
    }

    #[tokio::test]
    async fn denied_reads_make_no_live_calls() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        cluster.deny_all();
        let store = store(&cluster).await;

        let err = store.list(&pod_key("default")).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied(ref key) if key.verb == "list"));
        let err = store.get(&pod_key("default").named("a")).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied(ref key) if key.verb == "get"));
        assert_eq!(cluster.list_calls(), 0);
        assert_eq!(cluster.get_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let cluster = Arc::new(FakeCluster::new());
        let store = store(&cluster).await;

        assert!(matches!(
            store.get(&pod_key("default")).await,
            Err(Error::InvalidKey(KeyError::MissingName))
        ));
        assert!(matches!(
            store.list(&Key::new("example.com/v1", "Widget")).await,
            Err(Error::Resolution(ResolveError::UnknownKind(_)))
        ));
        assert!(matches!(
            store.list(&Key::new("", "Pod")).await,
            Err(Error::InvalidKey(KeyError::MissingApiVersion))
        ));
    }

    #[tokio::test]
    async fn get_reads_live_then_from_index() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        let store = store(&cluster).await;
        let key = pod_key("default").named("a");

        let obj = store.get(&key).await.unwrap().unwrap();
        assert_eq!(obj.name_any(), "a");
        assert_eq!(cluster.get_calls(), 1);

        store.wait_for_cache_sync(&CancellationToken::new()).await;
        assert!(store.get(&key).await.unwrap().is_some());
        assert!(store.get(&pod_key("default").named("missing")).await.unwrap().is_none());
        assert_eq!(cluster.get_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_get_failures_are_retried() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        cluster.fail_gets(2);
        let store = store(&cluster).await;

        let obj = store.get(&pod_key("default").named("a")).await.unwrap();
        assert!(obj.is_some());
        assert_eq!(cluster.get_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_objects_are_throttled() {
        let _tracing = setup_tracing();
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_lists(usize::MAX);
        let config = config().backoff(BackoffConfig::default().jitter(0.0));
        let store = ObjectStore::new(cluster.client(), config).await;
        let key = pod_key("default").named("ghost");

        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(cluster.get_calls(), 1);

        // the informer never syncs, so reads stay live but throttled
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(cluster.get_calls(), 1);
        assert!(store.is_loading(&key).unwrap());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(cluster.get_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_gets_surface_the_error() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_gets(usize::MAX);
        let store = store(&cluster).await;

        let err = store.get(&pod_key("default").named("a")).await.unwrap_err();
        assert!(matches!(err, Error::Remote(ClientError::Transport(_))));
        assert_eq!(cluster.get_calls(), 3);
    }

    #[tokio::test]
    async fn cluster_scoped_keys_ignore_the_namespace() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&namespace_resource(), [namespace("default"), namespace("kube-system")]);
        let store = store(&cluster).await;

        let key = Key::new("v1", "Namespace").within("default");
        let (objs, _) = store.list(&key).await.unwrap();
        assert_eq!(names(&objs), ["default", "kube-system"]);

        let synced = store.wait_for_cache_sync(&CancellationToken::new()).await;
        assert!(synced.contains_key(&Coordinate::new("", namespace_resource().gvr())));
        let found = store.get(&key.named("kube-system")).await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn delete_goes_to_the_cluster() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        let store = store(&cluster).await;
        let key = pod_key("default").named("a");

        store.delete(&key).await.unwrap();
        assert!(cluster.object(&pods(), "default", "a").is_none());
        store.delete(&key).await.unwrap();
        assert_eq!(cluster.delete_calls(), 2);
    }

    #[tokio::test]
    async fn update_applies_the_updater() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        let store = store(&cluster).await;
        let key = pod_key("default").named("a");

        let updated = store
            .update(&key, |obj| {
                obj.metadata.labels = Some([("tier".to_string(), "gold".to_string())].into());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.labels_map().get("tier").map(String::as_str), Some("gold"));
        let stored = cluster.object(&pods(), "default", "a").unwrap();
        assert_eq!(stored.labels_map().get("tier").map(String::as_str), Some("gold"));

        let err = store.update(&key, |_| Err("nope".into())).await.unwrap_err();
        assert!(matches!(err, Error::Update(_)));
        assert_eq!(cluster.replace_calls(), 1);

        let missing = store.update(&pod_key("default").named("b"), |_| Ok(())).await;
        assert!(matches!(missing, Err(Error::Remote(ref err)) if err.is_not_found()));
    }

    #[tokio::test]
    async fn watch_attaches_handlers() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        let store = store(&cluster).await;
        let handler = Arc::new(RecordingHandler::default());

        store.watch(&pod_key("default"), handler.clone()).await.unwrap();
        handler.wait_for(2).await;
        assert_eq!(handler.events(), ["add default/a", "resync 1"]);

        let (objs, loading) = store.list(&pod_key("default")).await.unwrap();
        assert_eq!(names(&objs), ["a"]);
        assert!(!loading);
        assert_eq!(cluster.list_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loading_until_the_informer_lists() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        cluster.fail_lists(usize::MAX);
        let store = store(&cluster).await;
        let key = pod_key("default");
        assert!(!store.is_loading(&key).unwrap());

        store.watch(&key, Arc::new(RecordingHandler::default())).await.unwrap();
        assert!(store.is_loading(&key).unwrap());
        let (objs, loading) = store.list(&key).await.unwrap();
        assert!(objs.is_empty());
        assert!(loading);

        cluster.fail_lists(0);
        eventually(|| !store.is_loading(&key).unwrap()).await;
        let (objs, loading) = store.list(&key).await.unwrap();
        assert_eq!(names(&objs), ["a"]);
        assert!(!loading);
    }

    #[tokio::test]
    async fn unwatch_drops_the_index() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        let store = store(&cluster).await;
        let key = pod_key("default");

        store.list(&key).await.unwrap();
        store.wait_for_cache_sync(&CancellationToken::new()).await;
        store.unwatch(&[pods().gvk()]).unwrap();
        assert!(!store.is_loading(&key).unwrap());
        eventually(|| store.active_tasks() == 0).await;

        let lists = cluster.list_calls();
        store.list(&key).await.unwrap();
        assert_eq!(cluster.list_calls(), lists + 1);
    }

    #[tokio::test]
    async fn prewarm_creates_factories() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.set_namespaces(&["default", "kube-system"]);
        let store = store(&cluster).await;
        assert_eq!(store.namespaces(), ["", "default", "kube-system"]);

        let cluster = Arc::new(FakeCluster::new());
        cluster.fail_namespace_listing();
        let store = ObjectStore::new(cluster.client(), config()).await;
        assert_eq!(store.namespaces(), ["", "default"]);

        let store = ObjectStore::new(cluster.client(), config().prewarm(false)).await;
        assert!(store.namespaces().is_empty());
    }

    #[tokio::test]
    async fn notifications_follow_the_index() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.seed(&pods(), [pod("default", "a")]);
        let (store, mut rx) = ObjectStore::with_notifications(cluster.client(), config()).await;

        store.list(&pod_key("default")).await.unwrap();
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.key, pod_key("default"));
        assert_eq!(notification.action, Action::Store);

        store.shutdown();
        assert!(store.snapshot().watcher.is_stopped());
    }

    #[tokio::test]
    async fn switching_clients_discards_everything() {
        let _tracing = setup_tracing();
        let first = Arc::new(FakeCluster::new());
        first.seed(&pods(), [pod("default", "old")]);
        let store = store(&first).await;
        let calls = Arc::new(AtomicUsize::new(0));
        store.register_on_update({
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        store.list(&pod_key("default")).await.unwrap();
        store.wait_for_cache_sync(&CancellationToken::new()).await;
        eventually(|| store.active_tasks() == 1).await;

        let second = Arc::new(FakeCluster::new());
        second.seed(&pods(), [pod("default", "new")]);
        second.deny_all();
        store.update_cluster_client(second.client()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        eventually(|| store.active_tasks() == 0).await;
        assert!(!store.is_loading(&pod_key("default")).unwrap());

        // cached allow decisions of the first client are gone
        let err = store.list(&pod_key("default")).await.unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));

        let third = Arc::new(FakeCluster::new());
        third.seed(&pods(), [pod("default", "new")]);
        store.update_cluster_client(third.client()).await.unwrap();
        let (objs, _) = store.list(&pod_key("default")).await.unwrap();
        assert_eq!(names(&objs), ["new"]);
        assert_eq!(first.list_calls(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
