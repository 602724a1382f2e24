use crate::{
    access::AccessKey,
    client::{
        Authorizer, ClientError, ClusterClient, DynamicClient, NamespaceClient, ResolveError, ResourceResolver,
        WatchStream,
    },
    index::ItemKey,
    informer::EventHandler,
};
use ahash::AHashMap;
use async_trait::async_trait;
use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    StreamExt,
};
use objstore_core::{
    ApiCapabilities, ApiResource, Coordinate, DynamicObject, ErrorResponse, GroupVersionKind,
    GroupVersionResource, ListParams, ObjectList, Scope, WatchEvent,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    sync::Arc,
    time::Duration,
};

type WatchItem = Result<WatchEvent<DynamicObject>, ClientError>;
type WatchKey = (GroupVersionResource, Option<String>);

pub fn pods() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Pod"), "pods")
}

pub fn deployments() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("apps", "v1", "Deployment"), "deployments")
}

pub fn namespace_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Namespace"), "namespaces")
}

pub fn pods_in(ns: &str) -> Coordinate {
    Coordinate::new(ns, pods().gvr())
}

pub fn pod(ns: &str, name: &str) -> DynamicObject {
    DynamicObject::new(name, &pods()).within(ns)
}

pub fn deployment(ns: &str, name: &str) -> DynamicObject {
    DynamicObject::new(name, &deployments()).within(ns)
}

pub fn namespace(name: &str) -> DynamicObject {
    DynamicObject::new(name, &namespace_resource())
}

fn served() -> Vec<ApiCapabilities> {
    vec![
        ApiCapabilities::new(pods(), Scope::Namespaced),
        ApiCapabilities::new(deployments(), Scope::Namespaced),
        ApiCapabilities::new(namespace_resource(), Scope::Cluster),
    ]
}

pub fn setup_tracing() -> tracing::dispatcher::DefaultGuard {
    use tracing_subscriber::util::SubscriberInitExt;
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .finish()
        .set_default()
}

/// Resolve `pred` to true within a few seconds, or panic
pub async fn eventually(mut pred: impl FnMut() -> bool) {
    let wait = async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
        panic!("condition not reached in time");
    }
}

async fn within_timeout<F: Future>(fut: F) -> F::Output {
    match tokio::time::timeout(Duration::from_secs(5), fut).await {
        Ok(out) => out,
        Err(_) => panic!("timed out"),
    }
}

/// The feeding side of a watch and the streams not yet handed out
#[derive(Default)]
struct WatchChannel {
    tx: Option<UnboundedSender<WatchItem>>,
    pending: VecDeque<UnboundedReceiver<WatchItem>>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<GroupVersionResource, BTreeMap<(String, String), DynamicObject>>,
    watches: AHashMap<WatchKey, WatchChannel>,
    namespaces: Vec<String>,
    fail_names: bool,
    deny: bool,
    failing_lists: usize,
    failing_gets: usize,
    list_delay: Duration,
    list_calls: usize,
    get_calls: usize,
    watch_calls: usize,
    delete_calls: usize,
    replace_calls: usize,
    can_i_calls: usize,
    watch_versions: Vec<String>,
}

fn take_failure(remaining: &mut usize) -> bool {
    match *remaining {
        0 => false,
        usize::MAX => true,
        _ => {
            *remaining -= 1;
            true
        }
    }
}

/// An in-memory cluster implementing every collaborator
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(self: &Arc<Self>) -> ClusterClient {
        ClusterClient::from_cluster(self.clone())
    }

    pub fn seed(&self, resource: &ApiResource, objs: impl IntoIterator<Item = DynamicObject>) {
        let mut state = self.state.lock();
        let objects = state.objects.entry(resource.gvr()).or_default();
        for obj in objs {
            let key = (obj.namespace().unwrap_or_default().to_string(), obj.name_any().to_string());
            objects.insert(key, obj);
        }
    }

    pub fn remove(&self, resource: &ApiResource, ns: &str, name: &str) {
        if let Some(objects) = self.state.lock().objects.get_mut(&resource.gvr()) {
            objects.remove(&(ns.to_string(), name.to_string()));
        }
    }

    pub fn set_namespaces(&self, namespaces: &[&str]) {
        self.state.lock().namespaces = namespaces.iter().map(|ns| ns.to_string()).collect();
    }

    pub fn fail_namespace_listing(&self) {
        self.state.lock().fail_names = true;
    }

    pub fn deny_all(&self) {
        self.state.lock().deny = true;
    }

    /// Fail the next `n` list calls, `usize::MAX` fails them all
    pub fn fail_lists(&self, n: usize) {
        self.state.lock().failing_lists = n;
    }

    /// Fail the next `n` get calls with a transport error
    pub fn fail_gets(&self, n: usize) {
        self.state.lock().failing_gets = n;
    }

    /// Make every list call take `delay` before answering
    pub fn delay_lists(&self, delay: Duration) {
        self.state.lock().list_delay = delay;
    }

    /// Sender feeding the current watch stream of a resource
    ///
    /// Without an open stream a new one is queued for the next watch call.
    pub fn watch_sender(&self, resource: &ApiResource, ns: Option<&str>) -> UnboundedSender<WatchItem> {
        let mut state = self.state.lock();
        let channel = state.watches.entry((resource.gvr(), ns.map(String::from))).or_default();
        if let Some(tx) = &channel.tx {
            return tx.clone();
        }
        let (tx, rx) = unbounded();
        channel.pending.push_back(rx);
        channel.tx = Some(tx.clone());
        tx
    }

    /// Drop the stored sender, ending the stream once every other sender is gone
    pub fn close_watch(&self, resource: &ApiResource, ns: Option<&str>) {
        if let Some(channel) = self.state.lock().watches.get_mut(&(resource.gvr(), ns.map(String::from))) {
            channel.tx = None;
        }
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn get_calls(&self) -> usize {
        self.state.lock().get_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().watch_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.state.lock().delete_calls
    }

    pub fn replace_calls(&self) -> usize {
        self.state.lock().replace_calls
    }

    pub fn can_i_calls(&self) -> usize {
        self.state.lock().can_i_calls
    }

    pub fn watch_versions(&self) -> Vec<String> {
        self.state.lock().watch_versions.clone()
    }

    pub fn object(&self, resource: &ApiResource, ns: &str, name: &str) -> Option<DynamicObject> {
        self.state
            .lock()
            .objects
            .get(&resource.gvr())
            .and_then(|objects| objects.get(&(ns.to_string(), name.to_string())))
            .cloned()
    }
}

#[async_trait]
impl DynamicClient for FakeCluster {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        _params: &ListParams,
    ) -> Result<ObjectList<DynamicObject>, ClientError> {
        let delay = {
            let mut state = self.state.lock();
            state.list_calls += 1;
            state.list_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if take_failure(&mut state.failing_lists) {
            return Err(ClientError::Transport("connection refused".into()));
        }
        let items = state
            .objects
            .get(&resource.gvr())
            .into_iter()
            .flat_map(|objects| objects.iter())
            .filter(|((ns, _), _)| namespace.is_none_or(|wanted| wanted == ns))
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(ObjectList::new("1", items))
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClientError> {
        let mut state = self.state.lock();
        state.get_calls += 1;
        if take_failure(&mut state.failing_gets) {
            return Err(ClientError::Transport("connection reset".into()));
        }
        state
            .objects
            .get(&resource.gvr())
            .and_then(|objects| {
                objects
                    .iter()
                    .find(|((ns, n), _)| n == name && namespace.is_none_or(|wanted| wanted == ns))
            })
            .map(|(_, obj)| obj.clone())
            .ok_or_else(|| ErrorResponse::not_found(&resource.plural, name).into())
    }

    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state.delete_calls += 1;
        let key = (namespace.unwrap_or_default().to_string(), name.to_string());
        state
            .objects
            .get_mut(&resource.gvr())
            .and_then(|objects| objects.remove(&key))
            .map(|_| ())
            .ok_or_else(|| ErrorResponse::not_found(&resource.plural, name).into())
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        _namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        self.state.lock().replace_calls += 1;
        self.seed(resource, [obj.clone()]);
        Ok(obj.clone())
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        _params: &ListParams,
        resource_version: &str,
    ) -> Result<WatchStream, ClientError> {
        let mut state = self.state.lock();
        state.watch_calls += 1;
        state.watch_versions.push(resource_version.to_string());
        let channel = state
            .watches
            .entry((resource.gvr(), namespace.map(String::from)))
            .or_default();
        let rx = match channel.pending.pop_front() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = unbounded();
                channel.tx = Some(tx);
                rx
            }
        };
        Ok(rx.boxed())
    }
}

impl ResourceResolver for FakeCluster {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiCapabilities, ResolveError> {
        served()
            .into_iter()
            .find(|caps| caps.resource.gvk() == *gvk)
            .ok_or_else(|| ResolveError::UnknownKind(gvk.clone()))
    }

    fn resolve_group_kind(&self, group: &str, kind: &str) -> Result<ApiCapabilities, ResolveError> {
        served()
            .into_iter()
            .find(|caps| caps.resource.group == group && caps.resource.kind == kind)
            .ok_or_else(|| ResolveError::UnknownGroupKind {
                group: group.into(),
                kind: kind.into(),
            })
    }
}

#[async_trait]
impl NamespaceClient for FakeCluster {
    async fn names(&self) -> Result<Vec<String>, ClientError> {
        let state = self.state.lock();
        if state.fail_names {
            return Err(ErrorResponse::forbidden("namespaces is forbidden").into());
        }
        Ok(state.namespaces.clone())
    }

    fn initial_namespace(&self) -> String {
        "default".into()
    }
}

#[async_trait]
impl Authorizer for FakeCluster {
    async fn can_i(&self, _key: &AccessKey) -> Result<bool, ClientError> {
        let allowed = {
            let mut state = self.state.lock();
            state.can_i_calls += 1;
            !state.deny
        };
        // widen the window for concurrent callers
        tokio::task::yield_now().await;
        Ok(allowed)
    }
}

/// Records every callback as a short line
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub async fn wait_for(&self, n: usize) {
        within_timeout(eventually(|| self.events.lock().len() >= n)).await
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_add(&self, obj: Arc<DynamicObject>) {
        self.record(format!("add {}", ItemKey::from_obj(&obj)));
    }

    async fn on_update(&self, _old: Arc<DynamicObject>, new: Arc<DynamicObject>) {
        self.record(format!("update {}", ItemKey::from_obj(&new)));
    }

    async fn on_delete(&self, obj: Arc<DynamicObject>) {
        self.record(format!("delete {}", ItemKey::from_obj(&obj)));
    }

    async fn on_resync(&self, objs: &[Arc<DynamicObject>]) {
        self.record(format!("resync {}", objs.len()));
    }
}
