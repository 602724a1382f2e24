//! Cached authorization decisions
use crate::client::{Authorizer, ClientError, ClusterClient, ResolveError, ResourceResolver};
use ahash::AHashMap;
use objstore_core::{Key, KeyError};
use parking_lot::{Mutex, RwLock};
use std::{fmt, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid key: {0}")]
    InvalidKey(#[source] KeyError),
    #[error("failed to resolve resource: {0}")]
    Resolution(#[source] ResolveError),
    #[error("access denied: {0}")]
    Denied(AccessKey),
    #[error("authorization check failed: {0}")]
    Check(#[source] ClientError),
}

/// A verb on a resource in a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessKey {
    /// Namespace, empty for the cluster scope or all namespaces
    pub namespace: String,
    /// API group of the resource
    pub group: String,
    /// Plural resource name
    pub resource: String,
    /// The verb being checked
    pub verb: String,
}

impl AccessKey {
    pub fn new(namespace: &str, group: &str, resource: &str, verb: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            group: group.to_string(),
            resource: resource.to_string(),
            verb: verb.to_string(),
        }
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resource = if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        };
        if self.namespace.is_empty() {
            write!(f, "{} {resource}", self.verb)
        } else {
            write!(f, "{} {resource} in {}", self.verb, self.namespace)
        }
    }
}

/// Remembers "can I" answers until reset
///
/// Concurrent misses for the same [`AccessKey`] wait on each other, so a key costs at
/// most one authorization round-trip until the cache is reset.
pub struct AccessCache {
    entries: RwLock<AHashMap<AccessKey, bool>>,
    pending: Mutex<AHashMap<AccessKey, Arc<tokio::sync::Mutex<()>>>>,
    authorizer: RwLock<Arc<dyn Authorizer>>,
    resolver: RwLock<Arc<dyn ResourceResolver>>,
}

impl AccessCache {
    pub fn new(client: &ClusterClient) -> Self {
        Self {
            entries: RwLock::default(),
            pending: Mutex::default(),
            authorizer: RwLock::new(client.authorizer().clone()),
            resolver: RwLock::new(client.resolver().clone()),
        }
    }

    /// Cached answer for a key, `None` on a miss
    pub fn get(&self, key: &AccessKey) -> Option<bool> {
        self.entries.read().get(key).copied()
    }

    pub fn set(&self, key: AccessKey, allowed: bool) {
        self.entries.write().insert(key, allowed);
    }

    pub fn reset(&self) {
        self.entries.write().clear();
    }

    /// Swap the collaborators used for resolving and checking
    ///
    /// Cached answers are kept, call [`AccessCache::reset`] for a fresh picture.
    pub fn update_client(&self, client: &ClusterClient) {
        *self.authorizer.write() = client.authorizer().clone();
        *self.resolver.write() = client.resolver().clone();
    }

    /// Resolve `key` and check whether `verb` is allowed on it
    pub async fn has_access(&self, key: &Key, verb: &str) -> Result<(), Error> {
        let gvk = key.gvk().map_err(Error::InvalidKey)?;
        let resolver = self.resolver.read().clone();
        let caps = resolver.resolve(&gvk).map_err(Error::Resolution)?;
        let namespace = if caps.is_namespaced() { key.namespace.as_str() } else { "" };
        let access_key = AccessKey::new(namespace, &caps.resource.group, &caps.resource.plural, verb);
        self.check(access_key).await
    }

    /// Check an already resolved key
    pub async fn check(&self, key: AccessKey) -> Result<(), Error> {
        let allowed = match self.get(&key) {
            Some(allowed) => allowed,
            None => self.authorize(&key).await?,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::Denied(key))
        }
    }

    async fn authorize(&self, key: &AccessKey) -> Result<bool, Error> {
        let lock = self.pending.lock().entry(key.clone()).or_default().clone();
        let _guard = lock.lock().await;
        // Someone else may have answered while we were waiting
        if let Some(allowed) = self.get(key) {
            return Ok(allowed);
        }

        let authorizer = self.authorizer.read().clone();
        let result = authorizer.can_i(key).await;
        if let Ok(allowed) = result {
            tracing::debug!(access = %key, allowed, "authorization checked");
            self.set(key.clone(), allowed);
        }
        self.pending.lock().remove(key);
        result.map_err(Error::Check)
    }
}
