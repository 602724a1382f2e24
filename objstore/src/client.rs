//! Collaborators the cache talks to
//!
//! The cache never speaks to a cluster directly. Connectivity, discovery and
//! authorization are provided through the traits in this module and bundled together
//! as a [`ClusterClient`], which is the unit swapped when the cluster context changes.
use crate::access::AccessKey;
use async_trait::async_trait;
use futures::stream::BoxStream;
use objstore_core::{
    ApiCapabilities, ApiResource, DynamicObject, ErrorResponse, GroupVersionKind, ListParams, ObjectList,
    WatchEvent,
};
use std::{fmt, sync::Arc};
use thiserror::Error;

/// Failure reported by a collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The remote API answered with an error status
    #[error("api error: {0}")]
    Api(#[source] ErrorResponse),
    /// The request never got an answer
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Whether the remote API reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api(resp) if resp.is_not_found())
    }

    /// Whether the resource version asked for is no longer available
    pub fn is_gone(&self) -> bool {
        matches!(self, ClientError::Api(resp) if resp.is_gone())
    }

    /// Whether the remote API refused the request
    pub fn is_forbidden(&self) -> bool {
        matches!(self, ClientError::Api(resp) if resp.is_forbidden())
    }
}

impl From<ErrorResponse> for ClientError {
    fn from(resp: ErrorResponse) -> Self {
        ClientError::Api(resp)
    }
}

/// A type could not be mapped to a served resource
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No served resource has this group version kind
    #[error("unable to resolve {0}")]
    UnknownKind(GroupVersionKind),
    /// No served resource has this group and kind
    #[error("unable to resolve kind {kind} in group {group:?}")]
    UnknownGroupKind {
        /// API group
        group: String,
        /// Kind
        kind: String,
    },
    /// The discovery source itself failed
    #[error("discovery failed: {0}")]
    Discovery(#[source] ClientError),
}

/// Stream of raw events from a watch call
pub type WatchStream = BoxStream<'static, Result<WatchEvent<DynamicObject>, ClientError>>;

/// Untyped access to any served resource
///
/// `namespace: None` addresses all namespaces, or the cluster scope for cluster-scoped resources.
#[async_trait]
pub trait DynamicClient: Send + Sync {
    /// List objects
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ObjectList<DynamicObject>, ClientError>;

    /// Fetch a single named object
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject, ClientError>;

    /// Delete a single named object
    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> Result<(), ClientError>;

    /// Replace an object with a new version of it
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    /// Start watching for changes after `resource_version`
    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        params: &ListParams,
        resource_version: &str,
    ) -> Result<WatchStream, ClientError>;
}

/// Maps types to served resources
///
/// Consulted synchronously, implementations are expected to answer from a discovery cache.
pub trait ResourceResolver: Send + Sync {
    /// Resolve a group version kind
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiCapabilities, ResolveError>;

    /// Resolve a kind within a group, picking the preferred version
    fn resolve_group_kind(&self, group: &str, kind: &str) -> Result<ApiCapabilities, ResolveError>;
}

/// Enumerates namespaces
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Names of all namespaces visible to the client
    async fn names(&self) -> Result<Vec<String>, ClientError>;

    /// The namespace to fall back on when enumeration is not possible
    fn initial_namespace(&self) -> String;
}

/// Answers "can I" questions
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether the verb of `key` is allowed on its resource in its namespace
    async fn can_i(&self, key: &AccessKey) -> Result<bool, ClientError>;
}

/// Everything needed to talk to one cluster
#[derive(Clone)]
pub struct ClusterClient {
    dynamic: Arc<dyn DynamicClient>,
    resolver: Arc<dyn ResourceResolver>,
    namespaces: Arc<dyn NamespaceClient>,
    authorizer: Arc<dyn Authorizer>,
}

impl ClusterClient {
    /// Bundle separate collaborators
    pub fn new(
        dynamic: Arc<dyn DynamicClient>,
        resolver: Arc<dyn ResourceResolver>,
        namespaces: Arc<dyn NamespaceClient>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            dynamic,
            resolver,
            namespaces,
            authorizer,
        }
    }

    /// Use one value for every collaborator
    pub fn from_cluster<C>(cluster: Arc<C>) -> Self
    where
        C: DynamicClient + ResourceResolver + NamespaceClient + Authorizer + 'static,
    {
        Self::new(cluster.clone(), cluster.clone(), cluster.clone(), cluster)
    }

    /// The dynamic client
    pub fn dynamic(&self) -> &Arc<dyn DynamicClient> {
        &self.dynamic
    }

    /// The resource resolver
    pub fn resolver(&self) -> &Arc<dyn ResourceResolver> {
        &self.resolver
    }

    /// The namespace client
    pub fn namespaces(&self) -> &Arc<dyn NamespaceClient> {
        &self.namespaces
    }

    /// The authorizer
    pub fn authorizer(&self) -> &Arc<dyn Authorizer> {
        &self.authorizer
    }
}

impl fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_client_errors() {
        assert!(ClientError::from(ErrorResponse::not_found("pods", "foo")).is_not_found());
        assert!(ClientError::from(ErrorResponse::forbidden("no")).is_forbidden());
        assert!(!ClientError::Transport("connection reset".into()).is_not_found());
    }
}
