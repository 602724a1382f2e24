//! Query keys and the resource coordinates they resolve to
use crate::{
    gvk::{GroupVersionKind, GroupVersionResource, ParseGroupVersionError},
    labels::Selector,
};
use std::fmt;
use thiserror::Error;

/// A [`Key`] that cannot address a resource
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The key has no `apiVersion`
    #[error("key is missing an apiVersion")]
    MissingApiVersion,
    /// The key has no kind
    #[error("key is missing a kind")]
    MissingKind,
    /// The operation needs a single named object
    #[error("key is missing a name")]
    MissingName,
    /// The `apiVersion` of the key does not parse
    #[error("key has an invalid apiVersion: {0}")]
    InvalidApiVersion(#[source] ParseGroupVersionError),
}

/// Identifies a class of objects to query
///
/// A key without a name addresses every object of its kind, optionally restricted by a
/// label selector. An empty namespace means all namespaces for namespaced resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Key {
    /// Namespace, empty for all namespaces or the cluster scope
    pub namespace: String,
    /// `apiVersion` of the objects
    pub api_version: String,
    /// Kind of the objects
    pub kind: String,
    /// Name of a single object
    pub name: Option<String>,
    /// Label selector applied to lists
    pub selector: Option<Selector>,
}

impl Key {
    /// A key for every object of a kind
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    /// A key for every object of a group version kind
    pub fn for_gvk(gvk: &GroupVersionKind) -> Self {
        Self::new(&gvk.api_version(), &gvk.kind)
    }

    /// Restrict the key to a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Restrict the key to a single named object
    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Restrict the key by labels
    #[must_use]
    pub fn selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// The group version kind this key addresses
    pub fn gvk(&self) -> Result<GroupVersionKind, KeyError> {
        if self.api_version.is_empty() {
            return Err(KeyError::MissingApiVersion);
        }
        if self.kind.is_empty() {
            return Err(KeyError::MissingKind);
        }
        GroupVersionKind::from_api_version_kind(&self.api_version, &self.kind)
            .map_err(KeyError::InvalidApiVersion)
    }

    /// The namespace as an option, `None` when empty
    pub fn namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }

    /// The name of the single object this key addresses
    pub fn name(&self) -> Result<&str, KeyError> {
        self.name.as_deref().filter(|n| !n.is_empty()).ok_or(KeyError::MissingName)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheKey[Namespace='{}', APIVersion='{}', Kind='{}'",
            self.namespace, self.api_version, self.kind
        )?;
        if let Some(name) = &self.name {
            write!(f, ", Name='{name}'")?;
        }
        if let Some(selector) = self.selector.as_ref().filter(|s| !s.selects_all()) {
            write!(f, ", Selector='{selector}'")?;
        }
        f.write_str("]")
    }
}

/// A namespace and resource pair; the unit of indexing and watching
///
/// The namespace is empty for the cluster scope and for all-namespace watches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    /// Namespace, empty for the cluster scope
    pub namespace: String,
    /// The watched resource
    pub gvr: GroupVersionResource,
}

impl Coordinate {
    /// Pair a namespace with a resource
    pub fn new(namespace: &str, gvr: GroupVersionResource) -> Self {
        Self {
            namespace: namespace.to_string(),
            gvr,
        }
    }

    /// The namespace as an option, `None` for the cluster scope
    pub fn namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.gvr)
        } else {
            write!(f, "{}/{}", self.namespace, self.gvr)
        }
    }
}
