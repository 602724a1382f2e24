//! Resolved resource information handed out by a resource resolver
use crate::gvk::{GroupVersionKind, GroupVersionResource};
use serde::{Deserialize, Serialize};

/// Information about a served API resource
///
/// Enough to address the resource through a dynamic client: group, version and the
/// plural name used in request paths, plus the kind objects of it carry.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ApiResource {
    /// Resource group, empty for core group.
    pub group: String,
    /// group version
    pub version: String,
    /// apiVersion of the resource (v1 for core group,
    /// groupName/groupVersions for other).
    pub api_version: String,
    /// Singular PascalCase name of the resource
    pub kind: String,
    /// Plural name of the resource
    pub plural: String,
}

impl ApiResource {
    /// Creates an ApiResource from group, version, kind and plural name.
    pub fn from_gvk_with_plural(gvk: &GroupVersionKind, plural: &str) -> Self {
        ApiResource {
            api_version: gvk.api_version(),
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            plural: plural.to_string(),
        }
    }

    /// Creates an ApiResource from group, version and kind.
    ///
    /// # Warning
    /// This function will **guess** the resource plural name.
    /// Prefer a resolver backed by discovery when one is available.
    pub fn from_gvk(gvk: &GroupVersionKind) -> Self {
        ApiResource::from_gvk_with_plural(gvk, &to_plural(&gvk.kind.to_ascii_lowercase()))
    }

    /// The group-version-resource this resource is addressed by
    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::gvr(&self.group, &self.version, &self.plural)
    }

    /// The group-version-kind of objects of this resource
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

/// Resource scope
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Scope {
    /// Objects are global
    Cluster,
    /// Each object lives in namespace.
    Namespaced,
}

/// Rbac verbs checked before serving a request
pub mod verbs {
    /// Get single resource
    pub const GET: &str = "get";
    /// List objects
    pub const LIST: &str = "list";
    /// Watch for objects changes
    pub const WATCH: &str = "watch";
    /// Delete single object
    pub const DELETE: &str = "delete";
    /// Update an object
    pub const UPDATE: &str = "update";
}

/// A resource together with its scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCapabilities {
    /// The resolved resource
    pub resource: ApiResource,
    /// Scope of the resource
    pub scope: Scope,
}

impl ApiCapabilities {
    /// Pair a resource with its scope
    pub fn new(resource: ApiResource, scope: Scope) -> Self {
        Self { resource, scope }
    }

    /// Whether objects of the resource live in namespaces
    pub fn is_namespaced(&self) -> bool {
        self.scope == Scope::Namespaced
    }
}

// Simple pluralizer for lowercased kinds.
fn to_plural(word: &str) -> String {
    match word {
        "endpoints" | "endpointslices" => return word.to_owned(),
        "nodemetrics" => return "nodes".to_owned(),
        "podmetrics" => return "pods".to_owned(),
        _ => {}
    }

    if ["s", "x", "z", "ch", "sh"].iter().any(|suffix| word.ends_with(suffix)) {
        return format!("{word}es");
    }

    if let Some(stem) = word.strip_suffix('y') {
        if stem.chars().last().is_some_and(|c| !"aeiou".contains(c)) {
            return format!("{stem}ies");
        }
    }

    format!("{word}s")
}
