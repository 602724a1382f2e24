//! The untyped object representation held by the cache.
use crate::{
    discovery::ApiResource,
    gvk::{GroupVersionKind, ParseGroupVersionError},
    metadata::{ObjectMeta, TypeMeta},
};
use std::collections::BTreeMap;

/// A dynamic representation of a cluster object
///
/// This will work with any non-list type object. Everything outside of the type fields and
/// `metadata` is kept as an untyped JSON document.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Default)]
pub struct DynamicObject {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other keys
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    /// Create a DynamicObject with minimal values set from ApiResource.
    #[must_use]
    pub fn new(name: &str, resource: &ApiResource) -> Self {
        Self {
            types: Some(TypeMeta::new(&resource.api_version, &resource.kind)),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Default::default(),
        }
    }

    /// Attach dynamic data to a DynamicObject
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace to a DynamicObject
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Attach labels to a DynamicObject
    #[must_use]
    pub fn labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.labels = Some(labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// The object name, empty if unset
    pub fn name_any(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// The object namespace, if any
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    /// The resource version last observed for the object
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    /// The `apiVersion` of the object, empty if the type fields are missing
    pub fn api_version(&self) -> &str {
        self.types.as_ref().map(|t| t.api_version.as_str()).unwrap_or_default()
    }

    /// The kind of the object, empty if the type fields are missing
    pub fn kind(&self) -> &str {
        self.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default()
    }

    /// Parse the type fields into a [`GroupVersionKind`]
    pub fn gvk(&self) -> Result<GroupVersionKind, ParseGroupVersionError> {
        GroupVersionKind::from_api_version_kind(self.api_version(), self.kind())
    }

    /// Labels of the object
    pub fn labels_map(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }

    /// Annotations of the object
    pub fn annotations_map(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.annotations.as_ref().unwrap_or(&EMPTY)
    }
}
