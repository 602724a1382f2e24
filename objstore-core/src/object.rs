//! Generic object list wrapper.
use crate::metadata::ListMeta;
use serde::{Deserialize, Serialize};

/// A generic object list, as returned by list calls on a dynamic client
///
/// Only `metadata.resourceVersion` is used by the watcher, to resume watching
/// from the point in time the list was taken.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ObjectList<T> {
    /// ListMeta - only really used for its `resourceVersion`
    #[serde(default)]
    pub metadata: ListMeta,

    /// The listed objects
    #[serde(bound(deserialize = "Vec<T>: Deserialize<'de>"))]
    pub items: Vec<T>,
}

impl<T> ObjectList<T> {
    /// Build a list at a given resource version
    pub fn new(resource_version: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            metadata: ListMeta {
                resource_version: Some(resource_version.into()),
                ..ListMeta::default()
            },
            items,
        }
    }
}

impl<T> IntoIterator for ObjectList<T> {
    type IntoIter = ::std::vec::IntoIter<Self::Item>;
    type Item = T;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
