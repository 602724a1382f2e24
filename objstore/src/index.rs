//! In-memory index of observed objects, per resource coordinate
use ahash::AHashMap;
use objstore_core::{Coordinate, DynamicObject};
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("resource {0} is not initialized")]
    Uninitialized(Coordinate),
    #[error("resource {0} is already initialized")]
    AlreadyInitialized(Coordinate),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identity of an object within one coordinate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    /// The name of the object
    pub name: String,
    /// The namespace of the object, `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ItemKey {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates an `ItemKey` from an object
    #[must_use]
    pub fn from_obj(obj: &DynamicObject) -> Self {
        Self {
            name: obj.name_any().to_string(),
            namespace: obj.namespace().map(String::from),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

type Items = AHashMap<ItemKey, Arc<DynamicObject>>;

/// Objects known for every initialized coordinate
///
/// The outer lock is only held to find a coordinate's item map; each item map has its
/// own lock, so unrelated coordinates never contend.
#[derive(Default)]
pub struct ResourceIndex {
    resources: RwLock<AHashMap<Coordinate, Arc<RwLock<Items>>>>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty item map for the coordinate
    pub fn initialize(&self, coordinate: &Coordinate) -> Result<()> {
        let mut resources = self.resources.write();
        if resources.contains_key(coordinate) {
            return Err(Error::AlreadyInitialized(coordinate.clone()));
        }
        tracing::trace!(%coordinate, "initializing resource index");
        resources.insert(coordinate.clone(), Arc::default());
        Ok(())
    }

    pub fn has_resource(&self, coordinate: &Coordinate) -> bool {
        self.resources.read().contains_key(coordinate)
    }

    /// Coordinates currently initialized
    pub fn coordinates(&self) -> Vec<Coordinate> {
        self.resources.read().keys().cloned().collect()
    }

    fn items(&self, coordinate: &Coordinate) -> Result<Arc<RwLock<Items>>> {
        self.resources
            .read()
            .get(coordinate)
            .cloned()
            .ok_or_else(|| Error::Uninitialized(coordinate.clone()))
    }

    /// Insert or overwrite one object
    pub fn add(&self, coordinate: &Coordinate, obj: DynamicObject) -> Result<()> {
        self.add_many(coordinate, [obj])
    }

    /// Insert or overwrite several objects at once
    pub fn add_many(&self, coordinate: &Coordinate, objs: impl IntoIterator<Item = DynamicObject>) -> Result<()> {
        let items = self.items(coordinate)?;
        let mut items = items.write();
        for obj in objs {
            items.insert(ItemKey::from_obj(&obj), Arc::new(obj));
        }
        Ok(())
    }

    /// Insert or overwrite an already shared object
    pub fn add_shared(&self, coordinate: &Coordinate, obj: Arc<DynamicObject>) -> Result<()> {
        let items = self.items(coordinate)?;
        items.write().insert(ItemKey::from_obj(&obj), obj);
        Ok(())
    }

    /// Retrieve an object, `None` if the coordinate is initialized but the object unknown
    pub fn get(&self, coordinate: &Coordinate, key: &ItemKey) -> Result<Option<Arc<DynamicObject>>> {
        let items = self.items(coordinate)?;
        let items = items.read();
        Ok(items.get(key).cloned())
    }

    /// Snapshot of every object of the coordinate, in no particular order
    pub fn list(&self, coordinate: &Coordinate) -> Result<Vec<Arc<DynamicObject>>> {
        let items = self.items(coordinate)?;
        let items = items.read();
        Ok(items.values().cloned().collect())
    }

    /// Remove one object, absent objects are ignored
    pub fn delete(&self, coordinate: &Coordinate, obj: &DynamicObject) -> Result<()> {
        let items = self.items(coordinate)?;
        items.write().remove(&ItemKey::from_obj(obj));
        Ok(())
    }

    /// Replace the full contents of a coordinate with a fresh listing
    pub fn replace(&self, coordinate: &Coordinate, objs: &[Arc<DynamicObject>]) -> Result<()> {
        let items = self.items(coordinate)?;
        let fresh = objs
            .iter()
            .map(|obj| (ItemKey::from_obj(obj), obj.clone()))
            .collect::<Items>();
        *items.write() = fresh;
        Ok(())
    }

    /// Forget a coordinate entirely, returns whether it was initialized
    pub fn remove(&self, coordinate: &Coordinate) -> bool {
        self.resources.write().remove(coordinate).is_some()
    }

    /// Forget every coordinate
    pub fn reset(&self) {
        let old = std::mem::take(&mut *self.resources.write());
        tracing::debug!(coordinates = old.len(), "reset resource index");
    }
}
