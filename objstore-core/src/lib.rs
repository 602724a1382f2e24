//! Client-less types shared by the objstore cache
//!
//! Everything needed to name a resource, describe an object of it, and address a query
//! against the cache, without pulling in any runtime.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod discovery;
pub use discovery::{verbs, ApiCapabilities, ApiResource, Scope};

pub mod dynamic;
pub use dynamic::DynamicObject;

pub mod gvk;
pub use gvk::{GroupVersion, GroupVersionKind, GroupVersionResource};

pub mod key;
pub use key::{Coordinate, Key, KeyError};

pub mod labels;
pub use labels::{Expression, Selector};

pub mod metadata;

pub mod object;
pub use object::ObjectList;

pub mod params;
pub use params::ListParams;

pub mod watch;
pub use watch::WatchEvent;

mod error;
pub use error::ErrorResponse;
