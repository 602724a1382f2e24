//! An informer-backed object cache for a remote cluster
//!
//! Reads go through an [`ObjectStore`]. The first read of a resource in a namespace is
//! answered live and starts an informer; from then on the resource is served from an
//! in-memory index that the informer keeps current. Writes always go to the cluster.
//!
//! Everything the store needs from the cluster is behind the traits in [`client`], so
//! any transport can be plugged in through a [`ClusterClient`].

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod access;
pub mod backoff;
pub mod client;
pub mod config;
pub mod handler;
pub mod index;
pub mod informer;
pub mod notify;
pub mod retry;
pub mod store;
pub mod watcher;

#[cfg(test)]
mod test_utils;

pub use access::{AccessCache, AccessKey};
pub use backoff::BackoffConfig;
pub use client::{Authorizer, ClientError, ClusterClient, DynamicClient, NamespaceClient, ResolveError, ResourceResolver};
pub use config::{Config, WatcherConfig};
pub use informer::{EventHandler, InformerConfig};
pub use notify::{Action, Notification, NotificationReceiver};
pub use retry::RetryConfig;
pub use store::{BoxError, Error, ObjectStore, Result};

pub use objstore_core as core;
