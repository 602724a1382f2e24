//! Events of a raw watch call
use crate::error::ErrorResponse;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One event of a watch stream, in its wire form
#[derive(Deserialize, Serialize, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// An object was created
    Added(K),
    /// An object changed
    Modified(K),
    /// An object was removed
    Deleted(K),
    /// Progress marker carrying nothing but a resource version
    Bookmark(Bookmark),
    /// The server reported an error, a `410 Gone` means the resource version expired
    Error(ErrorResponse),
}

impl<K> fmt::Debug for WatchEvent<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEvent::Added(_) => f.write_str("Added"),
            WatchEvent::Modified(_) => f.write_str("Modified"),
            WatchEvent::Deleted(_) => f.write_str("Deleted"),
            WatchEvent::Bookmark(bm) => write!(f, "Bookmark({})", bm.metadata.resource_version),
            WatchEvent::Error(err) => write!(f, "Error({err})"),
        }
    }
}

/// Body of a [`WatchEvent::Bookmark`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Bookmark {
    /// Metadata of the bookmark
    pub metadata: BookmarkMeta,
}

/// Metadata of a [`WatchEvent::Bookmark`]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMeta {
    /// Version a resumed watch can start from
    pub resource_version: String,
}
