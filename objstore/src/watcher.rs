//! Watches a resource coordinate for changes, with error recovery
use crate::client::{ClientError, DynamicClient, WatchStream};
use futures::{Stream, StreamExt};
use objstore_core::{ApiResource, DynamicObject, ErrorResponse, ListParams, WatchEvent};
use std::{fmt, sync::Arc};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] ClientError),
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] ClientError),
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] ClientError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Watch events returned from the [`watcher`]
#[derive(Debug, Clone)]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    Deleted(K),
    /// The watch stream was restarted, so `Deleted` events may have been missed
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
}

/// Parameters forwarded to the list and watch calls of a [`watcher`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// A selector to restrict the list of returned objects by their labels
    pub label_selector: Option<String>,
    /// A selector to restrict the list of returned objects by their fields
    pub field_selector: Option<String>,
    /// Timeout for the list/watch call, in seconds
    pub timeout: Option<u32>,
    /// Page size of the initial list
    pub page_size: Option<u32>,
}

impl Config {
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    #[must_use]
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    fn to_list_params(&self) -> ListParams {
        ListParams {
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
            timeout: self.timeout,
            limit: self.page_size,
        }
    }
}

/// The internal finite state machine driving the [`watcher`]
enum State {
    /// The next poll will start the initial LIST to get all existing objects
    Empty,
    /// The initial LIST was successful, so we should move on to starting the actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from the server.
    ///
    /// If the connection is disrupted then we propagate the error but try to restart the watch stream by
    /// returning to the `InitListed` state.
    /// If we fall out of the watch window then we propagate the error and fall back doing a re-list
    /// with `Empty`.
    Watching {
        resource_version: String,
        stream: WatchStream,
    },
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Empty => f.write_str("Empty"),
            State::InitListed { resource_version } => f
                .debug_struct("InitListed")
                .field("resource_version", resource_version)
                .finish(),
            State::Watching { resource_version, .. } => f
                .debug_struct("Watching")
                .field("resource_version", resource_version)
                .finish_non_exhaustive(),
        }
    }
}

struct Context {
    client: Arc<dyn DynamicClient>,
    resource: ApiResource,
    namespace: Option<String>,
    params: ListParams,
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined(ctx: &Context, state: State) -> (Option<Result<Event<DynamicObject>>>, State) {
    let namespace = ctx.namespace.as_deref();
    match state {
        State::Empty => match ctx.client.list(&ctx.resource, namespace, &ctx.params).await {
            Ok(list) => {
                let resource_version = list.metadata.resource_version.unwrap_or_default();
                (Some(Ok(Event::Restarted(list.items))), State::InitListed {
                    resource_version,
                })
            }
            Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
        },
        State::InitListed { resource_version } => {
            match ctx
                .client
                .watch(&ctx.resource, namespace, &ctx.params, &resource_version)
                .await
            {
                Ok(stream) => (None, State::Watching {
                    resource_version,
                    stream,
                }),
                Err(err) if err.is_gone() => (Some(Err(Error::WatchStartFailed(err))), State::Empty),
                Err(err) => (Some(Err(Error::WatchStartFailed(err))), State::InitListed {
                    resource_version,
                }),
            }
        }
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                let resource_version = obj.resource_version().map_or(resource_version, String::from);
                (Some(Ok(Event::Applied(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                let resource_version = obj.resource_version().map_or(resource_version, String::from);
                (Some(Ok(Event::Deleted(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Bookmark(bm))) => (None, State::Watching {
                resource_version: bm.metadata.resource_version,
                stream,
            }),
            Some(Ok(WatchEvent::Error(err))) => {
                // HTTP GONE, means we have desynced and need to start over and re-list
                let new_state = if err.is_gone() {
                    State::Empty
                } else {
                    State::Watching {
                        resource_version,
                        stream,
                    }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => (Some(Err(Error::WatchFailed(err))), State::Watching {
                resource_version,
                stream,
            }),
            None => (None, State::InitListed { resource_version }),
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step(ctx: &Context, mut state: State) -> (Result<Event<DynamicObject>>, State) {
    loop {
        match step_trampolined(ctx, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a resource for changes continuously
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery mode
/// on the next poll. Apply your own backoff by not polling the stream for a duration after errors.
///
/// # Recovery
///
/// If the watch connection is interrupted then we attempt to restart the watch using the last
/// resource version that we have seen on the stream. If this is successful then the stream is simply
/// resumed from where it left off. If this fails because the resource version is no longer valid then
/// we start over with a new stream, starting with an [`Event::Restarted`].
pub fn watcher(
    client: Arc<dyn DynamicClient>,
    resource: ApiResource,
    namespace: Option<String>,
    config: &Config,
) -> impl Stream<Item = Result<Event<DynamicObject>>> + Send {
    let ctx = Context {
        client,
        resource,
        namespace,
        params: config.to_list_params(),
    };
    futures::stream::unfold((ctx, State::Empty), |(ctx, state)| async {
        let (event, state) = step(&ctx, state).await;
        Some((event, (ctx, state)))
    })
}
