use futures::prelude::*;
use kube::{
    runtime::{watcher, WatchStreamExt},
    Api, Resource,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::info;

/// Watches all resources visible to `api`, for clients that are not managed
/// by a runtime.
///
/// The stream never terminates: watch errors are logged and the watch is
/// restarted with backoff.
pub fn watch<T>(
    api: Api<T>,
    config: watcher::Config,
    span: tracing::Span,
) -> impl Stream<Item = watcher::Event<T>> + Send + 'static
where
    T: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher(api, config)
        .default_backoff()
        .filter_map(move |ev| {
            let ev = match ev {
                Ok(ev) => Some(ev),
                Err(error) => {
                    info!(parent: &span, %error, "Watch failed");
                    None
                }
            };
            future::ready(ev)
        })
}
