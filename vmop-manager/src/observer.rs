//! Generic long-lived watch loop over a single (kind, namespace,
//! label-selector): re-lists and re-watches from the last observed
//! `resourceVersion` whenever the stream ends, with a 5 s minimum between
//! restart attempts.

use std::fmt::Debug;
use std::time::Instant;

use futures::StreamExt;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Resource};
use owo_colors::OwoColorize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::util::OBSERVER_MIN_RESTART_INTERVAL;
use crate::util::colors::FG2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverChange {
    Added,
    Modified,
    Deleted,
    Bookmark,
}

pub struct ObserverEvent<T> {
    pub change: ObserverChange,
    pub object: T,
}

/// A fatal condition the observer cannot recover from by restarting: the
/// watched CRD is missing, or the client lacks the RBAC to list/watch it.
#[derive(Debug, thiserror::Error)]
#[error("resource observer for {kind} failed permanently: {source}")]
pub struct ObserverFatalError {
    pub kind: String,
    #[source]
    pub source: kube::Error,
}

/// Runs until `cancel` fires, forwarding every list/watch event on `tx`. On
/// a fatal error (missing CRD, forbidden) it sends `Err` once and returns;
/// the caller is expected to treat this as a process-ending condition.
pub async fn run<K>(
    api: Api<K>,
    label_selector: Option<String>,
    tx: mpsc::UnboundedSender<ObserverEvent<K>>,
    cancel: CancellationToken,
) -> Result<(), ObserverFatalError>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + 'static,
    K::DynamicType: Default,
{
    let kind = K::kind(&Default::default()).to_string();
    let mut last_resource_version = String::from("0");

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let attempt_started = Instant::now();

        let list_params = match &label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        let list = match api.list(&list_params).await {
            Ok(list) => list,
            Err(source) if is_fatal(&source) => {
                return Err(ObserverFatalError { kind, source });
            }
            Err(source) => {
                eprintln!(
                    "{} {kind}: {source}",
                    "transient list error, will retry watching".color(FG2)
                );
                wait_out_restart_window(attempt_started, &cancel).await;
                continue;
            }
        };

        for item in &list.items {
            let _ = tx.send(ObserverEvent {
                change: ObserverChange::Added,
                object: item.clone(),
            });
        }
        last_resource_version = list
            .metadata
            .resource_version
            .clone()
            .unwrap_or(last_resource_version);

        let watch_params = match &label_selector {
            Some(selector) => WatchParams::default().labels(selector),
            None => WatchParams::default(),
        };
        let mut stream = match api.watch(&watch_params, &last_resource_version).await {
            Ok(stream) => Box::pin(stream),
            Err(source) if is_fatal(&source) => {
                return Err(ObserverFatalError { kind, source });
            }
            Err(source) => {
                eprintln!("{} {kind}: {source}", "transient watch error".color(FG2));
                wait_out_restart_window(attempt_started, &cancel).await;
                continue;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => {
                    let Some(next) = next else { break };
                    match next {
                        Ok(WatchEvent::Added(object)) => {
                            let object = resolve_if_empty(&api, object).await;
                            last_resource_version = resource_version_of(&object).unwrap_or(last_resource_version.clone());
                            let _ = tx.send(ObserverEvent { change: ObserverChange::Added, object });
                        }
                        Ok(WatchEvent::Modified(object)) => {
                            last_resource_version = resource_version_of(&object).unwrap_or(last_resource_version.clone());
                            let _ = tx.send(ObserverEvent { change: ObserverChange::Modified, object });
                        }
                        Ok(WatchEvent::Deleted(object)) => {
                            last_resource_version = resource_version_of(&object).unwrap_or(last_resource_version.clone());
                            let _ = tx.send(ObserverEvent { change: ObserverChange::Deleted, object });
                        }
                        Ok(WatchEvent::Bookmark(bookmark)) => {
                            last_resource_version = bookmark.metadata.resource_version.clone();
                        }
                        Ok(WatchEvent::Error(err)) => {
                            eprintln!("{} {kind}: {err:?}", "watch stream reported an error event".color(FG2));
                            break;
                        }
                        Err(source) if is_fatal(&source) => {
                            return Err(ObserverFatalError { kind, source });
                        }
                        Err(source) => {
                            eprintln!("{} {kind}: {source}", "transient watch decode error".color(FG2));
                            break;
                        }
                    }
                }
            }
        }

        wait_out_restart_window(attempt_started, &cancel).await;
    }
}

/// Some API versions omit the object body on the initial `ADDED` event of a
/// watch, leaving only metadata populated; fetch the object explicitly by
/// name so downstream consumers always see it fully populated.
async fn resolve_if_empty<K>(api: &Api<K>, object: K) -> K
where
    K: Resource + Clone + Debug + DeserializeOwned,
{
    match object.meta().name.as_deref() {
        Some(name) => api.get(name).await.unwrap_or(object),
        None => object,
    }
}

fn resource_version_of<K: Resource>(object: &K) -> Option<String> {
    object.meta().resource_version.clone()
}

fn is_fatal(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(err) if err.code == 401 || err.code == 403 || err.code == 404)
}

async fn wait_out_restart_window(attempt_started: Instant, cancel: &CancellationToken) {
    let elapsed = attempt_started.elapsed();
    if elapsed >= OBSERVER_MIN_RESTART_INTERVAL {
        return;
    }
    let remaining = OBSERVER_MIN_RESTART_INTERVAL - elapsed;
    tokio::select! {
        _ = tokio::time::sleep(remaining) => {}
        _ = cancel.cancelled() => {}
    }
}
