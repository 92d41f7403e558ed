//! One in-flight load and one in-flight unload per plugin.
//!
//! A request joins the task of its own kind already running for the plugin,
//! unless a task of the other kind was queued after it. In that case the
//! request is queued behind that task instead, so the latest request decides
//! the final state. Tasks are spawned, so they run to completion even when
//! every caller goes away.

use std::collections::HashMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::trace;

use crate::error::PluginResult;
use crate::plugin::Plugin;

use super::{LoadStatus, LoaderShared, UnloadStatus};

type SharedTask<T> = Shared<BoxFuture<'static, PluginResult<T>>>;

/// A spawned task and the order it was queued in.
struct TaskEntry<T> {
    seq: u64,
    task: SharedTask<T>,
}

#[derive(Default)]
pub(crate) struct TaskMaps {
    next_seq: u64,
    load: HashMap<String, TaskEntry<LoadStatus>>,
    unload: HashMap<String, TaskEntry<UnloadStatus>>,
}

impl TaskMaps {
    /// Number of tasks in flight.
    pub(crate) fn len(&self) -> usize {
        self.load.len() + self.unload.len()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn load_seq(&self, name: &str) -> Option<u64> {
        self.load.get(name).map(|entry| entry.seq)
    }

    fn unload_seq(&self, name: &str) -> Option<u64> {
        self.unload.get(name).map(|entry| entry.seq)
    }
}

/// Whether a task queued at `own` is still the latest request for its plugin.
fn is_latest(own: Option<u64>, other: Option<u64>) -> bool {
    match (own, other) {
        (Some(own), Some(other)) => own > other,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl LoaderShared {
    /// Loads `plugin`, joining the task already running for it if any.
    pub(crate) async fn load_task(
        self: &Arc<Self>,
        plugin: Arc<Plugin>,
    ) -> PluginResult<LoadStatus> {
        let task = {
            let mut tasks = self.tasks.lock();
            let name = plugin.name().to_string();
            if is_latest(tasks.load_seq(&name), tasks.unload_seq(&name)) {
                trace!(plugin = %name, "Joining in-flight load");
                tasks.load[&name].task.clone()
            } else {
                if tasks.load.contains_key(&name) {
                    trace!(plugin = %name, "Queueing load behind pending unload");
                }
                let pending_unload = tasks.unload.get(&name).map(|entry| entry.task.clone());
                let seq = tasks.next_seq();
                let shared = Arc::clone(self);
                let key = name.clone();
                let task = async move {
                    if let Some(unload) = pending_unload {
                        let _ = unload.await;
                    }
                    let result = shared.execute_load(plugin).await;
                    let mut tasks = shared.tasks.lock();
                    if tasks.load_seq(&key) == Some(seq) {
                        tasks.load.remove(&key);
                    }
                    result
                }
                .boxed()
                .shared();
                tasks.load.insert(
                    name,
                    TaskEntry {
                        seq,
                        task: task.clone(),
                    },
                );
                tokio::spawn(task.clone());
                task
            }
        };
        task.await
    }

    /// Unloads `plugin`, joining the task already running for it if any.
    pub(crate) async fn unload_task(
        self: &Arc<Self>,
        plugin: Arc<Plugin>,
    ) -> PluginResult<UnloadStatus> {
        let task = {
            let mut tasks = self.tasks.lock();
            let name = plugin.name().to_string();
            if is_latest(tasks.unload_seq(&name), tasks.load_seq(&name)) {
                trace!(plugin = %name, "Joining in-flight unload");
                tasks.unload[&name].task.clone()
            } else {
                if tasks.unload.contains_key(&name) {
                    trace!(plugin = %name, "Queueing unload behind pending load");
                }
                let pending_load = tasks.load.get(&name).map(|entry| entry.task.clone());
                let seq = tasks.next_seq();
                let shared = Arc::clone(self);
                let key = name.clone();
                let task = async move {
                    if let Some(load) = pending_load {
                        let _ = load.await;
                    }
                    let result = shared.execute_unload(plugin).await;
                    let mut tasks = shared.tasks.lock();
                    if tasks.unload_seq(&key) == Some(seq) {
                        tasks.unload.remove(&key);
                    }
                    result
                }
                .boxed()
                .shared();
                tasks.unload.insert(
                    name,
                    TaskEntry {
                        seq,
                        task: task.clone(),
                    },
                );
                tokio::spawn(task.clone());
                task
            }
        };
        task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_latest() {
        assert!(is_latest(Some(1), None));
        assert!(is_latest(Some(3), Some(2)));
        assert!(!is_latest(Some(1), Some(2)));
        assert!(!is_latest(None, Some(2)));
        assert!(!is_latest(None, None));
    }
}
