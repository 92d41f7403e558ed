//! The staged pipeline behind every load, unload and reload.

use std::fmt;
use std::sync::Arc;

use tracing::{Instrument, debug, debug_span, error, warn};

use crate::error::{LoaderResult, PluginBatchError, PluginError};
use crate::plugin::Plugin;
use crate::tree::{PluginAction, PluginTree, PluginTreeIterator};

use super::LoaderShared;

/// Which phases a pipeline run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actions {
    pub syntax_check: bool,
    pub unload: bool,
    pub unlink: bool,
    pub load: bool,
}

impl Actions {
    pub const LOAD: Self = Self {
        syntax_check: true,
        unload: false,
        unlink: true,
        load: true,
    };

    pub const UNLOAD: Self = Self {
        syntax_check: false,
        unload: true,
        unlink: true,
        load: false,
    };

    pub const RELOAD: Self = Self {
        syntax_check: true,
        unload: true,
        unlink: true,
        load: true,
    };
}

impl fmt::Display for Actions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phases: Vec<&str> = [
            (self.syntax_check, "syntax_check"),
            (self.unload, "unload"),
            (self.unlink, "unlink"),
            (self.load, "load"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect();
        f.write_str(&phases.join("+"))
    }
}

/// Merges trees that share plugins until all trees are disjoint.
fn merge_overlapping(trees: Vec<PluginTree>) -> Vec<PluginTree> {
    let mut merged: Vec<PluginTree> = Vec::with_capacity(trees.len());
    for tree in trees {
        let mut tree = tree;
        let mut i = 0;
        while i < merged.len() {
            if merged[i].intersects(&tree) {
                tree = merged.swap_remove(i).union(&tree);
                i = 0;
            } else {
                i += 1;
            }
        }
        merged.push(tree);
    }
    merged
}

/// Sort key of a tree: its entry plugin, falling back to its first name.
fn entry_name(tree: &PluginTree) -> String {
    tree.get_entry_plugin()
        .map(|plugin| plugin.name().to_string())
        .or_else(|| tree.names().next().map(str::to_string))
        .unwrap_or_default()
}

impl LoaderShared {
    /// Runs the enabled phases over the trees of `plugins`.
    pub(crate) async fn run_pipeline(
        self: &Arc<Self>,
        plugins: Vec<Arc<Plugin>>,
        actions: Actions,
    ) -> LoaderResult<()> {
        let span = debug_span!("plugin_pipeline", actions = %actions, plugins = plugins.len());
        self.run_phases(plugins, actions).instrument(span).await
    }

    async fn run_phases(
        self: &Arc<Self>,
        plugins: Vec<Arc<Plugin>>,
        actions: Actions,
    ) -> LoaderResult<()> {
        let mut trees = self.build_and_sort_plugin_trees(&plugins, actions.load);
        let mut causes = Vec::new();
        let mut iterators = Vec::new();
        debug!(trees = trees.len(), "Plugin trees scheduled");

        if actions.syntax_check {
            let iterator = self.syntax_check_phase(trees, &mut causes).await;
            trees = iterator.done_success().to_vec();
            iterators.push(iterator);
        }

        if actions.unload {
            let iterator = self.unload_phase(trees, &mut causes).await;
            trees = iterator.done_success().to_vec();
            trees.sort_by_key(entry_name);
            iterators.push(iterator);
        }

        if actions.unlink {
            let (iterator, remaining) = self.unlink_phase(trees);
            trees = remaining;
            iterators.push(iterator);
        }

        if actions.load {
            let iterator = self.load_phase(trees.clone(), &mut causes).await;
            self.remember_failed(&trees, &iterator);
            iterators.push(iterator);
        }

        if causes.is_empty() {
            Ok(())
        } else {
            Err(PluginBatchError::new(causes, iterators).into())
        }
    }

    /// Builds one deep tree per plugin, merges overlapping trees and
    /// orders them by entry plugin.
    ///
    /// When loading, previously failed trees touching the request are
    /// pulled in. Trees with a dependency cycle are kept; the first phase
    /// fails them with [`PluginError::CircularDependency`] and the rest of
    /// the batch goes on.
    fn build_and_sort_plugin_trees(
        &self,
        plugins: &[Arc<Plugin>],
        include_failed: bool,
    ) -> Vec<PluginTree> {
        let mut trees: Vec<PluginTree> = Vec::new();
        for plugin in plugins {
            if !trees.iter().any(|tree| tree.contains(plugin.name())) {
                trees.push(PluginTree::new(plugin, true));
            }
        }

        if include_failed {
            let remembered = self.failed_trees.lock().clone();
            let registry = self.registry.read();
            for failed in remembered {
                if !trees.iter().any(|tree| tree.intersects(&failed)) {
                    continue;
                }
                debug!(tree = ?failed, "Retrying previously failed tree");
                for plugin in failed.plugins().filter(|p| registry.contains_plugin(p)) {
                    if !trees.iter().any(|tree| tree.contains(plugin.name())) {
                        trees.push(PluginTree::new(plugin, true));
                    }
                }
                let registered = failed
                    .plugins()
                    .filter(|p| registry.contains_plugin(p))
                    .cloned();
                trees.push(PluginTree::from_plugins(registered));
            }
        }

        let mut trees: Vec<PluginTree> = merge_overlapping(trees)
            .into_iter()
            .filter(|tree| !tree.is_empty())
            .collect();
        trees.sort_by_key(entry_name);
        trees
    }

    async fn syntax_check_phase(
        &self,
        trees: Vec<PluginTree>,
        causes: &mut Vec<PluginError>,
    ) -> PluginTreeIterator {
        let mut iterator = PluginTreeIterator::new(PluginAction::SyntaxCheck, trees);
        while let Some(plugin) = iterator.next() {
            if !plugin.is_loaded() || !self.source.exists(plugin.spec()) {
                continue;
            }
            let source = Arc::clone(&self.source);
            let spec = plugin.spec().clone();
            let result = tokio::task::spawn_blocking(move || source.check_source(&spec))
                .await
                .unwrap_or_else(|e| {
                    Err(PluginError::Join {
                        name: plugin.name().to_string(),
                        message: e.to_string(),
                    })
                });
            if let Err(failure) = result {
                error!(plugin = %plugin.name(), error = %failure, "Syntax check failed, plugin kept loaded");
                causes.push(failure);
                iterator.fail_current_hard();
            }
        }
        causes.extend(iterator.take_errors());
        iterator
    }

    async fn unload_phase(
        self: &Arc<Self>,
        trees: Vec<PluginTree>,
        causes: &mut Vec<PluginError>,
    ) -> PluginTreeIterator {
        let mut iterator = PluginTreeIterator::new(PluginAction::Unload, trees);
        while let Some(plugin) = iterator.next() {
            if let Err(failure) = self.unload_task(plugin).await {
                causes.push(failure);
                iterator.fail_current_soft();
            }
        }
        causes.extend(iterator.take_errors());
        iterator
    }

    /// Unlinks plugins whose source is gone, returning the trees without them.
    fn unlink_phase(&self, trees: Vec<PluginTree>) -> (PluginTreeIterator, Vec<PluginTree>) {
        let mut iterator = PluginTreeIterator::new(PluginAction::Unlink, trees.clone());
        let mut unlinked = Vec::new();
        while let Some(plugin) = iterator.next() {
            if !plugin.is_loaded()
                && !self.source.exists(plugin.spec())
                && self.unlink_plugin(&plugin)
            {
                unlinked.push(plugin.name().to_string());
            }
        }
        if unlinked.is_empty() {
            return (iterator, trees);
        }
        debug!(unlinked = ?unlinked, "Deleted plugins unlinked");
        self.forget_failed(unlinked.iter().map(String::as_str));
        let remaining = trees
            .iter()
            .map(|tree| tree.without(unlinked.iter().map(String::as_str)))
            .filter(|tree| !tree.is_empty())
            .collect();
        (iterator, remaining)
    }

    async fn load_phase(
        self: &Arc<Self>,
        trees: Vec<PluginTree>,
        causes: &mut Vec<PluginError>,
    ) -> PluginTreeIterator {
        let mut iterator = PluginTreeIterator::new(PluginAction::Load, trees);
        while let Some(plugin) = iterator.next() {
            if let Err(failure) = self.load_task(plugin).await {
                causes.push(failure);
                if let Some(failed) = iterator.fail_current_hard() {
                    let failed: Vec<Arc<Plugin>> = failed.plugins().cloned().collect();
                    iterator.cancel_dependents_in_to_do(&failed);
                }
            }
        }
        causes.extend(iterator.take_errors());
        iterator
    }

    /// Replaces remembered trees touched by this load with the trees that
    /// failed or were cancelled in it.
    fn remember_failed(&self, input: &[PluginTree], iterator: &PluginTreeIterator) {
        let mut remembered = self.failed_trees.lock();
        remembered.retain(|tree| !input.iter().any(|t| t.intersects(tree)));
        for tree in iterator.done_fail().iter().chain(iterator.done_cancelled()) {
            let mut grown = tree.clone();
            for plugin in tree.plugins() {
                grown = grown.union(&PluginTree::new(plugin, true));
            }
            remembered.push(grown);
        }
        let merged = merge_overlapping(std::mem::take(&mut *remembered));
        if !merged.is_empty() {
            warn!(trees = merged.len(), "Failed plugin trees remembered for retry");
        }
        *remembered = merged;
    }

    /// Drops the named plugins from the remembered failed trees.
    pub(crate) fn forget_failed<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let names: Vec<&str> = names.into_iter().collect();
        let mut remembered = self.failed_trees.lock();
        *remembered = remembered
            .iter()
            .map(|tree| tree.without(names.iter().copied()))
            .filter(|tree| !tree.is_empty())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::plugin;

    #[test]
    fn test_actions_display() {
        assert_eq!(Actions::RELOAD.to_string(), "syntax_check+unload+unlink+load");
        assert_eq!(Actions::UNLOAD.to_string(), "unload+unlink");
    }

    #[test]
    fn test_merge_overlapping() {
        let [a, b, c, d] = ["a", "b", "c", "d"].map(plugin);
        let trees = vec![
            PluginTree::from_plugins([a.clone()]),
            PluginTree::from_plugins([c.clone()]),
            PluginTree::from_plugins([a.clone(), b.clone()]),
            PluginTree::from_plugins([b.clone(), c.clone()]),
            PluginTree::from_plugins([d.clone()]),
        ];
        let mut merged = merge_overlapping(trees);
        merged.sort_by_key(entry_name);
        let names: Vec<Vec<&str>> = merged.iter().map(|t| t.names().collect()).collect();
        assert_eq!(names, vec![vec!["a", "b", "c"], vec!["d"]]);
    }
}
