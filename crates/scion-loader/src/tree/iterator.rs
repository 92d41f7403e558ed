use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PluginError;
use crate::plugin::Plugin;

use super::PluginTree;

/// The phase a [`PluginTreeIterator`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginAction {
    Load,
    Unload,
    SyntaxCheck,
    Unlink,
}

impl fmt::Display for PluginAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::Unload => "unload",
            Self::SyntaxCheck => "syntax_check",
            Self::Unlink => "unlink",
        })
    }
}

#[derive(Debug, Clone)]
struct CurrentTree {
    tree: PluginTree,
    pending: VecDeque<Arc<Plugin>>,
    failed: bool,
}

/// Walks one phase over a batch of trees.
///
/// Yields plugins tree by tree. Loads visit the trees in the order given
/// and each tree's plugins dependencies first; unloads visit the trees in
/// reverse and each tree's plugins dependents first. A plugin shared by
/// several trees is yielded once.
///
/// Every tree ends in exactly one bucket:
///
/// - `done_success`: all its plugins were yielded and none failed
/// - `done_fail`: [`fail_current_hard`] or [`fail_current_soft`] was called
///   while it was current, or it could not be sorted
/// - `done_cancelled`: removed from the to-do stack by
///   [`cancel_dependents_in_to_do`]
///
/// [`fail_current_hard`]: Self::fail_current_hard
/// [`fail_current_soft`]: Self::fail_current_soft
/// [`cancel_dependents_in_to_do`]: Self::cancel_dependents_in_to_do
#[derive(Debug, Clone)]
pub struct PluginTreeIterator {
    action: PluginAction,
    to_do: Vec<PluginTree>,
    current: Option<CurrentTree>,
    iterated: BTreeSet<String>,
    done_success: Vec<PluginTree>,
    done_fail: Vec<PluginTree>,
    done_cancelled: Vec<PluginTree>,
    sort_errors: Vec<PluginError>,
}

impl PluginTreeIterator {
    pub fn new(action: PluginAction, trees: Vec<PluginTree>) -> Self {
        let mut to_do = trees;
        if action == PluginAction::Load {
            to_do.reverse();
        }
        Self {
            action,
            to_do,
            current: None,
            iterated: BTreeSet::new(),
            done_success: Vec::new(),
            done_fail: Vec::new(),
            done_cancelled: Vec::new(),
            sort_errors: Vec::new(),
        }
    }

    pub fn action(&self) -> PluginAction {
        self.action
    }

    pub fn done_success(&self) -> &[PluginTree] {
        &self.done_success
    }

    pub fn done_fail(&self) -> &[PluginTree] {
        &self.done_fail
    }

    pub fn done_cancelled(&self) -> &[PluginTree] {
        &self.done_cancelled
    }

    /// Trees not started yet, next one last.
    pub fn to_do(&self) -> &[PluginTree] {
        &self.to_do
    }

    pub fn current_tree(&self) -> Option<&PluginTree> {
        self.current.as_ref().map(|current| &current.tree)
    }

    /// Names of every plugin yielded so far.
    pub fn iterated(&self) -> &BTreeSet<String> {
        &self.iterated
    }

    /// Every plugin of every tree this iterator was given.
    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        let mut seen = BTreeSet::new();
        self.done_success
            .iter()
            .chain(&self.done_fail)
            .chain(&self.done_cancelled)
            .chain(self.current.as_ref().map(|current| &current.tree))
            .chain(&self.to_do)
            .flat_map(PluginTree::plugins)
            .filter(|plugin| seen.insert(plugin.name().to_string()))
            .cloned()
            .collect()
    }

    /// Errors of trees whose order could not be computed.
    pub fn take_errors(&mut self) -> Vec<PluginError> {
        std::mem::take(&mut self.sort_errors)
    }

    /// Abandons the rest of the current tree and marks it failed.
    pub fn fail_current_hard(&mut self) -> Option<PluginTree> {
        let current = self.current.take()?;
        if !current.failed {
            self.done_fail.push(current.tree.clone());
        }
        debug!(
            action = %self.action,
            skipped = current.pending.len(),
            "Tree failed, remaining plugins abandoned"
        );
        Some(current.tree)
    }

    /// Marks the current tree failed but keeps yielding its plugins.
    pub fn fail_current_soft(&mut self) {
        if let Some(current) = self.current.as_mut() {
            if !current.failed {
                current.failed = true;
                self.done_fail.push(current.tree.clone());
            }
        }
    }

    /// Cancels every tree still to do that contains one of `failed`.
    ///
    /// Returns the number of cancelled trees.
    pub fn cancel_dependents_in_to_do(&mut self, failed: &[Arc<Plugin>]) -> usize {
        let names: BTreeSet<&str> = failed.iter().map(|plugin| plugin.name()).collect();
        let (cancelled, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.to_do)
            .into_iter()
            .partition(|tree| names.iter().any(|name| tree.contains(name)));
        self.to_do = kept;
        let count = cancelled.len();
        if count > 0 {
            debug!(action = %self.action, cancelled = count, "Dependent trees cancelled");
        }
        self.done_cancelled.extend(cancelled);
        count
    }

    fn start_next_tree(&mut self) -> bool {
        while let Some(tree) = self.to_do.pop() {
            match tree.get_plugins_sorted() {
                Ok(sorted) => {
                    let mut pending: VecDeque<Arc<Plugin>> = sorted.iter().cloned().collect();
                    if self.action == PluginAction::Unload {
                        pending.make_contiguous().reverse();
                    }
                    self.current = Some(CurrentTree {
                        tree,
                        pending,
                        failed: false,
                    });
                    return true;
                }
                Err(error) => {
                    warn!(action = %self.action, error = %error, "Cannot order plugin tree");
                    self.sort_errors.push(error);
                    self.done_fail.push(tree);
                }
            }
        }
        false
    }
}

impl Iterator for PluginTreeIterator {
    type Item = Arc<Plugin>;

    fn next(&mut self) -> Option<Arc<Plugin>> {
        loop {
            if self.current.is_none() && !self.start_next_tree() {
                return None;
            }
            let current = self.current.as_mut()?;
            while let Some(plugin) = current.pending.pop_front() {
                if self.iterated.insert(plugin.name().to_string()) {
                    return Some(plugin);
                }
            }
            if let Some(finished) = self.current.take() {
                if !finished.failed {
                    self.done_success.push(finished.tree);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::plugin;

    fn names(plugins: impl IntoIterator<Item = Arc<Plugin>>) -> Vec<String> {
        plugins.into_iter().map(|p| p.name().to_string()).collect()
    }

    fn tree_names(trees: &[PluginTree]) -> Vec<Vec<&str>> {
        trees.iter().map(|t| t.names().collect()).collect()
    }

    #[test]
    fn test_load_order() {
        let [a, b, c] = ["a", "b", "c"].map(plugin);
        Plugin::link(&c, &b, false);
        let trees = vec![PluginTree::new(&a, true), PluginTree::new(&b, true)];
        let iterator = PluginTreeIterator::new(PluginAction::Load, trees);
        assert_eq!(names(iterator), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unload_order() {
        let [a, b, c] = ["a", "b", "c"].map(plugin);
        Plugin::link(&c, &b, false);
        let trees = vec![PluginTree::new(&a, true), PluginTree::new(&b, true)];
        let mut iterator = PluginTreeIterator::new(PluginAction::Unload, trees);
        assert_eq!(names(iterator.by_ref()), vec!["c", "b", "a"]);
        assert_eq!(iterator.done_success().len(), 2);
    }

    #[test]
    fn test_shared_plugin_yielded_once() {
        let [a, b] = ["a", "b"].map(plugin);
        let trees = vec![
            PluginTree::from_plugins([a.clone(), b.clone()]),
            PluginTree::from_plugins([b.clone()]),
        ];
        let mut iterator = PluginTreeIterator::new(PluginAction::Load, trees);
        assert_eq!(names(iterator.by_ref()), vec!["a", "b"]);
        assert_eq!(iterator.done_success().len(), 2);
        assert_eq!(iterator.iterated().len(), 2);
    }

    #[test]
    fn test_hard_fail_and_cancel() {
        let [a, b, c, d] = ["a", "b", "c", "d"].map(plugin);
        Plugin::link(&c, &b, false);
        let trees = vec![
            PluginTree::new(&a, true),
            PluginTree::new(&b, true),
            PluginTree::from_plugins([d.clone(), b.clone()]),
        ];
        let mut iterator = PluginTreeIterator::new(PluginAction::Load, trees);

        assert_eq!(iterator.next().unwrap().name(), "a");
        let failing = iterator.next().unwrap();
        assert_eq!(failing.name(), "b");
        let failed_tree = iterator.fail_current_hard().unwrap();
        let failed: Vec<_> = failed_tree.plugins().cloned().collect();
        assert_eq!(iterator.cancel_dependents_in_to_do(&failed), 1);
        assert!(iterator.next().is_none());

        assert_eq!(tree_names(iterator.done_success()), vec![vec!["a"]]);
        assert_eq!(tree_names(iterator.done_fail()), vec![vec!["b", "c"]]);
        assert_eq!(tree_names(iterator.done_cancelled()), vec![vec!["b", "d"]]);
        assert!(!iterator.iterated().contains("c"));
        assert_eq!(iterator.plugins().len(), 4);
    }

    #[test]
    fn test_soft_fail_keeps_going() {
        let [a, b] = ["a", "b"].map(plugin);
        Plugin::link(&b, &a, false);
        let mut iterator =
            PluginTreeIterator::new(PluginAction::Unload, vec![PluginTree::new(&a, true)]);
        assert_eq!(iterator.next().unwrap().name(), "b");
        iterator.fail_current_soft();
        assert_eq!(iterator.next().unwrap().name(), "a");
        assert!(iterator.next().is_none());
        assert!(iterator.done_success().is_empty());
        assert_eq!(iterator.done_fail().len(), 1);
    }

    #[test]
    fn test_unsortable_tree_fails() {
        let [a, b] = ["a", "b"].map(plugin);
        Plugin::link(&a, &b, true);
        Plugin::link(&b, &a, true);
        let mut iterator =
            PluginTreeIterator::new(PluginAction::Load, vec![PluginTree::new(&a, true)]);
        assert!(iterator.next().is_none());
        assert_eq!(iterator.done_fail().len(), 1);
        assert_eq!(iterator.take_errors().len(), 1);
    }
}
