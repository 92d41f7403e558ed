//! Side-effect snapshots.
//!
//! A snapshot captures one category of client state (event handlers,
//! commands, ...) at a point in time. Subtracting two snapshots of the same
//! client gives a [`SnapshotDifference`]: what was added and what was
//! removed in between. The loader captures before and after each plugin
//! load, stores the difference on the plugin and reverts it on unload.
//!
//! Differences compose:
//!
//! ```text
//! (S2 - S0).extract(S1 - S0) == S2 - S1
//! ```
//!
//! which is how a plugin that loaded another one inline hands that plugin's
//! effects back to it instead of claiming them.
//!
//! The loader works with a configurable list of categories through the
//! type-erased [`SnapshotSet`] and [`DifferenceSet`].

mod commands;
mod event_handlers;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Sub;
use std::sync::{Arc, Weak};

use scion_core::Client;
use tracing::trace;

pub use commands::Commands;
pub use event_handlers::EventHandlers;

// =============================================================================
// SnapshotType
// =============================================================================

/// One category of client state that plugins can change.
pub trait SnapshotType: Send + Sync + 'static {
    /// One captured item. Equality must identify a single registration.
    type Entry: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Stable category name.
    const KIND: &'static str;

    /// Captures the current entries.
    fn capture(client: &Client) -> Vec<Self::Entry>;

    /// Undoes an addition.
    fn revert_added(client: &Client, entry: &Self::Entry);

    /// Undoes a removal.
    fn revert_removed(client: &Client, entry: &Self::Entry);

    /// `(added, removed)` between two captures.
    fn difference(
        before: &[Self::Entry],
        after: &[Self::Entry],
    ) -> (Vec<Self::Entry>, Vec<Self::Entry>) {
        get_list_difference(before, after)
    }
}

/// Multiset difference, keeping the order each side had.
///
/// Returns `(added, removed)`: entries of `after` not matched in `before`,
/// and entries of `before` not matched in `after`.
pub fn get_list_difference<E: Clone + Eq + Hash>(before: &[E], after: &[E]) -> (Vec<E>, Vec<E>) {
    let mut remaining: HashMap<&E, usize> = HashMap::new();
    for entry in before {
        *remaining.entry(entry).or_default() += 1;
    }
    let mut added = Vec::new();
    for entry in after {
        match remaining.get_mut(entry) {
            Some(count) if *count > 0 => *count -= 1,
            _ => added.push(entry.clone()),
        }
    }
    let mut removed = Vec::new();
    for entry in before.iter().rev() {
        if let Some(count) = remaining.get_mut(entry) {
            if *count > 0 {
                *count -= 1;
                removed.push(entry.clone());
            }
        }
    }
    removed.reverse();
    (added, removed)
}

/// Set difference, ignoring multiplicity.
pub fn get_set_difference<E: Clone + Eq + Hash>(before: &[E], after: &[E]) -> (Vec<E>, Vec<E>) {
    let before_set: HashSet<&E> = before.iter().collect();
    let after_set: HashSet<&E> = after.iter().collect();
    let mut seen = HashSet::new();
    let added = after
        .iter()
        .filter(|entry| !before_set.contains(entry) && seen.insert(*entry))
        .cloned()
        .collect();
    let removed = before
        .iter()
        .filter(|entry| !after_set.contains(entry) && seen.insert(*entry))
        .cloned()
        .collect();
    (added, removed)
}

/// Removes one match per element of `other` from `list`.
fn remove_each<E: Eq>(list: &mut Vec<E>, other: &[E]) {
    for entry in other {
        if let Some(pos) = list.iter().position(|e| e == entry) {
            list.remove(pos);
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// The entries of one category at one point in time.
pub struct Snapshot<T: SnapshotType> {
    client: Weak<Client>,
    entries: Vec<T::Entry>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: SnapshotType> Snapshot<T> {
    pub fn capture(client: &Arc<Client>) -> Self {
        Self {
            client: Arc::downgrade(client),
            entries: T::capture(client),
            _kind: PhantomData,
        }
    }

    pub fn entries(&self) -> &[T::Entry] {
        &self.entries
    }

    /// `true` when both snapshots were captured from the same client.
    pub fn same_client(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.client, &other.client)
    }

    /// `self - before`, or `None` when the clients differ.
    pub fn difference_from(&self, before: &Self) -> Option<SnapshotDifference<T>> {
        if !self.same_client(before) {
            return None;
        }
        let (added, removed) = T::difference(&before.entries, &self.entries);
        Some(SnapshotDifference {
            client: self.client.clone(),
            added,
            removed,
        })
    }
}

impl<T: SnapshotType> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            entries: self.entries.clone(),
            _kind: PhantomData,
        }
    }
}

impl<T: SnapshotType> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("kind", &T::KIND)
            .field("entries", &self.entries)
            .finish()
    }
}

/// `after - before`.
///
/// # Panics
///
/// When the snapshots were captured from different clients. Use
/// [`Snapshot::difference_from`] to check instead.
impl<T: SnapshotType> Sub<&Snapshot<T>> for &Snapshot<T> {
    type Output = SnapshotDifference<T>;

    fn sub(self, before: &Snapshot<T>) -> SnapshotDifference<T> {
        assert!(
            self.same_client(before),
            "{} snapshots were captured from different clients",
            T::KIND
        );
        let (added, removed) = T::difference(&before.entries, &self.entries);
        SnapshotDifference {
            client: self.client.clone(),
            added,
            removed,
        }
    }
}

// =============================================================================
// SnapshotDifference
// =============================================================================

/// What changed in one category between two snapshots.
pub struct SnapshotDifference<T: SnapshotType> {
    client: Weak<Client>,
    added: Vec<T::Entry>,
    removed: Vec<T::Entry>,
}

impl<T: SnapshotType> SnapshotDifference<T> {
    pub fn added(&self) -> &[T::Entry] {
        &self.added
    }

    pub fn removed(&self) -> &[T::Entry] {
        &self.removed
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Undoes the difference on its client. No-op once the client is gone.
    pub fn revert(&self) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        for entry in self.added.iter().rev() {
            T::revert_added(&client, entry);
        }
        for entry in &self.removed {
            T::revert_removed(&client, entry);
        }
        trace!(
            kind = T::KIND,
            added = self.added.len(),
            removed = self.removed.len(),
            "Snapshot difference reverted"
        );
    }

    /// Drops the part of this difference that `other` accounts for.
    pub fn extract(&mut self, other: &Self) {
        remove_each(&mut self.added, &other.added);
        remove_each(&mut self.removed, &other.removed);
    }

    /// Appends `other`, cancelling additions it removes and removals it adds.
    pub fn merge(&mut self, other: &Self) {
        for entry in &other.added {
            match self.removed.iter().position(|e| e == entry) {
                Some(pos) => {
                    self.removed.remove(pos);
                }
                None => self.added.push(entry.clone()),
            }
        }
        for entry in &other.removed {
            match self.added.iter().position(|e| e == entry) {
                Some(pos) => {
                    self.added.remove(pos);
                }
                None => self.removed.push(entry.clone()),
            }
        }
    }
}

impl<T: SnapshotType> Clone for SnapshotDifference<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            added: self.added.clone(),
            removed: self.removed.clone(),
        }
    }
}

impl<T: SnapshotType> PartialEq for SnapshotDifference<T> {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.client, &other.client)
            && self.added == other.added
            && self.removed == other.removed
    }
}

impl<T: SnapshotType> fmt::Debug for SnapshotDifference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotDifference")
            .field("kind", &T::KIND)
            .field("added", &self.added)
            .field("removed", &self.removed)
            .finish()
    }
}

// =============================================================================
// Type erasure
// =============================================================================

/// A [`Snapshot`] of any category.
pub trait AnySnapshot: Send + Sync {
    fn kind(&self) -> &'static str;
    fn difference_from(&self, before: &dyn AnySnapshot) -> Option<Box<dyn AnyDifference>>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: SnapshotType> AnySnapshot for Snapshot<T> {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn difference_from(&self, before: &dyn AnySnapshot) -> Option<Box<dyn AnyDifference>> {
        let before = before.as_any().downcast_ref::<Snapshot<T>>()?;
        let difference = Snapshot::difference_from(self, before)?;
        Some(Box::new(difference))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A [`SnapshotDifference`] of any category.
pub trait AnyDifference: Send + Sync + fmt::Debug {
    fn kind(&self) -> &'static str;
    fn is_empty(&self) -> bool;
    fn revert(&self);
    /// No-op when `other` is a different category.
    fn extract(&mut self, other: &dyn AnyDifference);
    /// No-op when `other` is a different category.
    fn merge(&mut self, other: &dyn AnyDifference);
    fn clone_box(&self) -> Box<dyn AnyDifference>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: SnapshotType> AnyDifference for SnapshotDifference<T> {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn is_empty(&self) -> bool {
        SnapshotDifference::is_empty(self)
    }

    fn revert(&self) {
        SnapshotDifference::revert(self);
    }

    fn extract(&mut self, other: &dyn AnyDifference) {
        if let Some(other) = other.as_any().downcast_ref::<Self>() {
            SnapshotDifference::extract(self, other);
        }
    }

    fn merge(&mut self, other: &dyn AnyDifference) {
        if let Some(other) = other.as_any().downcast_ref::<Self>() {
            SnapshotDifference::merge(self, other);
        }
    }

    fn clone_box(&self) -> Box<dyn AnyDifference> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A category the loader snapshots.
#[derive(Clone, Copy)]
pub struct SnapshotKind {
    kind: &'static str,
    capture: fn(&Arc<Client>) -> Box<dyn AnySnapshot>,
}

impl SnapshotKind {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn capture(&self, client: &Arc<Client>) -> Box<dyn AnySnapshot> {
        (self.capture)(client)
    }
}

impl fmt::Debug for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SnapshotKind").field(&self.kind).finish()
    }
}

/// The [`SnapshotKind`] for `T`.
pub fn snapshot_kind<T: SnapshotType>() -> SnapshotKind {
    SnapshotKind {
        kind: T::KIND,
        capture: |client| Box::new(Snapshot::<T>::capture(client)),
    }
}

/// Event handlers and commands.
pub fn default_snapshot_kinds() -> Vec<SnapshotKind> {
    vec![snapshot_kind::<EventHandlers>(), snapshot_kind::<Commands>()]
}

// ─── SnapshotSet ─────────────────────────────────────────────────────────────

/// One snapshot per configured category.
pub struct SnapshotSet {
    snapshots: Vec<Box<dyn AnySnapshot>>,
}

impl SnapshotSet {
    pub fn capture(kinds: &[SnapshotKind], client: &Arc<Client>) -> Self {
        Self {
            snapshots: kinds.iter().map(|kind| kind.capture(client)).collect(),
        }
    }

    /// `self - before`, category by category.
    pub fn difference_from(&self, before: &SnapshotSet) -> DifferenceSet {
        let differences = self
            .snapshots
            .iter()
            .filter_map(|after| {
                before
                    .snapshots
                    .iter()
                    .find(|b| b.kind() == after.kind())
                    .and_then(|b| after.difference_from(b.as_ref()))
            })
            .collect();
        DifferenceSet { differences }
    }
}

// ─── DifferenceSet ───────────────────────────────────────────────────────────

/// One difference per configured category.
#[derive(Default)]
pub struct DifferenceSet {
    differences: Vec<Box<dyn AnyDifference>>,
}

impl DifferenceSet {
    pub fn is_empty(&self) -> bool {
        self.differences.iter().all(|d| d.is_empty())
    }

    /// Reverts every category, last captured first.
    pub fn revert(&self) {
        for difference in self.differences.iter().rev() {
            difference.revert();
        }
    }

    /// Drops what `other` accounts for.
    pub fn extract(&mut self, other: &DifferenceSet) {
        for difference in &mut self.differences {
            let kind = difference.kind();
            for theirs in other.differences.iter().filter(|d| d.kind() == kind) {
                difference.extract(theirs.as_ref());
            }
        }
    }

    /// Folds `other` in. Categories missing here are copied over.
    pub fn merge(&mut self, other: &DifferenceSet) {
        for theirs in &other.differences {
            match self
                .differences
                .iter_mut()
                .find(|d| d.kind() == theirs.kind())
            {
                Some(ours) => ours.merge(theirs.as_ref()),
                None => self.differences.push(theirs.clone_box()),
            }
        }
    }

    /// The difference of category `T`.
    pub fn get<T: SnapshotType>(&self) -> Option<&SnapshotDifference<T>> {
        self.differences
            .iter()
            .find_map(|d| d.as_any().downcast_ref::<SnapshotDifference<T>>())
    }
}

impl Clone for DifferenceSet {
    fn clone(&self) -> Self {
        Self {
            differences: self.differences.iter().map(|d| d.clone_box()).collect(),
        }
    }
}

impl fmt::Debug for DifferenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.differences).finish()
    }
}
