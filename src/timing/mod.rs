//! Nested stage timing, collected per run and mergeable across tiers.
//!
//! A [`TimingLog`] is a forest of [`Stage`] nodes. Each stage records a name
//! and a start/end time; ending a stage recursively ends any children still
//! open. Stages are safe to share across tasks: all mutation goes through a
//! per-node `Mutex`, and no node's lock is held while acquiring another's.

use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// A single node in the timing forest.
///
/// Cloning a `Stage` clones the handle (an `Arc`-like shared node), not the
/// data; all clones observe the same underlying state.
#[derive(Debug, Clone)]
pub struct Stage {
    inner: std::sync::Arc<Mutex<StageData>>,
}

#[derive(Debug)]
struct StageData {
    name: String,
    start: SystemTime,
    end: Option<SystemTime>,
    children: Vec<Stage>,
}

/// A snapshot of a [`Stage`] suitable for serialization (`timing.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSnapshot {
    /// The stage's name.
    pub name: String,
    /// Start time, as seconds since the Unix epoch.
    pub start_unix_secs: u64,
    /// End time, as seconds since the Unix epoch, if the stage has ended.
    pub end_unix_secs: Option<u64>,
    /// Child stages, in creation order.
    pub children: Vec<StageSnapshot>,
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Stage {
    /// Creates a new, open stage named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(StageData {
                name: name.into(),
                start: SystemTime::now(),
                end: None,
                children: Vec::new(),
            })),
        }
    }

    /// Opens a new child stage under `self` and returns it.
    pub fn start_child(&self, name: impl Into<String>) -> Stage {
        let child = Stage::new(name);
        let mut guard = lock(&self.inner);
        guard.children.push(child.clone());
        child
    }

    /// Ends this stage, and recursively ends any still-open children.
    ///
    /// Ending an already-ended stage is a no-op: repeated `end()` calls do
    /// not overwrite the original end time or double-close children.
    pub fn end(&self) {
        let mut guard = lock(&self.inner);
        if guard.end.is_some() {
            return;
        }
        guard.end = Some(SystemTime::now());
        let children: Vec<Stage> = guard.children.clone();
        drop(guard);
        for child in children {
            child.end();
        }
    }

    /// Whether this stage has ended.
    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(&self.inner).end.is_none()
    }

    /// Splices another stage's children in as children of `self`.
    ///
    /// Used to merge a subordinate tier's timing log (e.g. the bundle's)
    /// into the driver's open stage for the corresponding operation.
    ///
    /// # Errors
    ///
    /// Returns an error if `self` has already ended.
    pub fn merge(&self, other: &Stage) -> Result<(), MergeError> {
        let mut guard = lock(&self.inner);
        if guard.end.is_some() {
            return Err(MergeError::TargetClosed);
        }
        let other_children = lock(&other.inner).children.clone();
        guard.children.extend(other_children);
        Ok(())
    }

    /// Produces a serializable snapshot of this stage and its descendants.
    #[must_use]
    pub fn snapshot(&self) -> StageSnapshot {
        let guard = lock(&self.inner);
        StageSnapshot {
            name: guard.name.clone(),
            start_unix_secs: unix_secs(guard.start),
            end_unix_secs: guard.end.map(unix_secs),
            children: guard.children.iter().map(Stage::snapshot).collect(),
        }
    }
}

/// Locks `mutex`, recovering the guard from a poisoned lock rather than
/// panicking: a panic while a stage's data is briefly locked (e.g. during a
/// `clone()` of its children) should not take down every other stage sharing
/// the timing forest.
fn lock(mutex: &Mutex<StageData>) -> std::sync::MutexGuard<'_, StageData> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Error returned by [`Stage::merge`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MergeError {
    /// The target stage has already ended and cannot accept new children.
    #[error("cannot merge into a closed stage")]
    TargetClosed,
}

/// The root of a run's timing forest.
#[derive(Debug, Clone)]
pub struct TimingLog {
    root: Stage,
}

impl Default for TimingLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TimingLog {
    /// Creates a new timing log with an open root stage named `"run"`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Stage::new("run"),
        }
    }

    /// Returns the root stage.
    #[must_use]
    pub const fn root(&self) -> &Stage {
        &self.root
    }

    /// Serializes the full forest.
    #[must_use]
    pub fn snapshot(&self) -> StageSnapshot {
        self.root.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn ending_a_stage_closes_open_children() {
        let root = Stage::new("root");
        let child = root.start_child("child");
        let grandchild = child.start_child("grandchild");

        root.end();

        assert!(!child.is_open());
        assert!(!grandchild.is_open());
    }

    #[rstest]
    fn ending_twice_is_idempotent() {
        let stage = Stage::new("s");
        stage.end();
        let first = stage.snapshot().end_unix_secs;
        stage.end();
        assert_eq!(stage.snapshot().end_unix_secs, first);
    }

    #[rstest]
    fn merge_splices_children_into_open_target() {
        let target = Stage::new("target");
        let source = Stage::new("source");
        source.start_child("a");
        source.start_child("b");

        target.merge(&source).expect("merge should succeed");

        assert_eq!(target.snapshot().children.len(), 2);
    }

    #[rstest]
    fn merge_into_closed_stage_fails() {
        let target = Stage::new("target");
        target.end();
        let source = Stage::new("source");

        let result = target.merge(&source);

        assert_eq!(result, Err(MergeError::TargetClosed));
    }

    #[rstest]
    fn snapshot_preserves_child_order() {
        let root = Stage::new("root");
        root.start_child("first");
        root.start_child("second");

        let names: Vec<String> = root
            .snapshot()
            .children
            .into_iter()
            .map(|c| c.name)
            .collect();

        assert_eq!(names, vec!["first".to_owned(), "second".to_owned()]);
    }
}
