//! Dependency readiness policy and the in-memory dependency graph.
//!
//! Readiness of a waiting task is decided only from the statuses at the other
//! end of its incoming edges:
//! - no incoming edges => ready
//! - every `prev` is `success` => ready
//! - any `prev` is `broken` or `error` => upstream failed (task becomes broken)
//! - otherwise => keep waiting; re-checked on the next sweep

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{TaskDependency, TaskId, TaskStatus};

/// Verdict for one waiting task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    UpstreamFailed { prev: TaskId, edge: String },
}

impl Readiness {
    /// Evaluate incoming edges, given the current status of each `prev`.
    ///
    /// A failed prerequisite wins over a waiting one: the task can never run,
    /// so there is no point in waiting for the rest.
    pub fn evaluate<'a, I>(incoming: I) -> Self
    where
        I: IntoIterator<Item = (&'a TaskDependency, TaskStatus)>,
    {
        let mut waiting = false;
        for (edge, status) in incoming {
            match status {
                TaskStatus::Success => {}
                TaskStatus::Broken | TaskStatus::Error => {
                    return Readiness::UpstreamFailed {
                        prev: edge.prev.clone(),
                        edge: edge.name.clone(),
                    };
                }
                TaskStatus::Pending | TaskStatus::Deferred | TaskStatus::Running => {
                    waiting = true;
                }
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Dependency graph for tracking task dependencies.
///
/// This graph maintains both directions for cheap lookups:
/// - `incoming`: next -> edges pointing at it (what it waits for)
/// - `outgoing`: prev -> tasks waiting for it
///
/// Invariant: both maps describe the same edge set.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    incoming: HashMap<TaskId, Vec<TaskDependency>>,
    outgoing: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an edge. Returns `false` if the exact `(prev, next, name)` edge already existed.
    pub fn add(&mut self, edge: TaskDependency) -> bool {
        let edges = self.incoming.entry(edge.next.clone()).or_default();
        if edges.contains(&edge) {
            return false;
        }
        self.outgoing
            .entry(edge.prev.clone())
            .or_default()
            .insert(edge.next.clone());
        edges.push(edge);
        true
    }

    /// Edges pointing at `task`.
    pub fn incoming(&self, task: &TaskId) -> &[TaskDependency] {
        self.incoming.get(task).map(Vec::as_slice).unwrap_or_default()
    }

    /// Tasks that depend directly on `task`.
    pub fn dependents(&self, task: &TaskId) -> Vec<TaskId> {
        self.outgoing
            .get(task)
            .map(|next| next.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Edges leaving `task`.
    pub fn outgoing_edges(&self, task: &TaskId) -> Vec<TaskDependency> {
        self.dependents(task)
            .into_iter()
            .flat_map(|next| {
                self.incoming(&next)
                    .iter()
                    .filter(|e| &e.prev == task)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Would adding `prev -> next` close a cycle?
    ///
    /// True when `prev` is already reachable from `next` (or they are equal).
    pub fn would_cycle(&self, prev: &TaskId, next: &TaskId) -> bool {
        self.would_cycle_with(prev, next, &[])
    }

    /// [`would_cycle`](Self::would_cycle), counting `staged` edges as present.
    pub fn would_cycle_with(&self, prev: &TaskId, next: &TaskId, staged: &[TaskDependency]) -> bool {
        if prev == next {
            return true;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([next.clone()]);
        while let Some(node) = queue.pop_front() {
            if &node == prev {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            queue.extend(self.dependents(&node));
            queue.extend(
                staged
                    .iter()
                    .filter(|edge| edge.prev == node)
                    .map(|edge| edge.next.clone()),
            );
        }
        false
    }

    /// Breadth-first walk over dependents of `root`, descending only into
    /// nodes accepted by `visit`. `root` itself is not visited.
    pub fn walk_dependents<F>(&self, root: &TaskId, mut visit: F) -> Vec<TaskId>
    where
        F: FnMut(&TaskId) -> bool,
    {
        let mut accepted = Vec::new();
        let mut seen = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from(self.dependents(root));
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            if visit(&node) {
                queue.extend(self.dependents(&node));
                accepted.push(node);
            }
        }
        accepted
    }
}
