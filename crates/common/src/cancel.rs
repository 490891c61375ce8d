//! Hierarchical cancellation.
//!
//! A [`CancelScope`] is a node in a tree. Cancelling a node cancels every
//! descendant; cancelling a child leaves its parent and siblings untouched.
//! A child created under an already-cancelled parent starts cancelled.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

#[derive(Debug)]
struct ScopeNode {
    label: String,
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<ScopeNode>>>,
}

impl ScopeNode {
    fn new(label: String) -> Arc<Self> {
        Arc::new(Self {
            label,
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// Cloneable handle to one node of the cancellation tree.
#[derive(Debug, Clone)]
pub struct CancelScope {
    node: Arc<ScopeNode>,
}

impl CancelScope {
    /// Create a new root scope.
    pub fn root(label: impl Into<String>) -> Self {
        Self {
            node: ScopeNode::new(label.into()),
        }
    }

    /// Create a child scope, cancelled whenever this scope is.
    pub fn child(&self, label: impl Into<String>) -> Self {
        let child = ScopeNode::new(label.into());
        {
            let mut children = self.node.children.lock();
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // Parent may have been cancelled between creation and registration.
        if self.is_cancelled() {
            child.cancel();
        }
        Self { node: child }
    }

    pub fn label(&self) -> &str {
        &self.node.label
    }

    /// Cancel this scope and all of its descendants. Idempotent.
    pub fn cancel(&self) {
        if !self.is_cancelled() {
            tracing::trace!(scope = %self.node.label, "cancel scope");
        }
        self.node.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once this scope is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.node.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Number of live (not yet dropped) direct children.
    pub fn child_count(&self) -> usize {
        self.node
            .children
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_propagates_to_descendants() {
        let realm = CancelScope::root("realm");
        let load = realm.child("load");
        let nested = load.child("nested");
        realm.cancel();
        assert!(load.is_cancelled());
        assert!(nested.is_cancelled());
    }

    #[test]
    fn child_cancel_leaves_parent_and_siblings() {
        let realm = CancelScope::root("realm");
        let teleport = realm.child("teleport");
        let load = realm.child("load");
        teleport.cancel();
        assert!(teleport.is_cancelled());
        assert!(!realm.is_cancelled());
        assert!(!load.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let realm = CancelScope::root("realm");
        realm.cancel();
        assert!(realm.child("late").is_cancelled());
    }

    #[test]
    fn dropped_children_are_pruned() {
        let realm = CancelScope::root("realm");
        {
            let _a = realm.child("a");
            let _b = realm.child("b");
            assert_eq!(realm.child_count(), 2);
        }
        assert_eq!(realm.child_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_future_wakes_waiter() {
        let realm = CancelScope::root("realm");
        let cell = realm.child("cell");
        let waiter = tokio::spawn({
            let cell = cell.clone();
            async move { cell.cancelled().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        realm.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_future_ready_when_already_cancelled() {
        let scope = CancelScope::root("done");
        scope.cancel();
        tokio::time::timeout(Duration::from_millis(100), scope.cancelled())
            .await
            .expect("already cancelled scope resolves immediately");
    }
}
