//! Reactive Context
//!
//! The reactive context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a store key is read,
//! we can register the current computation as a dependent.
//!
//! # Implementation
//!
//! Each [`Runtime`](super::Runtime) owns one explicit stack. When a
//! computation runs (an effect, a computed recompute, a watcher) its frame is
//! pushed; when the computation completes the frame is popped and the
//! dependencies it collected are handed back to the computation.
//!
//! Because the stack belongs to a runtime instead of a bare thread-local,
//! tests can build isolated runtimes, and nested or re-entrant runs simply
//! stack up. An untracked frame (see [`untracked`](super::untracked)) hides
//! every frame below it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use super::effect::EffectCore;
use super::store::StoreInner;
use super::SubscriberId;

/// One `(store, key)` pair read by a computation.
#[derive(Clone)]
pub(crate) struct Dependency {
    pub(crate) store: Weak<StoreInner>,
    pub(crate) key: Rc<str>,
}

impl Dependency {
    pub(crate) fn same(&self, other: &Dependency) -> bool {
        Weak::ptr_eq(&self.store, &other.store) && self.key == other.key
    }

    pub(crate) fn subscribe(&self, effect: &Rc<EffectCore>) {
        if let Some(store) = self.store.upgrade() {
            store.subscribe(&self.key, effect);
        }
    }

    pub(crate) fn unsubscribe(&self, id: SubscriberId) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(&self.key, id);
        }
    }
}

pub(crate) type Dependencies = SmallVec<[Dependency; 4]>;

/// An entry in the reactive context stack.
struct ContextEntry {
    /// The running computation, or `None` for an untracked frame.
    subscriber: Option<Rc<EffectCore>>,
    /// Dependencies collected during this computation, in first-read order.
    dependencies: Dependencies,
}

/// Explicit stack of running computations.
#[derive(Default)]
pub struct ReactiveContext {
    stack: RefCell<Vec<ContextEntry>>,
}

impl ReactiveContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a tracking frame for `subscriber`.
    ///
    /// The frame is popped when the returned guard is dropped or finished.
    pub(crate) fn enter(&self, subscriber: Rc<EffectCore>) -> ContextGuard<'_> {
        let subscriber_id = Some(subscriber.id());
        self.push(ContextEntry {
            subscriber: Some(subscriber),
            dependencies: Dependencies::new(),
        });
        ContextGuard {
            context: self,
            subscriber_id,
            popped: false,
        }
    }

    /// Push a frame that records nothing.
    pub(crate) fn enter_untracked(&self) -> ContextGuard<'_> {
        self.push(ContextEntry {
            subscriber: None,
            dependencies: Dependencies::new(),
        });
        ContextGuard {
            context: self,
            subscriber_id: None,
            popped: false,
        }
    }

    fn push(&self, entry: ContextEntry) {
        self.stack.borrow_mut().push(entry);
    }

    /// Check if reads are currently being tracked.
    pub fn is_active(&self) -> bool {
        self.current_subscriber().is_some()
    }

    /// Number of frames on the stack, tracked or not.
    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Get the current subscriber ID, if any.
    pub fn current_subscriber(&self) -> Option<SubscriberId> {
        self.stack
            .borrow()
            .last()
            .and_then(|entry| entry.subscriber.as_ref())
            .map(|subscriber| subscriber.id())
    }

    pub(crate) fn current_effect(&self) -> Option<Rc<EffectCore>> {
        self.stack
            .borrow()
            .last()
            .and_then(|entry| entry.subscriber.clone())
    }

    /// Record a dependency in the top frame.
    ///
    /// Returns `false` when the top frame is untracked or already holds it.
    pub(crate) fn track_dependency(&self, dependency: Dependency) -> bool {
        let mut stack = self.stack.borrow_mut();
        let Some(entry) = stack.last_mut() else {
            return false;
        };
        if entry.subscriber.is_none() {
            return false;
        }
        if entry.dependencies.iter().any(|known| known.same(&dependency)) {
            return false;
        }
        entry.dependencies.push(dependency);
        true
    }
}

/// Guard that pops its frame when dropped.
///
/// This keeps the stack balanced even if a computation panics.
pub(crate) struct ContextGuard<'a> {
    context: &'a ReactiveContext,
    subscriber_id: Option<SubscriberId>,
    popped: bool,
}

impl ContextGuard<'_> {
    /// Pop the frame and return what it collected.
    pub(crate) fn finish(mut self) -> Dependencies {
        self.pop().map(|entry| entry.dependencies).unwrap_or_default()
    }

    fn pop(&mut self) -> Option<ContextEntry> {
        if self.popped {
            return None;
        }
        self.popped = true;
        let popped = self.context.stack.borrow_mut().pop();

        // Verify we're popping the right frame.
        if let Some(entry) = &popped {
            let popped_id = entry.subscriber.as_ref().map(|subscriber| subscriber.id());
            debug_assert_eq!(
                popped_id, self.subscriber_id,
                "ReactiveContext mismatch: expected {:?}, got {:?}",
                self.subscriber_id, popped_id
            );
        }
        popped
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.pop();
    }
}
