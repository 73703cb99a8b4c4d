//! Subscriber identity and disposal handles.
//!
//! Every computation that can depend on store keys (effects, computeds,
//! watchers, async effects) gets a [`SubscriberId`]. Subscriber sets on a
//! store are keyed by this ID, which is how a disposed computation is found
//! and removed again.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a subscriber.
///
/// Each subscriber gets a unique ID when created. This ID is used to track
/// dependencies and avoid duplicate subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Idempotent teardown handle returned by every reactive constructor.
///
/// Clones share the same teardown; whichever clone is disposed first runs
/// it and every later call is a no-op. Dropping a `Disposer` does **not**
/// dispose anything.
#[derive(Clone)]
pub struct Disposer(Rc<RefCell<Option<Box<dyn FnOnce()>>>>);

impl Disposer {
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self(Rc::new(RefCell::new(Some(Box::new(teardown)))))
    }

    /// A disposer that owns nothing.
    pub fn noop() -> Self {
        Self(Rc::new(RefCell::new(None)))
    }

    /// Combine several disposers into one that disposes each in order.
    pub fn merge(parts: impl IntoIterator<Item = Disposer>) -> Self {
        let parts: Vec<Disposer> = parts.into_iter().collect();
        Self::new(move || {
            for part in &parts {
                part.dispose();
            }
        })
    }

    /// Runs the teardown at most once.
    pub fn dispose(&self) {
        let teardown = self.0.borrow_mut().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.0.borrow().is_none()
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
