//! Computed Properties
//!
//! A computed is a cached derived key on a store that re-evaluates only when
//! its dependencies change.
//!
//! # How Computeds Work
//!
//! 1. Defining a computed installs an accessor slot. Nothing is evaluated
//!    until the key is first read.
//!
//! 2. Reading the key while clean returns the cached value.
//!
//! 3. When a dependency changes, the computed's lazy effect does not re-run;
//!    its scheduler marks the cache dirty and, on the clean -> dirty edge,
//!    notifies the subscribers of the computed key itself.
//!
//! 4. The next read of a dirty computed recomputes (re-tracking
//!    dependencies) and marks it clean.
//!
//! # Why This Matters
//!
//! - A key changes
//! - 10 computeds depend on it
//! - Only the computeds actually read will recompute
//! - Computeds that are never read stay dirty (no wasted work)
//!
//! Because dirtiness is forwarded through the computed's own key, a chain of
//! computeds (a DAG) is dirtied transitively without recomputing anything,
//! and an effect reading the end of the chain re-runs and pulls fresh values.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::error;

use super::effect::{EffectCore, Scheduler};
use super::store::{Store, WeakStore};
use super::value::Value;
use crate::error::Result;

/// Boxed computed body, used where several bodies are passed together.
pub type ComputeFn = Box<dyn Fn(&Store) -> Value>;

/// Dirty state for a computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputedState {
    /// The cached value is up-to-date.
    Clean,

    /// A dependency changed, or the value was never computed.
    Dirty,
}

struct Cache {
    value: RefCell<Value>,
    state: Cell<ComputedState>,
    /// Set while the body runs; a read in that window is a cycle.
    computing: Cell<bool>,
}

pub(crate) struct ComputedCell {
    name: Rc<str>,
    effect: Rc<EffectCore>,
    cache: Rc<Cache>,
}

impl ComputedCell {
    fn new(store: &Store, name: &str, compute: Rc<dyn Fn(&Store) -> Value>) -> Rc<Self> {
        let name: Rc<str> = Rc::from(name);
        let cache = Rc::new(Cache {
            value: RefCell::new(Value::Null),
            state: Cell::new(ComputedState::Dirty),
            computing: Cell::new(false),
        });
        let weak = store.downgrade();

        let run = {
            let cache = Rc::clone(&cache);
            let weak = weak.clone();
            move || -> Result<()> {
                if let Some(store) = weak.upgrade() {
                    let value = compute(&store);
                    cache.value.replace(value);
                }
                cache.state.set(ComputedState::Clean);
                Ok(())
            }
        };

        let scheduler: Scheduler = {
            let cache = Rc::clone(&cache);
            let name = Rc::clone(&name);
            Rc::new(move || mark_dirty(&cache, &weak, &name))
        };

        let effect = EffectCore::new(
            store.runtime(),
            Rc::new(run),
            Some(scheduler),
            Some(format!("computed:{name}")),
        );

        Rc::new(Self {
            name,
            effect,
            cache,
        })
    }

    /// Return the cached value, recomputing first if dirty.
    ///
    /// A computed that reads itself, directly or through other computeds,
    /// gets its previous cached value (initially null) for the inner read.
    pub(crate) fn read(&self) -> Value {
        if self.cache.state.get() == ComputedState::Dirty {
            if self.cache.computing.replace(true) {
                error!(computed = &*self.name, "computed depends on itself; serving cached value");
            } else {
                let result = self.effect.execute();
                self.cache.computing.set(false);
                if let Err(error) = result {
                    error!(computed = &*self.name, %error, "recompute failed; serving stale value");
                }
            }
        }
        self.cache.value.borrow().clone()
    }

    pub(crate) fn state(&self) -> ComputedState {
        self.cache.state.get()
    }

    /// Stop tracking; the cached value stays readable.
    pub(crate) fn dispose(&self) {
        self.effect.dispose();
    }
}

fn mark_dirty(cache: &Cache, store: &WeakStore, name: &str) -> Result<()> {
    if cache.state.replace(ComputedState::Dirty) == ComputedState::Dirty {
        return Ok(());
    }
    match store.upgrade() {
        Some(store) => store.trigger(name),
        None => Ok(()),
    }
}

impl Store {
    /// Define a single computed key.
    ///
    /// ```rust
    /// use trellis_core::{state, Value};
    ///
    /// let s = state(serde_json::json!({ "price": 10, "qty": 2 })).unwrap();
    /// s.define_computed("total", |s| {
    ///     let price = s.get("price").as_f64().unwrap_or_default();
    ///     let qty = s.get("qty").as_f64().unwrap_or_default();
    ///     Value::from(price * qty)
    /// })
    /// .unwrap();
    ///
    /// s.set("qty", 3).unwrap();
    /// assert_eq!(s.get("total"), Value::from(30));
    /// ```
    pub fn define_computed<F>(&self, name: &str, compute: F) -> Result<&Self>
    where
        F: Fn(&Store) -> Value + 'static,
    {
        let cell = ComputedCell::new(self, name, Rc::new(compute));
        self.install_computed(name, cell)?;
        Ok(self)
    }

    /// Cache state of the computed `name`, or `None` if it is not computed.
    pub fn computed_state(&self, name: &str) -> Option<ComputedState> {
        self.computed_cell(name).map(|cell| cell.state())
    }
}

/// Define several computed keys on `store`, returning it for chaining.
///
/// A definition that replaces an existing key notifies that key's
/// subscribers; the first error from one of them stops the remaining
/// definitions and is returned.
pub fn computed<I, K>(store: &Store, defs: I) -> Result<Store>
where
    I: IntoIterator<Item = (K, ComputeFn)>,
    K: AsRef<str>,
{
    for (name, compute) in defs {
        store.define_computed(name.as_ref(), compute)?;
    }
    Ok(store.clone())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
