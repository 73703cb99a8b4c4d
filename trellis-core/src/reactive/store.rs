//! Store Implementation
//!
//! A Store is the fundamental reactive primitive: a keyed object (or array)
//! whose reads and writes go through an explicit capability interface so
//! that they can be intercepted.
//!
//! # How Stores Work
//!
//! 1. When a key is read within a running computation, the store registers
//!    that computation as a subscriber of the key.
//!
//! 2. When a key's value changes, every current subscriber of that key is
//!    run synchronously, in registration order, before `set` returns.
//!
//! 3. Writing a value strictly equal to the current one does nothing.
//!
//! # Nested Data
//!
//! A store built from JSON keeps nested objects and arrays as raw JSON until
//! they are first read. The first read wraps the raw value into a child
//! store and replaces the slot with it, so every later read returns the
//! identical child.
//!
//! # Memory Layout
//!
//! Each store consists of:
//! - A unique ID
//! - The ordered entries (`IndexMap<key, slot>`)
//! - Per key, the ordered set of subscribed computations

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde_json::{Map, Value as JsonValue};
use tracing::trace;

use super::computed::ComputedCell;
use super::context::Dependency;
use super::effect::EffectCore;
use super::runtime::Runtime;
use super::value::Value;
use super::SubscriberId;
use crate::error::{Error, Result};

/// Pseudo-key under which an array store tracks its length.
pub const LENGTH_KEY: &str = "length";

/// Counter for generating unique store IDs.
static STORE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_store_id() -> u64 {
    STORE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Object,
    Array,
}

/// Nested JSON not yet wrapped into a store.
pub(crate) enum RawContainer {
    Object(Map<String, JsonValue>),
    Array(Vec<JsonValue>),
}

pub(crate) enum Slot {
    Ready(Value),
    Raw(RawContainer),
    Computed(Rc<ComputedCell>),
}

impl Slot {
    fn from_json(json: JsonValue) -> Slot {
        match json {
            JsonValue::Object(map) => Slot::Raw(RawContainer::Object(map)),
            JsonValue::Array(items) => Slot::Raw(RawContainer::Array(items)),
            scalar => Slot::Ready(Value::from_json_scalar(&scalar)),
        }
    }
}

type SubscriberSet = IndexMap<SubscriberId, Rc<EffectCore>>;

pub(crate) struct StoreInner {
    id: u64,
    kind: StoreKind,
    runtime: Runtime,
    entries: RefCell<IndexMap<Rc<str>, Slot>>,
    subscribers: RefCell<HashMap<Rc<str>, SubscriberSet>>,
}

impl StoreInner {
    pub(crate) fn subscribe(&self, key: &Rc<str>, effect: &Rc<EffectCore>) {
        self.subscribers
            .borrow_mut()
            .entry(Rc::clone(key))
            .or_default()
            .entry(effect.id())
            .or_insert_with(|| Rc::clone(effect));
    }

    pub(crate) fn unsubscribe(&self, key: &str, id: SubscriberId) {
        let mut subscribers = self.subscribers.borrow_mut();
        if let Some(set) = subscribers.get_mut(key) {
            set.shift_remove(&id);
            if set.is_empty() {
                subscribers.remove(key);
            }
        }
    }
}

/// A reactive object or array.
///
/// `Store` is a cheap handle; clones refer to the same data.
///
/// # Example
///
/// ```rust
/// use trellis_core::{effect, state};
/// use std::{cell::Cell, rc::Rc};
///
/// let s = state(serde_json::json!({ "count": 0 })).unwrap();
/// let seen = Rc::new(Cell::new(0.0));
///
/// let reader = s.clone();
/// let sink = seen.clone();
/// let _stop = effect(move || {
///     sink.set(reader.get("count").as_f64().unwrap_or_default());
///     Ok(())
/// })
/// .unwrap();
///
/// s.set("count", 5).unwrap();
/// assert_eq!(seen.get(), 5.0);
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

/// Non-owning store handle used by computations that must not keep their
/// store alive.
#[derive(Clone)]
pub(crate) struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|inner| Store { inner })
    }
}

impl Store {
    /// Build a store from a JSON object or array.
    pub fn from_json(runtime: &Runtime, json: JsonValue) -> Result<Self> {
        match json {
            JsonValue::Object(map) => Ok(Self::from_raw(runtime, RawContainer::Object(map))),
            JsonValue::Array(items) => Ok(Self::from_raw(runtime, RawContainer::Array(items))),
            JsonValue::Null => Err(Error::NotAContainer { found: "null" }),
            JsonValue::Bool(_) => Err(Error::NotAContainer { found: "bool" }),
            JsonValue::Number(_) => Err(Error::NotAContainer { found: "number" }),
            JsonValue::String(_) => Err(Error::NotAContainer { found: "string" }),
        }
    }

    fn from_raw(runtime: &Runtime, raw: RawContainer) -> Self {
        let (kind, entries): (StoreKind, IndexMap<Rc<str>, Slot>) = match raw {
            RawContainer::Object(map) => (
                StoreKind::Object,
                map.into_iter()
                    .map(|(key, json)| (Rc::from(key), Slot::from_json(json)))
                    .collect(),
            ),
            RawContainer::Array(items) => (
                StoreKind::Array,
                items
                    .into_iter()
                    .enumerate()
                    .map(|(index, json)| (Rc::from(index.to_string()), Slot::from_json(json)))
                    .collect(),
            ),
        };

        Self {
            inner: Rc::new(StoreInner {
                id: next_store_id(),
                kind,
                runtime: runtime.clone(),
                entries: RefCell::new(entries),
                subscribers: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> StoreKind {
        self.inner.kind
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn ptr_eq(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn inner(&self) -> &Rc<StoreInner> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore(Rc::downgrade(&self.inner))
    }

    /// Read `key`, registering the running computation as a subscriber.
    ///
    /// Missing keys read as `Value::Null` and are tracked all the same, so a
    /// computation re-runs once the key appears.
    pub fn get(&self, key: &str) -> Value {
        self.track(key);
        self.read_slot(key)
    }

    /// Read `key` without tracking it.
    pub fn get_untracked(&self, key: &str) -> Value {
        self.read_slot(key)
    }

    /// Read an array element.
    pub fn get_index(&self, index: usize) -> Value {
        self.get(&index.to_string())
    }

    /// Write `value` to `key` and notify subscribers if it changed.
    ///
    /// Errors raised by plain effects and watchers subscribed to `key`
    /// propagate out of this call, and stop the remaining subscribers of
    /// the key from running for this write.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.write_slot(key, Slot::Ready(value.into()))
    }

    /// Write JSON to `key`. Nested objects and arrays are wrapped lazily.
    pub fn set_json(&self, key: &str, json: JsonValue) -> Result<()> {
        self.write_slot(key, Slot::from_json(json))
    }

    /// Write the result of `f` applied to the current (untracked) value.
    pub fn update(&self, key: &str, f: impl FnOnce(&Value) -> Value) -> Result<()> {
        let next = f(&self.get_untracked(key));
        self.set(key, next)
    }

    /// Remove `key`, notifying its subscribers if it existed.
    ///
    /// On an array store, removing an index shifts every later element down
    /// by one, so indexes stay contiguous.
    pub fn remove(&self, key: &str) -> Result<Option<Value>> {
        if self.inner.kind == StoreKind::Array {
            if let Ok(index) = key.parse::<usize>() {
                return self.remove_index(index);
            }
        }
        let removed = {
            let mut entries = self.inner.entries.borrow_mut();
            if matches!(entries.get(key), Some(Slot::Computed(_))) {
                return Err(read_only(key));
            }
            entries.shift_remove_entry(key)
        };
        let Some((key, slot)) = removed else {
            return Ok(None);
        };
        let previous = self.slot_value(slot);

        self.trigger(&key)?;
        self.trigger_length()?;
        Ok(Some(previous))
    }

    fn remove_index(&self, index: usize) -> Result<Option<Value>> {
        let (slot, moved) = {
            let mut entries = self.inner.entries.borrow_mut();
            let Some(position) = entries.get_index_of(index.to_string().as_str()) else {
                return Ok(None);
            };
            if let Some((key, Slot::Computed(_))) = entries.get_index(position) {
                return Err(read_only(key));
            }

            let mut tail = entries.drain(position..).collect::<Vec<_>>().into_iter();
            let Some((removed_key, slot)) = tail.next() else {
                return Ok(None);
            };
            // Every index from the removed one to the old last one now holds
            // a different element (or nothing).
            let mut moved = vec![removed_key];
            let mut next = index;
            for (key, slot) in tail {
                if key.parse::<usize>().is_ok() {
                    moved.push(key);
                    entries.insert(self.subscribed_key(&next.to_string()), slot);
                    next += 1;
                } else {
                    entries.insert(key, slot);
                }
            }
            (slot, moved)
        };
        let previous = self.slot_value(slot);
        trace!(store = self.inner.id, index, shifted = moved.len() - 1, "removed array element");

        for key in &moved {
            self.trigger(key)?;
        }
        self.trigger_length()?;
        Ok(Some(previous))
    }

    fn slot_value(&self, slot: Slot) -> Value {
        match slot {
            Slot::Ready(value) => value,
            Slot::Raw(raw) => Value::Object(Store::from_raw(&self.inner.runtime, raw)),
            Slot::Computed(_) => Value::Null,
        }
    }

    /// Append to an array store.
    pub fn push(&self, value: impl Into<Value>) -> Result<()> {
        if self.inner.kind != StoreKind::Array {
            return Err(Error::msg(format!(
                "push requires an array store, store {} is an object",
                self.inner.id
            )));
        }
        let index = self.inner.entries.borrow().len();
        self.set(&index.to_string(), value)
    }

    /// Tracked membership test.
    pub fn contains_key(&self, key: &str) -> bool {
        self.track(key);
        self.inner.entries.borrow().contains_key(key)
    }

    /// Current keys in insertion order. Not tracked.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .entries
            .borrow()
            .keys()
            .map(|key| key.to_string())
            .collect()
    }

    /// Number of entries. Tracked under [`LENGTH_KEY`] for arrays.
    pub fn len(&self) -> usize {
        if self.inner.kind == StoreKind::Array {
            self.track(LENGTH_KEY);
        }
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Plain JSON copy of the store. Reads every key, so a computation that
    /// snapshots a store depends on all of it.
    pub fn snapshot(&self) -> JsonValue {
        let keys: Vec<Rc<str>> = self.inner.entries.borrow().keys().cloned().collect();
        match self.inner.kind {
            StoreKind::Object => {
                let mut map = Map::with_capacity(keys.len());
                for key in keys {
                    map.insert(key.to_string(), self.get(&key).to_json());
                }
                JsonValue::Object(map)
            }
            StoreKind::Array => {
                self.track(LENGTH_KEY);
                JsonValue::Array(keys.iter().map(|key| self.get(key).to_json()).collect())
            }
        }
    }

    /// Number of active computations subscribed to `key`.
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner
            .subscribers
            .borrow()
            .get(key)
            .map_or(0, |set| set.len())
    }

    /// Install a computed accessor under `name`.
    pub(crate) fn install_computed(&self, name: &str, cell: Rc<ComputedCell>) -> Result<()> {
        let previous = {
            let mut entries = self.inner.entries.borrow_mut();
            let key = match entries.get_key_value(name) {
                Some((known, _)) => Rc::clone(known),
                None => self.subscribed_key(name),
            };
            entries.insert(key, Slot::Computed(cell))
        };
        match previous {
            None => self.trigger_length(),
            Some(previous) => {
                if let Slot::Computed(replaced) = previous {
                    replaced.dispose();
                }
                self.trigger(name)
            }
        }
    }

    pub(crate) fn computed_cell(&self, name: &str) -> Option<Rc<ComputedCell>> {
        match self.inner.entries.borrow().get(name) {
            Some(Slot::Computed(cell)) => Some(Rc::clone(cell)),
            _ => None,
        }
    }

    /// Notify every current subscriber of `key`, in registration order.
    pub(crate) fn trigger(&self, key: &str) -> Result<()> {
        let subscribers: Vec<Rc<EffectCore>> = self
            .inner
            .subscribers
            .borrow()
            .get(key)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();
        if subscribers.is_empty() {
            return Ok(());
        }

        let _update = self.inner.runtime.enter_update(key)?;
        trace!(
            store = self.inner.id,
            key,
            subscribers = subscribers.len(),
            "notifying subscribers"
        );
        for subscriber in subscribers {
            // Skip subscribers disposed by an earlier one during this write.
            if subscriber.is_active() {
                subscriber.notify()?;
            }
        }
        Ok(())
    }

    fn trigger_length(&self) -> Result<()> {
        if self.inner.kind == StoreKind::Array {
            self.trigger(LENGTH_KEY)?;
        }
        Ok(())
    }

    fn track(&self, key: &str) {
        let context = self.inner.runtime.context();
        let Some(effect) = context.current_effect() else {
            return;
        };
        if !effect.is_active() {
            return;
        }

        let key = self.intern(key);
        let dependency = Dependency {
            store: Rc::downgrade(&self.inner),
            key: Rc::clone(&key),
        };
        if context.track_dependency(dependency) {
            self.inner.subscribe(&key, &effect);
        }
    }

    fn intern(&self, key: &str) -> Rc<str> {
        if let Some((known, _)) = self.inner.entries.borrow().get_key_value(key) {
            return Rc::clone(known);
        }
        self.subscribed_key(key)
    }

    fn subscribed_key(&self, key: &str) -> Rc<str> {
        self.inner
            .subscribers
            .borrow()
            .get_key_value(key)
            .map_or_else(|| Rc::from(key), |(known, _)| Rc::clone(known))
    }

    fn read_slot(&self, key: &str) -> Value {
        let computed = {
            let mut entries = self.inner.entries.borrow_mut();
            let length = entries.len();
            let Some(slot) = entries.get_mut(key) else {
                if self.inner.kind == StoreKind::Array && key == LENGTH_KEY {
                    return Value::from(length);
                }
                return Value::Null;
            };
            if matches!(slot, Slot::Raw(_)) {
                let Slot::Raw(raw) = std::mem::replace(slot, Slot::Ready(Value::Null)) else {
                    return Value::Null;
                };
                let child = Value::Object(Store::from_raw(&self.inner.runtime, raw));
                trace!(store = self.inner.id, key, "wrapped nested value");
                *slot = Slot::Ready(child.clone());
                return child;
            }
            match slot {
                Slot::Ready(value) => return value.clone(),
                Slot::Computed(cell) => Rc::clone(cell),
                Slot::Raw(_) => return Value::Null,
            }
        };
        // The entries borrow is released: recomputing reads this store again.
        computed.read()
    }

    fn write_slot(&self, key: &str, slot: Slot) -> Result<()> {
        if self.inner.kind == StoreKind::Array && key == LENGTH_KEY {
            return Err(read_only(key));
        }

        let (key, inserted) = {
            let mut entries = self.inner.entries.borrow_mut();
            match entries.get_full_mut(key) {
                Some((_, known, current)) => {
                    match (&*current, &slot) {
                        (Slot::Computed(_), _) => return Err(read_only(key)),
                        (Slot::Ready(old), Slot::Ready(new)) if old.strict_eq(new) => {
                            return Ok(());
                        }
                        _ => {}
                    }
                    let known = Rc::clone(known);
                    *current = slot;
                    (known, false)
                }
                None => {
                    // Arrays stay contiguous: a write past the end leaves
                    // null holes in between.
                    if self.inner.kind == StoreKind::Array {
                        if let Ok(index) = key.parse::<usize>() {
                            for hole in entries.len()..index {
                                let hole = self.subscribed_key(&hole.to_string());
                                entries.entry(hole).or_insert(Slot::Ready(Value::Null));
                            }
                        }
                    }
                    let key = self.subscribed_key(key);
                    entries.insert(Rc::clone(&key), slot);
                    (key, true)
                }
            }
        };

        self.trigger(&key)?;
        if inserted {
            self.trigger_length()?;
        }
        Ok(())
    }
}

impl Runtime {
    /// Wrap a JSON object or array into a store bound to this runtime.
    pub fn state(&self, json: JsonValue) -> Result<Store> {
        Store::from_json(self, json)
    }
}

/// Wrap a JSON object or array into a store on the current thread's runtime.
///
/// Scalars are rejected with `Error::NotAContainer`.
pub fn state(json: JsonValue) -> Result<Store> {
    Runtime::current().state(json)
}

fn read_only(key: &str) -> Error {
    Error::ReadOnly {
        key: key.to_owned(),
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("len", &self.inner.entries.borrow().len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
