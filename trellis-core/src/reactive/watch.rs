//! Watchers
//!
//! A watcher observes one key (or one tracked expression) of a store and
//! calls back with `(new, old)` whenever the observed value changes.
//!
//! The first run only records a baseline. Every later run compares the fresh
//! value against the stored one with strict equality, stores the fresh value,
//! and calls back if they differ. Callbacks run untracked: whatever they read
//! does not become a dependency of the watcher.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use super::effect::{Effect, EffectOptions};
use super::store::Store;
use super::subscriber::Disposer;
use super::value::Value;
use crate::error::Result;

/// Boxed watch callback, used where several callbacks are passed together.
pub type WatchFn = Box<dyn Fn(&Value, &Value) -> Result<()>>;

pub(crate) type ChangeFn = Rc<dyn Fn(&Value, &Value) -> Result<()>>;

/// What a watcher observes.
#[derive(Clone)]
pub enum WatchSource {
    /// A single key of the watched store.
    Key(String),
    /// An expression over the store. Every key it reads is tracked.
    Getter(Rc<dyn Fn(&Store) -> Value>),
}

impl WatchSource {
    pub fn getter(f: impl Fn(&Store) -> Value + 'static) -> Self {
        Self::Getter(Rc::new(f))
    }

    fn read(&self, store: &Store) -> Value {
        match self {
            Self::Key(key) => store.get(key),
            Self::Getter(getter) => getter(store),
        }
    }

    /// Key name for log output and error contexts.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Key(key) => Some(key),
            Self::Getter(_) => None,
        }
    }
}

impl From<&str> for WatchSource {
    fn from(key: &str) -> Self {
        Self::Key(key.to_owned())
    }
}

impl From<String> for WatchSource {
    fn from(key: String) -> Self {
        Self::Key(key)
    }
}

impl fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Getter(_) => f.write_str("Getter(..)"),
        }
    }
}

/// Shared by `watch`, `watch_with` and `safe_watch`.
///
/// The watcher holds its store weakly so an undisposed watcher does not keep
/// the store alive.
pub(crate) fn watch_source(
    store: &Store,
    source: WatchSource,
    on_change: ChangeFn,
    label: String,
) -> Result<Disposer> {
    let weak = store.downgrade();
    let runtime = store.runtime().clone();
    let previous: RefCell<Option<Value>> = RefCell::new(None);

    let body = move || {
        let Some(store) = weak.upgrade() else {
            return Ok(());
        };
        let current = source.read(&store);
        let Some(old) = previous.replace(Some(current.clone())) else {
            return Ok(());
        };
        if old.strict_eq(&current) {
            return Ok(());
        }
        runtime.untracked(|| on_change(&current, &old))
    };

    let options = EffectOptions {
        label: Some(label),
        ..EffectOptions::default()
    };
    Ok(Effect::with_options(store.runtime(), body, options)?.disposer())
}

/// One watcher per `(key, callback)`, with a single disposer for all of them.
///
/// ```rust
/// use trellis_core::{state, watch, Value, WatchFn};
/// use std::{cell::RefCell, rc::Rc};
///
/// let s = state(serde_json::json!({ "count": 0 })).unwrap();
/// let calls = Rc::new(RefCell::new(Vec::new()));
///
/// let sink = calls.clone();
/// let on_count: WatchFn = Box::new(move |new, old| {
///     sink.borrow_mut().push((new.clone(), old.clone()));
///     Ok(())
/// });
/// let _stop = watch(&s, [("count", on_count)]).unwrap();
///
/// s.set("count", 5).unwrap();
/// s.set("count", 5).unwrap();
/// assert_eq!(*calls.borrow(), vec![(Value::from(5), Value::from(0))]);
/// ```
pub fn watch<I, K>(store: &Store, defs: I) -> Result<Disposer>
where
    I: IntoIterator<Item = (K, WatchFn)>,
    K: Into<String>,
{
    let mut created = Vec::new();
    for (key, callback) in defs {
        let key = key.into();
        let label = format!("watch:{key}");
        match watch_source(store, WatchSource::Key(key), Rc::from(callback), label) {
            Ok(disposer) => created.push(disposer),
            Err(error) => {
                Disposer::merge(created).dispose();
                return Err(error);
            }
        }
    }
    Ok(Disposer::merge(created))
}

/// Watch a single key.
pub fn watch_key<F>(store: &Store, key: &str, callback: F) -> Result<Disposer>
where
    F: Fn(&Value, &Value) -> Result<()> + 'static,
{
    watch_source(store, WatchSource::from(key), Rc::new(callback), format!("watch:{key}"))
}

/// Watch an arbitrary expression over `store`.
pub fn watch_with<G, F>(store: &Store, getter: G, callback: F) -> Result<Disposer>
where
    G: Fn(&Store) -> Value + 'static,
    F: Fn(&Value, &Value) -> Result<()> + 'static,
{
    watch_source(
        store,
        WatchSource::getter(getter),
        Rc::new(callback),
        String::from("watch:<getter>"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Runtime;
    use crate::Error;
    use serde_json::json;

    type Calls = Rc<RefCell<Vec<(Value, Value)>>>;

    fn recorder() -> (Calls, WatchFn) {
        let calls: Calls = Rc::default();
        let sink = calls.clone();
        let callback: WatchFn = Box::new(move |new, old| {
            sink.borrow_mut().push((new.clone(), old.clone()));
            Ok(())
        });
        (calls, callback)
    }

    #[test]
    fn first_run_is_only_a_baseline() {
        let store = Runtime::default().state(json!({ "count": 0 })).unwrap();
        let (calls, callback) = recorder();

        let _stop = watch(&store, [("count", callback)]).unwrap();
        assert!(calls.borrow().is_empty());
        assert_eq!(store.subscriber_count("count"), 1);
    }

    #[test]
    fn fires_once_per_distinct_change() {
        let store = Runtime::default().state(json!({ "count": 0 })).unwrap();
        let (calls, callback) = recorder();
        let _stop = watch(&store, [("count", callback)]).unwrap();

        store.set("count", 5).unwrap();
        store.set("count", 5).unwrap();
        store.set("count", 7).unwrap();

        assert_eq!(
            *calls.borrow(),
            vec![
                (Value::from(5), Value::from(0)),
                (Value::from(7), Value::from(5)),
            ]
        );
    }

    #[test]
    fn callback_reads_are_not_tracked() {
        let store = Runtime::default().state(json!({ "a": 0, "b": 0 })).unwrap();
        let reader = store.clone();
        let _stop = watch_key(&store, "a", move |_, _| {
            reader.get("b");
            Ok(())
        })
        .unwrap();

        store.set("a", 1).unwrap();
        assert_eq!(store.subscriber_count("b"), 0);
    }

    #[test]
    fn getter_source_tracks_every_key_it_reads() {
        let store = Runtime::default()
            .state(json!({ "first": "Ada", "last": "Byron" }))
            .unwrap();
        let calls: Calls = Rc::default();
        let sink = calls.clone();

        let _stop = watch_with(
            &store,
            |s| {
                let first = s.get("first");
                let last = s.get("last");
                Value::from(format!(
                    "{} {}",
                    first.as_str().unwrap_or_default(),
                    last.as_str().unwrap_or_default()
                ))
            },
            move |new, old| {
                sink.borrow_mut().push((new.clone(), old.clone()));
                Ok(())
            },
        )
        .unwrap();

        store.set("last", "Lovelace").unwrap();
        assert_eq!(
            *calls.borrow(),
            vec![(Value::from("Ada Lovelace"), Value::from("Ada Byron"))]
        );
    }

    #[test]
    fn disposed_watcher_never_fires() {
        let store = Runtime::default().state(json!({ "count": 0 })).unwrap();
        let (calls, callback) = recorder();
        let stop = watch(&store, [("count", callback)]).unwrap();

        stop.dispose();
        stop.dispose();
        store.set("count", 1).unwrap();

        assert!(calls.borrow().is_empty());
        assert_eq!(store.subscriber_count("count"), 0);
    }

    #[test]
    fn callback_error_reaches_the_writer() {
        let store = Runtime::default().state(json!({ "n": 0 })).unwrap();
        let _stop = watch_key(&store, "n", |_, _| Err(Error::msg("rejected"))).unwrap();

        let err = store.set("n", 1).unwrap_err();
        assert_eq!(err.to_string(), "rejected");
        assert_eq!(store.get("n"), Value::from(1));
    }

    #[test]
    fn watching_a_missing_key_sees_it_appear() {
        let store = Runtime::default().state(json!({})).unwrap();
        let (calls, callback) = recorder();
        let _stop = watch(&store, [("late", callback)]).unwrap();

        store.set("late", true).unwrap();
        assert_eq!(*calls.borrow(), vec![(Value::from(true), Value::Null)]);
    }
}
