//! Property-based invariant tests for stores, effects, computeds, watchers
//! and error boundaries.
//!
//! These tests verify invariants that must hold for any sequence of writes:
//!
//! 1. Reading a key returns the most recent write.
//! 2. An effect re-runs exactly for changed writes to keys it read.
//! 3. Writing an identical value never re-runs subscribers.
//! 4. A read computed is not recomputed until a dependency changes.
//! 5. A watcher fires once per distinct change with the matching pair.
//! 6. A disposed effect never runs again, and disposing twice is harmless.
//! 7. A boundary with `max_retries = N` reports N errors, then falls back once.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use proptest::prelude::*;
use serde_json::json;
use trellis_core::{Disposer, Error, ErrorBoundary, Runtime, Store, Value};

const KEYS: [&str; 4] = ["a", "b", "c", "d"];

// ── Helpers ─────────────────────────────────────────────────────────────

fn fresh_store() -> (Runtime, Store) {
    let runtime = Runtime::default();
    let store = runtime
        .state(json!({ "a": 0, "b": 0, "c": 0, "d": 0 }))
        .unwrap();
    (runtime, store)
}

fn write_strategy() -> impl Strategy<Value = (usize, i64)> {
    (0..KEYS.len(), -3i64..3)
}

fn writes_strategy() -> impl Strategy<Value = Vec<(usize, i64)>> {
    proptest::collection::vec(write_strategy(), 0..40)
}

fn counting_effect(
    runtime: &Runtime,
    store: &Store,
    keys: Vec<&'static str>,
) -> (Rc<Cell<usize>>, Disposer) {
    let runs = Rc::new(Cell::new(0));
    let counter = runs.clone();
    let reader = store.clone();
    let stop = runtime
        .effect(move || {
            for key in &keys {
                reader.get(key);
            }
            counter.set(counter.get() + 1);
            Ok(())
        })
        .unwrap();
    (runs, stop)
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Last write wins
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn reads_return_latest_write(writes in writes_strategy()) {
        let (_runtime, store) = fresh_store();
        let mut expected: HashMap<&str, i64> = KEYS.iter().map(|key| (*key, 0)).collect();

        for (index, value) in writes {
            store.set(KEYS[index], value).unwrap();
            expected.insert(KEYS[index], value);
        }

        for (key, value) in expected {
            prop_assert_eq!(store.get(key), Value::from(value));
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2 + 3. Effects re-run exactly for changed dependencies
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn effect_reruns_only_for_changed_dependencies(
        read_mask in proptest::collection::vec(any::<bool>(), KEYS.len()),
        writes in writes_strategy(),
    ) {
        let (runtime, store) = fresh_store();
        let read: Vec<&'static str> = KEYS
            .iter()
            .zip(&read_mask)
            .filter(|(_, read)| **read)
            .map(|(key, _)| *key)
            .collect();
        let (runs, _stop) = counting_effect(&runtime, &store, read.clone());

        let mut current: HashMap<&str, i64> = KEYS.iter().map(|key| (*key, 0)).collect();
        let mut expected_runs = 1;
        for (index, value) in writes {
            let key = KEYS[index];
            let changed = current.insert(key, value) != Some(value);
            if changed && read.contains(&key) {
                expected_runs += 1;
            }
            store.set(key, value).unwrap();
            prop_assert_eq!(runs.get(), expected_runs);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Computed caching
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn computed_recomputes_once_per_change(
        rereads in 1usize..10,
        writes in writes_strategy(),
    ) {
        let (_runtime, store) = fresh_store();
        let computes = Rc::new(Cell::new(0));
        let counter = computes.clone();
        store
            .define_computed("sum", move |s| {
                counter.set(counter.get() + 1);
                let total: f64 = ["a", "b"]
                    .iter()
                    .map(|key| s.get(key).as_f64().unwrap_or_default())
                    .sum();
                Value::from(total)
            })
            .unwrap();

        let mut expected = 0;
        let mut dirty = true;
        let (mut a, mut b) = (0i64, 0i64);
        for (index, value) in writes {
            let key = KEYS[index];
            let changed = match key {
                "a" => std::mem::replace(&mut a, value) != value,
                "b" => std::mem::replace(&mut b, value) != value,
                _ => false,
            };
            store.set(key, value).unwrap();
            dirty |= changed;

            for _ in 0..rereads {
                prop_assert_eq!(store.get("sum"), Value::from(a + b));
            }
            if dirty {
                expected += 1;
                dirty = false;
            }
            prop_assert_eq!(computes.get(), expected);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 5. Watcher transitions
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn watcher_fires_per_distinct_change(values in proptest::collection::vec(-3i64..3, 0..30)) {
        let (_runtime, store) = fresh_store();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let _stop = trellis_core::watch_key(&store, "a", move |new, old| {
            sink.borrow_mut().push((new.clone(), old.clone()));
            Ok(())
        })
        .unwrap();

        let mut expected = Vec::new();
        let mut previous = 0i64;
        for value in values {
            if value != previous {
                expected.push((Value::from(value), Value::from(previous)));
                previous = value;
            }
            store.set("a", value).unwrap();
        }
        prop_assert_eq!(&*calls.borrow(), &expected);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 6. Disposal is final and idempotent
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn disposed_effect_never_runs(writes in writes_strategy(), dispose_twice in any::<bool>()) {
        let (runtime, store) = fresh_store();
        let (runs, stop) = counting_effect(&runtime, &store, KEYS.to_vec());

        stop.dispose();
        if dispose_twice {
            stop.dispose();
        }
        for (index, value) in writes {
            store.set(KEYS[index], value).unwrap();
        }

        prop_assert_eq!(runs.get(), 1);
        for key in KEYS {
            prop_assert_eq!(store.subscriber_count(key), 0);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 7. Boundary retry accounting
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn boundary_reports_each_attempt(max_retries in 1u32..8) {
        let runtime = Runtime::default();
        let reports = Rc::new(RefCell::new(Vec::new()));
        let fallbacks = Rc::new(Cell::new(0));

        let sink = reports.clone();
        let counter = fallbacks.clone();
        let boundary = ErrorBoundary::new()
            .max_retries(max_retries)
            .on_error(move |_, context| sink.borrow_mut().push((context.attempt, context.will_retry)))
            .fallback(move |_, _| counter.set(counter.get() + 1));

        let _stop = runtime
            .safe_effect(|| Err(Error::msg("always")), boundary.into())
            .unwrap();

        let expected: Vec<(u32, bool)> = (1..=max_retries)
            .map(|attempt| (attempt, attempt < max_retries))
            .collect();
        prop_assert_eq!(&*reports.borrow(), &expected);
        prop_assert_eq!(fallbacks.get(), 1);
    }
}
