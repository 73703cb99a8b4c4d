//! Trellis Core
//!
//! This crate provides a fine-grained reactive state engine. It implements:
//!
//! - Reactive stores over JSON objects and arrays, with lazily wrapped
//!   nested data
//! - Automatic dependency tracking with per-run pruning
//! - Effects, lazily cached computeds and change watchers
//! - Error boundaries with retry and fallback policies
//! - Async effects with per-run cancellation tokens
//!
//! Everything is single-threaded: handles are `Rc`-based and `!Send`.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: stores, computations and dependency tracking
//! - `config`: runtime configuration
//! - `error`: the shared error type
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{computed, effect, state, ComputeFn, Value};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let cart = state(serde_json::json!({ "price": 10, "qty": 2 })).unwrap();
//!
//! // Create a derived value
//! let total: ComputeFn = Box::new(|s| {
//!     let price = s.get("price").as_f64().unwrap_or_default();
//!     let qty = s.get("qty").as_f64().unwrap_or_default();
//!     Value::from(price * qty)
//! });
//! computed(&cart, [("total", total)]).unwrap();
//!
//! // Create an effect
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let reader = cart.clone();
//! let sink = seen.clone();
//! let stop = effect(move || {
//!     sink.borrow_mut().push(reader.get("total"));
//!     Ok(())
//! })
//! .unwrap();
//!
//! // Update the store
//! cart.set("qty", 3).unwrap();
//! // Effect automatically re-ran with the recomputed total
//! assert_eq!(*seen.borrow(), vec![Value::from(20), Value::from(30)]);
//!
//! stop.dispose();
//! ```

pub mod config;
pub mod error;
pub mod reactive;

pub use config::{BoundaryConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use reactive::{
    async_effect, computed, effect, effects, on_cleanup, safe_effect, safe_watch, state,
    untracked, watch, watch_key, watch_with, AsyncEffect, AsyncEffectOptions, AsyncEffectState,
    BoundaryKind, CancellationToken, Cleanup, ComputeFn, ComputedState, Disposer, Effect,
    EffectFn, EffectOptions, ErrorBoundary, ErrorContext, RunState, Runtime, SafeOptions, Store,
    StoreKind, SubscriberId, Value, WatchFn, WatchSource,
};
