//! Reactive Primitives
//!
//! This module implements the core reactive system: stores, effects,
//! computeds, watchers, error boundaries and async effects.
//!
//! # Concepts
//!
//! ## Stores
//!
//! A [`Store`] wraps a JSON object or array. When a key is read within a
//! running computation the store registers that computation as a subscriber
//! of the key. When the key's value changes, all subscribers run again,
//! synchronously, before the write returns.
//!
//! ## Effects
//!
//! An effect is a side-effecting computation that runs immediately and again
//! whenever a key it read changes. Every run re-tracks its dependencies, so
//! keys only read on a branch no longer taken stop triggering it.
//!
//! ## Computeds
//!
//! A computed is a derived key that caches its result. A dependency change
//! only marks it dirty; it recomputes on the next read.
//!
//! ## Watchers
//!
//! A watcher calls back with `(new, old)` when one key or expression changes,
//! skipping the run that records the initial value.
//!
//! ## Error boundaries and async effects
//!
//! `safe_effect` and `safe_watch` contain errors behind a retry/fallback
//! policy. `async_effect` runs a future per trigger and cancels the one it
//! supersedes.
//!
//! # Implementation Notes
//!
//! Tracking goes through an explicit per-runtime context stack rather than a
//! bare global. Each thread has a default [`Runtime`] that backs the free
//! functions; every free function has a method counterpart on `Runtime` (or
//! takes the store, which carries its runtime).

mod async_effect;
mod boundary;
mod cancel;
mod computed;
mod context;
mod effect;
mod runtime;
mod store;
mod subscriber;
mod value;
mod watch;

pub use async_effect::{
    async_effect, AsyncEffect, AsyncEffectOptions, AsyncEffectState, AsyncErrorHandler, Cleanup,
    RunState,
};
pub use boundary::{
    safe_effect, safe_watch, BoundaryKind, ErrorBoundary, ErrorContext, ErrorHandler, Fallback,
    SafeOptions,
};
pub use cancel::{CancellationToken, Cancelled};
pub use computed::{computed, ComputeFn, ComputedState};
pub use context::ReactiveContext;
pub use effect::{effect, effects, Effect, EffectFn, EffectOptions, Scheduler};
pub use runtime::{on_cleanup, untracked, Runtime};
pub use store::{state, Store, StoreKind, LENGTH_KEY};
pub use subscriber::{Disposer, SubscriberId};
pub use value::Value;
pub use watch::{watch, watch_key, watch_with, WatchFn, WatchSource};
