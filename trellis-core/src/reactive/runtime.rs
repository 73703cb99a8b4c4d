//! Reactive Runtime
//!
//! The runtime is the central coordinator shared by every store and
//! computation created through it. It owns:
//!
//! - the [`ReactiveContext`] stack that reads consult for tracking,
//! - the [`RuntimeConfig`],
//! - the nested-notification counter that bounds re-entrant cascades.
//!
//! # How It Works
//!
//! 1. A store created by a runtime keeps a handle to it.
//!
//! 2. When a computation reads a key, the store asks the runtime's context
//!    for the running computation and subscribes it.
//!
//! 3. When a key's value changes, the store notifies its subscribers inside
//!    an update guard. Each nested notification (a subscriber writing another
//!    key, which notifies more subscribers, ...) increments the depth; past
//!    `max_update_depth` the write fails with `Error::CascadeOverflow`.
//!
//! # Threading
//!
//! Everything is single-threaded. Each thread lazily creates its own default
//! runtime, which backs the free functions (`state`, `effect`, ...). An
//! embedder or a test can install a differently configured runtime with
//! [`Runtime::set_current`].
//!
//! # Local Tasks
//!
//! Work that outlives a `set` call (suspended async effect runs, delayed
//! boundary retries) is queued on a `LocalSet` owned by the runtime. Queuing
//! never needs an ambient `LocalSet`; the queued tasks make progress while a
//! future is driven through [`Runtime::run_until`].

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use tokio::task::LocalSet;
use tracing::{debug, error, trace};

use super::context::ReactiveContext;
use super::subscriber::SubscriberId;
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

thread_local! {
    static CURRENT: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    context: ReactiveContext,
    update_depth: Cell<usize>,
    tasks: LocalSet,
}

/// Handle to a reactive runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner {
                config,
                context: ReactiveContext::new(),
                update_depth: Cell::new(0),
                tasks: LocalSet::new(),
            }),
        }
    }

    /// The runtime installed on this thread, created with the default
    /// config on first use.
    pub fn current() -> Self {
        CURRENT.with(|current| {
            current
                .borrow_mut()
                .get_or_insert_with(|| Runtime::new(RuntimeConfig::default()))
                .clone()
        })
    }

    /// Install `runtime` as this thread's default, returning the previous one.
    ///
    /// Stores and effects already created keep the runtime they were built on.
    pub fn set_current(runtime: Runtime) -> Option<Runtime> {
        CURRENT.with(|current| current.borrow_mut().replace(runtime))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn context(&self) -> &ReactiveContext {
        &self.inner.context
    }

    /// Check if we're inside a tracking context.
    pub fn is_tracking(&self) -> bool {
        self.inner.context.is_active()
    }

    /// Get the current subscriber being tracked, if any.
    pub fn current_subscriber(&self) -> Option<SubscriberId> {
        self.inner.context.current_subscriber()
    }

    /// Number of notifications currently nested on the call stack.
    pub fn update_depth(&self) -> usize {
        self.inner.update_depth.get()
    }

    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` without recording any dependency for the running computation.
    pub fn untracked<T>(&self, f: impl FnOnce() -> T) -> T {
        let _frame = self.inner.context.enter_untracked();
        f()
    }

    /// Register `cleanup` on the running computation.
    ///
    /// It runs before that computation's next run and when it is disposed.
    /// Outside of any computation the cleanup is dropped without running.
    pub fn on_cleanup(&self, cleanup: impl FnOnce() + 'static) {
        match self.inner.context.current_effect() {
            Some(effect) => effect.add_cleanup(Box::new(cleanup)),
            None => debug!("on_cleanup called outside a running computation; ignored"),
        }
    }

    /// Drive `future` to completion on the current tokio runtime while also
    /// running this runtime's queued local tasks.
    ///
    /// ```rust
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// use trellis_core::{AsyncEffectOptions, Runtime};
    ///
    /// let runtime = Runtime::default();
    /// let _stop = runtime
    ///     .async_effect(
    ///         |_token| async {
    ///             tokio::task::yield_now().await;
    ///             Ok(None)
    ///         },
    ///         AsyncEffectOptions::default(),
    ///     )
    ///     .unwrap();
    ///
    /// runtime.run_until(tokio::task::yield_now()).await;
    /// # }
    /// ```
    pub async fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.inner.tasks.run_until(future).await
    }

    /// Queue a task on this runtime's local set.
    pub(crate) fn spawn_local<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        trace!("queued local task");
        self.inner.tasks.spawn_local(task);
    }

    /// Enter one level of change notification for `key`.
    pub(crate) fn enter_update(&self, key: &str) -> Result<UpdateGuard<'_>> {
        let limit = self.inner.config.max_update_depth;
        let depth = self.inner.update_depth.get() + 1;
        if depth > limit {
            error!(key, limit, "update cascade overflow; aborting write");
            return Err(Error::CascadeOverflow {
                key: key.to_owned(),
                limit,
            });
        }
        self.inner.update_depth.set(depth);
        Ok(UpdateGuard { runtime: self })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("context_depth", &self.inner.context.depth())
            .field("update_depth", &self.update_depth())
            .finish()
    }
}

/// Decrements the update depth when dropped.
pub(crate) struct UpdateGuard<'a> {
    runtime: &'a Runtime,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        let depth = &self.runtime.inner.update_depth;
        depth.set(depth.get().saturating_sub(1));
    }
}

/// Run `f` untracked on the current thread's runtime.
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    Runtime::current().untracked(f)
}

/// Register a cleanup on the running computation of the current thread's runtime.
pub fn on_cleanup(cleanup: impl FnOnce() + 'static) {
    Runtime::current().on_cleanup(cleanup)
}
