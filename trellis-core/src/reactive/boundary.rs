//! Error Boundaries
//!
//! `safe_effect` and `safe_watch` wrap a body so that its errors never reach
//! the write that triggered it. Each failed attempt is reported to
//! `on_error` with an [`ErrorContext`]; the boundary then either retries or,
//! once retries are exhausted, calls `fallback` exactly once.
//!
//! # Retries
//!
//! Attempts are numbered from 1. An attempt is retried when the boundary
//! allows retries and `attempt < max_retries`.
//!
//! - With a zero delay the retry happens immediately, inside the same run.
//!   For an effect, keys read by every attempt are tracked.
//! - With a non-zero delay the retry is a timer task queued on the runtime's
//!   local task set (see [`Runtime::run_until`]), and the body is re-invoked
//!   untracked. A delayed retry is dropped if the computation re-ran or was
//!   disposed in the meantime. Outside a tokio runtime the retry happens
//!   immediately instead.
//!
//! `Error::CascadeOverflow` is never caught: it propagates like it would
//! from an unguarded body.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use super::effect::{Effect, EffectOptions};
use super::runtime::Runtime;
use super::store::Store;
use super::subscriber::Disposer;
use super::value::Value;
use super::watch::{watch_source, WatchSource};
use crate::config::BoundaryConfig;
use crate::error::{Error, Result};

/// Called for every failed attempt.
pub type ErrorHandler = Rc<dyn Fn(&Error, &ErrorContext)>;

/// Called once when retries are exhausted, with the last error and context.
pub type Fallback = Rc<dyn Fn(&Error, &ErrorContext)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryKind {
    Effect,
    Watch,
}

impl fmt::Display for BoundaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Effect => f.write_str("effect"),
            Self::Watch => f.write_str("watch"),
        }
    }
}

/// Details of one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorContext {
    pub kind: BoundaryKind,
    /// The watched key, for key watchers.
    pub key: Option<String>,
    /// When the guarded computation was created.
    pub created: SystemTime,
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    pub max_retries: u32,
    /// Whether another attempt follows this one.
    pub will_retry: bool,
}

/// Retry and fallback policy for a guarded computation.
///
/// ```rust
/// use trellis_core::ErrorBoundary;
///
/// let boundary = ErrorBoundary::new()
///     .max_retries(2)
///     .on_error(|error, context| eprintln!("attempt {} failed: {error}", context.attempt))
///     .fallback(|_, _| eprintln!("giving up"));
/// assert_eq!(boundary.max_retries_value(), 2);
/// ```
#[derive(Clone)]
pub struct ErrorBoundary {
    on_error: Option<ErrorHandler>,
    fallback: Option<Fallback>,
    retry: bool,
    max_retries: u32,
    retry_delay: Duration,
}

impl ErrorBoundary {
    /// A boundary with the default policy and no handlers.
    pub fn new() -> Self {
        Self::from_config(&BoundaryConfig::default())
    }

    pub fn from_config(config: &BoundaryConfig) -> Self {
        Self {
            on_error: None,
            fallback: None,
            retry: config.retry,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }

    pub fn on_error(mut self, handler: impl Fn(&Error, &ErrorContext) + 'static) -> Self {
        self.on_error = Some(Rc::new(handler));
        self
    }

    pub fn fallback(mut self, fallback: impl Fn(&Error, &ErrorContext) + 'static) -> Self {
        self.fallback = Some(Rc::new(fallback));
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn max_retries_value(&self) -> u32 {
        self.max_retries
    }

    fn will_retry(&self, attempt: u32) -> bool {
        self.retry && attempt < self.max_retries
    }
}

impl Default for ErrorBoundary {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorBoundary")
            .field("retry", &self.retry)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("on_error", &self.on_error.is_some())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Options for [`safe_effect`] and [`safe_watch`].
#[derive(Debug, Clone, Default)]
pub struct SafeOptions {
    /// `None` uses the runtime's `BoundaryConfig` with no handlers.
    pub error_boundary: Option<ErrorBoundary>,
}

impl SafeOptions {
    fn resolve(self, runtime: &Runtime) -> ErrorBoundary {
        self.error_boundary
            .unwrap_or_else(|| ErrorBoundary::from_config(&runtime.config().boundary))
    }
}

impl From<ErrorBoundary> for SafeOptions {
    fn from(boundary: ErrorBoundary) -> Self {
        Self {
            error_boundary: Some(boundary),
        }
    }
}

type Body = Rc<dyn Fn() -> Result<()>>;

/// Attempt loop shared by every run of one guarded computation.
struct GuardedRun {
    boundary: ErrorBoundary,
    kind: BoundaryKind,
    key: Option<String>,
    created: SystemTime,
    runtime: Runtime,
    alive: Rc<Cell<bool>>,
    generation: Cell<u64>,
}

impl GuardedRun {
    fn new(
        boundary: ErrorBoundary,
        kind: BoundaryKind,
        key: Option<String>,
        runtime: &Runtime,
    ) -> Rc<Self> {
        Rc::new(Self {
            boundary,
            kind,
            key,
            created: SystemTime::now(),
            runtime: runtime.clone(),
            alive: Rc::new(Cell::new(true)),
            generation: Cell::new(0),
        })
    }

    /// Start a fresh run, dropping any delayed retry of the previous one.
    fn run(self: &Rc<Self>, body: Body) -> Result<()> {
        self.generation.set(self.generation.get() + 1);
        self.attempt_from(body, 1)
    }

    fn attempt_from(self: &Rc<Self>, body: Body, first: u32) -> Result<()> {
        let mut attempt = first;
        loop {
            let error = match body() {
                Ok(()) => return Ok(()),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => error,
            };

            let context = self.report(&error, attempt);
            if !context.will_retry {
                if let Some(fallback) = &self.boundary.fallback {
                    fallback(&error, &context);
                }
                return Ok(());
            }

            attempt += 1;
            if self.boundary.retry_delay.is_zero() {
                continue;
            }
            if tokio::runtime::Handle::try_current().is_ok() {
                self.schedule(body, attempt);
                return Ok(());
            }
            warn!(
                kind = %self.kind,
                delay = ?self.boundary.retry_delay,
                "no tokio runtime for a delayed retry; retrying immediately"
            );
        }
    }

    fn report(&self, error: &Error, attempt: u32) -> ErrorContext {
        let context = ErrorContext {
            kind: self.kind,
            key: self.key.clone(),
            created: self.created,
            attempt,
            max_retries: self.boundary.max_retries,
            will_retry: self.boundary.will_retry(attempt),
        };
        warn!(
            kind = %self.kind,
            key = self.key.as_deref(),
            attempt,
            will_retry = context.will_retry,
            %error,
            "error boundary caught an error"
        );
        if let Some(on_error) = &self.boundary.on_error {
            on_error(error, &context);
        }
        context
    }

    fn schedule(self: &Rc<Self>, body: Body, attempt: u32) {
        let this = Rc::clone(self);
        let generation = self.generation.get();
        let delay = self.boundary.retry_delay;

        self.runtime.spawn_local(async move {
            tokio::time::sleep(delay).await;
            if !this.alive.get() || this.generation.get() != generation {
                debug!(kind = %this.kind, attempt, "delayed retry dropped");
                return;
            }
            let runtime = this.runtime.clone();
            if let Err(error) = runtime.untracked(|| this.attempt_from(body, attempt)) {
                warn!(kind = %this.kind, %error, "delayed retry failed fatally");
            }
        });
    }

    fn disposer(&self, inner: Disposer) -> Disposer {
        let alive = Rc::clone(&self.alive);
        Disposer::new(move || {
            alive.set(false);
            inner.dispose();
        })
    }
}

impl Runtime {
    /// An effect whose errors are contained by an [`ErrorBoundary`].
    pub fn safe_effect<F>(&self, f: F, options: SafeOptions) -> Result<Disposer>
    where
        F: Fn() -> Result<()> + 'static,
    {
        let guard = GuardedRun::new(options.resolve(self), BoundaryKind::Effect, None, self);
        let body: Body = Rc::new(f);

        let run = {
            let guard = Rc::clone(&guard);
            move || {
                if !guard.alive.get() {
                    return Ok(());
                }
                guard.run(Rc::clone(&body))
            }
        };
        let options = EffectOptions {
            label: Some(String::from("safe_effect")),
            ..EffectOptions::default()
        };
        let effect = Effect::with_options(self, run, options)?;
        Ok(guard.disposer(effect.disposer()))
    }
}

/// An effect on the current thread's runtime whose errors are contained.
pub fn safe_effect<F>(f: F, options: SafeOptions) -> Result<Disposer>
where
    F: Fn() -> Result<()> + 'static,
{
    Runtime::current().safe_effect(f, options)
}

/// A watcher whose callback errors are contained.
///
/// Retries call the callback again with the same `(new, old)` pair.
pub fn safe_watch<F>(
    store: &Store,
    source: impl Into<WatchSource>,
    callback: F,
    options: SafeOptions,
) -> Result<Disposer>
where
    F: Fn(&Value, &Value) -> Result<()> + 'static,
{
    let source = source.into();
    let key = source.key().map(str::to_owned);
    let label = format!("safe_watch:{}", key.as_deref().unwrap_or("<getter>"));
    let guard = GuardedRun::new(
        options.resolve(store.runtime()),
        BoundaryKind::Watch,
        key,
        store.runtime(),
    );
    let callback = Rc::new(callback);

    let on_change = {
        let guard = Rc::clone(&guard);
        move |new: &Value, old: &Value| {
            if !guard.alive.get() {
                return Ok(());
            }
            let callback = Rc::clone(&callback);
            let (new, old) = (new.clone(), old.clone());
            guard.run(Rc::new(move || callback(&new, &old)))
        }
    };
    let watcher = watch_source(store, source, Rc::new(on_change), label)?;
    Ok(guard.disposer(watcher))
}
