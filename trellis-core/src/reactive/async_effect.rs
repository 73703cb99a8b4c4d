//! Async Effects
//!
//! An async effect is an effect whose body returns a future. Each run gets a
//! fresh [`CancellationToken`]; when a dependency changes while a run is
//! still pending, that run's token is cancelled (and its future aborted)
//! before the next run starts.
//!
//! # How Async Effects Work
//!
//! 1. On every trigger the previous run is superseded: its token is
//!    cancelled, then the cleanup returned by the last settled run is called.
//!
//! 2. The body is called with a new token and its future is polled once,
//!    synchronously, inside the tracking frame.
//!
//! 3. If the future is still pending it is queued on the runtime's local
//!    task set and finishes while the caller drives
//!    [`Runtime::run_until`]. Outside any tokio runtime a pending run is
//!    aborted instead.
//!
//! 4. When the future resolves, a returned cleanup is kept for the next
//!    supersede (or called right away if the run was already superseded).
//!    Errors other than cancellation go to `on_error`.
//!
//! # Tracking
//!
//! Only keys read before the first suspension point are tracked. Reads after
//! an `.await` happen outside any tracking frame.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_util::future::{AbortHandle, Abortable, Aborted};
use futures_util::task::noop_waker_ref;
use tracing::{debug, warn};

use super::cancel::CancellationToken;
use super::effect::{Effect, EffectOptions};
use super::runtime::Runtime;
use super::subscriber::Disposer;
use crate::error::{Error, Result};

/// Teardown returned by a run, called before the next run or on disposal.
pub type Cleanup = Box<dyn FnOnce()>;

/// Receives errors from runs that are neither cancelled nor aborted.
pub type AsyncErrorHandler = Rc<dyn Fn(Error)>;

#[derive(Clone, Default)]
pub struct AsyncEffectOptions {
    pub on_error: Option<AsyncErrorHandler>,
}

impl AsyncEffectOptions {
    pub fn on_error(handler: impl Fn(Error) + 'static) -> Self {
        Self {
            on_error: Some(Rc::new(handler)),
        }
    }
}

impl fmt::Debug for AsyncEffectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEffectOptions")
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Lifecycle of an async effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEffectState {
    /// Built, first run not started yet.
    Created,
    /// No run in flight.
    Idle,
    /// A run is pending.
    Running,
    Disposed,
}

/// Outcome of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Settled,
    /// Superseded by a newer run or by disposal.
    Aborted,
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
    state: Rc<Cell<RunState>>,
}

struct Shared {
    state: Cell<AsyncEffectState>,
    generation: Cell<u64>,
    in_flight: RefCell<Option<InFlight>>,
    last_run: RefCell<Option<Rc<Cell<RunState>>>>,
    cleanup: RefCell<Option<Cleanup>>,
    on_error: Option<AsyncErrorHandler>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.get() == generation && self.state.get() != AsyncEffectState::Disposed
    }

    /// Cancel the pending run, then call the last settled run's cleanup.
    fn supersede(&self) {
        let in_flight = self.in_flight.borrow_mut().take();
        if let Some(in_flight) = in_flight {
            in_flight.state.set(RunState::Aborted);
            debug!(generation = in_flight.generation, "async run superseded");
            in_flight.token.cancel();
        }
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    fn begin(&self) -> (u64, CancellationToken, Rc<Cell<RunState>>) {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);

        let token = CancellationToken::new();
        let state = Rc::new(Cell::new(RunState::Pending));
        *self.in_flight.borrow_mut() = Some(InFlight {
            generation,
            token: token.clone(),
            state: Rc::clone(&state),
        });
        *self.last_run.borrow_mut() = Some(Rc::clone(&state));
        self.state.set(AsyncEffectState::Running);
        (generation, token, state)
    }

    fn settle(
        &self,
        generation: u64,
        run: &Cell<RunState>,
        outcome: std::result::Result<Result<Option<Cleanup>>, Aborted>,
    ) {
        let current = self.is_current(generation);
        if current {
            self.in_flight.borrow_mut().take();
            self.state.set(AsyncEffectState::Idle);
        }

        match outcome {
            Err(Aborted) => {
                run.set(RunState::Aborted);
                debug!(generation, "async run aborted");
            }
            Ok(Err(error)) if error.is_cancelled() => {
                run.set(RunState::Aborted);
                debug!(generation, "async run observed cancellation");
            }
            Ok(Err(error)) => {
                run.set(RunState::Settled);
                match &self.on_error {
                    Some(on_error) => on_error(error),
                    None => warn!(generation, %error, "async effect failed"),
                }
            }
            Ok(Ok(cleanup)) => {
                if current {
                    run.set(RunState::Settled);
                    *self.cleanup.borrow_mut() = cleanup;
                } else if let Some(cleanup) = cleanup {
                    cleanup();
                }
                debug!(generation, current, "async run settled");
            }
        }
    }

    fn dispose(&self) {
        if self.state.replace(AsyncEffectState::Disposed) == AsyncEffectState::Disposed {
            return;
        }
        self.supersede();
    }
}

/// Handle to an async effect.
///
/// Clones share the same effect.
#[derive(Clone)]
pub struct AsyncEffect {
    effect: Effect,
    shared: Rc<Shared>,
}

impl AsyncEffect {
    pub fn new<F, Fut>(runtime: &Runtime, body: F, options: AsyncEffectOptions) -> Result<Self>
    where
        F: Fn(CancellationToken) -> Fut + 'static,
        Fut: Future<Output = Result<Option<Cleanup>>> + 'static,
    {
        let shared = Rc::new(Shared {
            state: Cell::new(AsyncEffectState::Created),
            generation: Cell::new(0),
            in_flight: RefCell::new(None),
            last_run: RefCell::new(None),
            cleanup: RefCell::new(None),
            on_error: options.on_error,
        });

        let run = {
            let shared = Rc::clone(&shared);
            let runtime = runtime.clone();
            move || -> Result<()> {
                if shared.state.get() == AsyncEffectState::Disposed {
                    return Ok(());
                }
                shared.supersede();
                let (generation, token, run_state) = shared.begin();

                let (abort, registration) = AbortHandle::new_pair();
                token.attach_abort(abort);
                let mut task = Box::pin(Abortable::new(body(token.clone()), registration));

                let mut cx = Context::from_waker(noop_waker_ref());
                match task.as_mut().poll(&mut cx) {
                    Poll::Ready(outcome) => shared.settle(generation, &run_state, outcome),
                    Poll::Pending if token.is_cancelled() => run_state.set(RunState::Aborted),
                    Poll::Pending => {
                        if tokio::runtime::Handle::try_current().is_err() {
                            warn!(generation, "async effect suspended outside a tokio runtime; aborting run");
                            token.cancel();
                            shared.settle(generation, &run_state, Err(Aborted));
                            return Ok(());
                        }
                        let shared = Rc::clone(&shared);
                        runtime.spawn_local(async move {
                            let outcome = task.await;
                            shared.settle(generation, &run_state, outcome);
                        });
                    }
                }
                Ok(())
            }
        };

        let options = EffectOptions {
            label: Some(String::from("async_effect")),
            ..EffectOptions::default()
        };
        let effect = Effect::with_options(runtime, run, options)?;
        Ok(Self { effect, shared })
    }

    pub fn state(&self) -> AsyncEffectState {
        self.shared.state.get()
    }

    /// State of the most recent run, if any run started.
    pub fn run_state(&self) -> Option<RunState> {
        self.shared.last_run.borrow().as_ref().map(|state| state.get())
    }

    /// Number of runs started so far.
    pub fn run_count(&self) -> usize {
        self.effect.run_count()
    }

    /// Stop reacting, cancel the pending run and call the pending cleanup.
    pub fn dispose(&self) {
        self.effect.dispose();
        self.shared.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == AsyncEffectState::Disposed
    }

    pub fn disposer(&self) -> Disposer {
        let this = self.clone();
        Disposer::new(move || this.dispose())
    }
}

impl fmt::Debug for AsyncEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncEffect")
            .field("id", &self.effect.id())
            .field("state", &self.state())
            .field("run_state", &self.run_state())
            .finish()
    }
}

impl Runtime {
    /// Run an async body now and again whenever a key it read synchronously
    /// changes, cancelling the superseded run.
    pub fn async_effect<F, Fut>(&self, body: F, options: AsyncEffectOptions) -> Result<Disposer>
    where
        F: Fn(CancellationToken) -> Fut + 'static,
        Fut: Future<Output = Result<Option<Cleanup>>> + 'static,
    {
        Ok(AsyncEffect::new(self, body, options)?.disposer())
    }
}

/// Create an async effect on the current thread's runtime.
pub fn async_effect<F, Fut>(body: F, options: AsyncEffectOptions) -> Result<Disposer>
where
    F: Fn(CancellationToken) -> Fut + 'static,
    Fut: Future<Output = Result<Option<Cleanup>>> + 'static,
{
    Runtime::current().async_effect(body, options)
}
