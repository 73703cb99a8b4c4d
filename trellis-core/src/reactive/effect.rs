//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the store that owns it runs the effect
//!    again, synchronously, inside the write.
//!
//! 3. Every run collects a fresh dependency list. Keys read by the previous
//!    run but not by this one are unsubscribed afterwards, so branches that
//!    are no longer taken stop triggering the effect.
//!
//! # Lazy Effects
//!
//! An effect built with a scheduler does not re-run when a dependency
//! changes; the scheduler is called instead. Computed properties use this to
//! flip a dirty flag and recompute on the next read.
//!
//! # Cleanup
//!
//! A run may register cleanups with [`on_cleanup`](super::on_cleanup). They
//! are called before the effect re-runs and when the effect is disposed.
//!
//! # Errors
//!
//! The run function returns `Result<()>`. An error is returned from the run
//! and therefore from the `set` call that triggered it. Dependencies read
//! before the error are still tracked.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use super::context::Dependencies;
use super::runtime::Runtime;
use super::subscriber::{Disposer, SubscriberId};
use crate::error::Result;

/// Boxed effect body, used where several bodies are passed together.
pub type EffectFn = Box<dyn Fn() -> Result<()>>;

/// Called instead of re-running a lazy effect when a dependency changes.
pub type Scheduler = Rc<dyn Fn() -> Result<()>>;

/// Options for [`Effect::with_options`].
#[derive(Clone, Default)]
pub struct EffectOptions {
    /// Skip the initial run.
    pub lazy: bool,
    pub scheduler: Option<Scheduler>,
    /// Name used in log output.
    pub label: Option<String>,
}

pub(crate) struct EffectCore {
    id: SubscriberId,
    runtime: Runtime,
    label: Option<Rc<str>>,
    run: Rc<dyn Fn() -> Result<()>>,
    scheduler: Option<Scheduler>,
    dependencies: RefCell<Dependencies>,
    active: Cell<bool>,
    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
    run_count: Cell<usize>,
}

impl EffectCore {
    pub(crate) fn new(
        runtime: &Runtime,
        run: Rc<dyn Fn() -> Result<()>>,
        scheduler: Option<Scheduler>,
        label: Option<String>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: SubscriberId::new(),
            runtime: runtime.clone(),
            label: label.map(Rc::from),
            run,
            scheduler,
            dependencies: RefCell::new(Dependencies::new()),
            active: Cell::new(true),
            cleanups: RefCell::new(Vec::new()),
            run_count: Cell::new(0),
        })
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("effect")
    }

    /// Run the body inside a tracking frame and swap in the new dependencies.
    pub(crate) fn execute(self: &Rc<Self>) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }

        self.run_cleanups();

        let frame = self.runtime.context().enter(Rc::clone(self));
        let result = (self.run)();
        let tracked = frame.finish();

        self.replace_dependencies(tracked);
        self.run_count.set(self.run_count.get() + 1);
        trace!(
            effect = %self.id,
            label = self.label(),
            dependencies = self.dependencies.borrow().len(),
            ok = result.is_ok(),
            "effect ran"
        );
        result
    }

    /// React to a dependency change: schedule if lazy, otherwise re-run.
    pub(crate) fn notify(self: &Rc<Self>) -> Result<()> {
        match &self.scheduler {
            Some(scheduler) => scheduler(),
            None => self.execute(),
        }
    }

    fn replace_dependencies(self: &Rc<Self>, tracked: Dependencies) {
        if !self.is_active() {
            // Disposed during its own run: drop what the run subscribed to.
            for dependency in &tracked {
                dependency.unsubscribe(self.id);
            }
            return;
        }

        let stale: Vec<_> = self
            .dependencies
            .borrow()
            .iter()
            .filter(|old| !tracked.iter().any(|new| new.same(old)))
            .cloned()
            .collect();
        for dependency in &stale {
            dependency.unsubscribe(self.id);
        }

        // A nested re-run of this effect may have pruned keys this run read.
        for dependency in &tracked {
            dependency.subscribe(self);
        }
        *self.dependencies.borrow_mut() = tracked;
    }

    pub(crate) fn add_cleanup(&self, cleanup: Box<dyn FnOnce()>) {
        if self.is_active() {
            self.cleanups.borrow_mut().push(cleanup);
        } else {
            cleanup();
        }
    }

    fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.borrow_mut());
        for cleanup in cleanups {
            cleanup();
        }
    }

    pub(crate) fn dispose(&self) {
        if !self.active.replace(false) {
            return;
        }
        let dependencies = std::mem::take(&mut *self.dependencies.borrow_mut());
        for dependency in &dependencies {
            dependency.unsubscribe(self.id);
        }
        self.run_cleanups();
        debug!(effect = %self.id, label = self.label(), "effect disposed");
    }

    pub(crate) fn run_count(&self) -> usize {
        self.run_count.get()
    }

    pub(crate) fn dependency_count(&self) -> usize {
        self.dependencies.borrow().len()
    }
}

/// A side-effecting computation that runs when dependencies change.
///
/// # Example
///
/// ```rust
/// use trellis_core::{Effect, Runtime};
///
/// let runtime = Runtime::default();
/// let count = runtime.state(serde_json::json!({ "count": 0 })).unwrap();
///
/// let reader = count.clone();
/// let effect = Effect::new(&runtime, move || {
///     println!("Count is: {:?}", reader.get("count"));
///     Ok(())
/// })
/// .unwrap();
///
/// count.set("count", 5).unwrap(); // Prints: "Count is: 5"
/// assert_eq!(effect.run_count(), 2);
/// ```
#[derive(Clone)]
pub struct Effect {
    core: Rc<EffectCore>,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish initial dependencies. If
    /// that first run fails the effect is disposed and the error returned.
    pub fn new<F>(runtime: &Runtime, run: F) -> Result<Self>
    where
        F: Fn() -> Result<()> + 'static,
    {
        Self::with_options(runtime, run, EffectOptions::default())
    }

    /// Create a new effect without running it.
    pub fn new_lazy<F>(runtime: &Runtime, run: F) -> Self
    where
        F: Fn() -> Result<()> + 'static,
    {
        let core = EffectCore::new(runtime, Rc::new(run), None, None);
        Self { core }
    }

    pub fn with_options<F>(runtime: &Runtime, run: F, options: EffectOptions) -> Result<Self>
    where
        F: Fn() -> Result<()> + 'static,
    {
        let core = EffectCore::new(runtime, Rc::new(run), options.scheduler, options.label);
        let effect = Self { core };
        if !options.lazy {
            if let Err(error) = effect.execute() {
                effect.dispose();
                return Err(error);
            }
        }
        Ok(effect)
    }

    pub(crate) fn core(&self) -> &Rc<EffectCore> {
        &self.core
    }

    /// Get the subscriber ID for this effect.
    pub fn id(&self) -> SubscriberId {
        self.core.id()
    }

    /// Run the effect now, re-tracking its dependencies.
    pub fn execute(&self) -> Result<()> {
        self.core.execute()
    }

    /// Dispose of the effect.
    ///
    /// After disposal the effect is unsubscribed everywhere and never runs
    /// again. Disposing twice is a no-op.
    pub fn dispose(&self) {
        self.core.dispose();
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn is_disposed(&self) -> bool {
        !self.core.is_active()
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.core.run_count()
    }

    /// Get the number of keys read by the last run.
    pub fn dependency_count(&self) -> usize {
        self.core.dependency_count()
    }

    pub fn disposer(&self) -> Disposer {
        let core = Rc::clone(&self.core);
        Disposer::new(move || core.dispose())
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id())
            .field("label", &self.core.label())
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Runtime {
    /// Run `f` now and again whenever a key it read changes.
    pub fn effect<F>(&self, f: F) -> Result<Disposer>
    where
        F: Fn() -> Result<()> + 'static,
    {
        Ok(Effect::new(self, f)?.disposer())
    }

    /// One effect per named body, with a single disposer for all of them.
    pub fn effects<I, K>(&self, defs: I) -> Result<Disposer>
    where
        I: IntoIterator<Item = (K, EffectFn)>,
        K: Into<String>,
    {
        let mut created = Vec::new();
        for (name, body) in defs {
            let options = EffectOptions {
                label: Some(name.into()),
                ..EffectOptions::default()
            };
            match Effect::with_options(self, body, options) {
                Ok(effect) => created.push(effect.disposer()),
                Err(error) => {
                    Disposer::merge(created).dispose();
                    return Err(error);
                }
            }
        }
        Ok(Disposer::merge(created))
    }
}

/// Create an effect on the current thread's runtime.
pub fn effect<F>(f: F) -> Result<Disposer>
where
    F: Fn() -> Result<()> + 'static,
{
    Runtime::current().effect(f)
}

/// Create several named effects on the current thread's runtime.
pub fn effects<I, K>(defs: I) -> Result<Disposer>
where
    I: IntoIterator<Item = (K, EffectFn)>,
    K: Into<String>,
{
    Runtime::current().effects(defs)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{on_cleanup, Store, Value};
    use crate::{Error, RuntimeConfig};
    use serde_json::json;

    fn setup(json: serde_json::Value) -> (Runtime, Store) {
        let runtime = Runtime::new(RuntimeConfig::default());
        let store = runtime.state(json).unwrap();
        (runtime, store)
    }

    fn counter() -> (Rc<Cell<usize>>, Rc<Cell<usize>>) {
        let count = Rc::new(Cell::new(0));
        (count.clone(), count)
    }

    #[test]
    fn effect_runs_on_creation() {
        let runtime = Runtime::default();
        let (run_count, run_count_clone) = counter();

        let _effect = Effect::new(&runtime, move || {
            run_count_clone.set(run_count_clone.get() + 1);
            Ok(())
        })
        .unwrap();

        // Effect should have run once on creation
        assert_eq!(run_count.get(), 1);
    }

    #[test]
    fn effect_lazy_does_not_run_on_creation() {
        let runtime = Runtime::default();
        let (run_count, run_count_clone) = counter();

        let effect = Effect::new_lazy(&runtime, move || {
            run_count_clone.set(run_count_clone.get() + 1);
            Ok(())
        });

        assert_eq!(run_count.get(), 0);
        assert_eq!(effect.run_count(), 0);

        // Manually execute
        effect.execute().unwrap();
        assert_eq!(run_count.get(), 1);
        assert_eq!(effect.run_count(), 1);
    }

    #[test]
    fn effect_reruns_when_dependency_changes() {
        let (runtime, store) = setup(json!({ "count": 0, "other": 0 }));
        let log = Rc::new(RefCell::new(Vec::new()));

        let reader = store.clone();
        let sink = log.clone();
        let effect = Effect::new(&runtime, move || {
            sink.borrow_mut().push(reader.get("count"));
            Ok(())
        })
        .unwrap();

        store.set("count", 1).unwrap();
        store.set("count", 1).unwrap();
        store.set("other", 9).unwrap();

        assert_eq!(*log.borrow(), vec![Value::from(0), Value::from(1)]);
        assert_eq!(effect.dependency_count(), 1);
    }

    #[test]
    fn conditional_branches_are_pruned() {
        let (runtime, store) = setup(json!({ "flag": true, "a": 0, "b": 0 }));
        let (runs, runs_clone) = counter();

        let reader = store.clone();
        let _effect = Effect::new(&runtime, move || {
            runs_clone.set(runs_clone.get() + 1);
            let key = if reader.get("flag") == Value::from(true) { "a" } else { "b" };
            reader.get(key);
            Ok(())
        })
        .unwrap();

        assert_eq!(store.subscriber_count("a"), 1);
        assert_eq!(store.subscriber_count("b"), 0);

        store.set("flag", false).unwrap();
        assert_eq!(runs.get(), 2);
        assert_eq!(store.subscriber_count("a"), 0);
        assert_eq!(store.subscriber_count("b"), 1);

        // `a` is no longer a dependency.
        store.set("a", 5).unwrap();
        assert_eq!(runs.get(), 2);

        store.set("b", 5).unwrap();
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn effect_does_not_run_after_disposal() {
        let (runtime, store) = setup(json!({ "n": 0 }));
        let (run_count, run_count_clone) = counter();

        let reader = store.clone();
        let effect = Effect::new(&runtime, move || {
            reader.get("n");
            run_count_clone.set(run_count_clone.get() + 1);
            Ok(())
        })
        .unwrap();

        assert_eq!(run_count.get(), 1);

        effect.dispose();
        effect.dispose();
        assert!(effect.is_disposed());
        assert_eq!(store.subscriber_count("n"), 0);

        store.set("n", 1).unwrap();
        effect.execute().unwrap();
        assert_eq!(run_count.get(), 1);
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let (runtime, store) = setup(json!({ "n": 0 }));
        let log = Rc::new(RefCell::new(Vec::new()));

        let disposers: Vec<Disposer> = ["first", "second", "third"]
            .into_iter()
            .map(|name| {
                let reader = store.clone();
                let sink = log.clone();
                runtime
                    .effect(move || {
                        reader.get("n");
                        sink.borrow_mut().push(name);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        log.borrow_mut().clear();
        store.set("n", 1).unwrap();
        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
        assert_eq!(disposers.len(), 3);
    }

    #[test]
    fn failing_subscriber_stops_later_ones_for_that_write() {
        let (runtime, store) = setup(json!({ "n": 0 }));
        let (late_runs, late_clone) = counter();

        let reader = store.clone();
        let _failing = runtime
            .effect(move || {
                if reader.get("n") == Value::from(1) {
                    return Err(Error::msg("boom"));
                }
                Ok(())
            })
            .unwrap();

        let reader = store.clone();
        let _late = runtime
            .effect(move || {
                reader.get("n");
                late_clone.set(late_clone.get() + 1);
                Ok(())
            })
            .unwrap();

        let err = store.set("n", 1).unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(late_runs.get(), 1);
        // The value was written before subscribers ran.
        assert_eq!(store.get("n"), Value::from(1));

        store.set("n", 2).unwrap();
        assert_eq!(late_runs.get(), 2);
    }

    #[test]
    fn failing_first_run_is_disposed() {
        let (runtime, store) = setup(json!({ "n": 0 }));
        let reader = store.clone();

        let result = runtime.effect(move || {
            reader.get("n");
            Err(Error::msg("nope"))
        });

        assert!(result.is_err());
        assert_eq!(store.subscriber_count("n"), 0);
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_dispose() {
        let (runtime, store) = setup(json!({ "n": 0 }));
        Runtime::set_current(runtime.clone());
        let log = Rc::new(RefCell::new(Vec::new()));

        let reader = store.clone();
        let sink = log.clone();
        let stop = runtime
            .effect(move || {
                let n = reader.get("n").as_i64().unwrap();
                sink.borrow_mut().push(format!("run {n}"));
                let sink = sink.clone();
                on_cleanup(move || sink.borrow_mut().push(format!("cleanup {n}")));
                Ok(())
            })
            .unwrap();

        store.set("n", 1).unwrap();
        stop.dispose();
        stop.dispose();

        assert_eq!(
            *log.borrow(),
            vec!["run 0", "cleanup 0", "run 1", "cleanup 1"]
        );
    }

    #[test]
    fn self_write_is_bounded() {
        let runtime = Runtime::new(RuntimeConfig {
            max_update_depth: 10,
            ..RuntimeConfig::default()
        });
        let store = runtime.state(json!({ "n": 0 })).unwrap();

        let reader = store.clone();
        let err = runtime
            .effect(move || {
                let n = reader.get("n").as_i64().unwrap();
                reader.set("n", n + 1)
            })
            .unwrap_err();

        assert!(matches!(err, Error::CascadeOverflow { limit: 10, .. }));
        assert_eq!(runtime.update_depth(), 0);
        assert_eq!(store.subscriber_count("n"), 0);
    }

    #[test]
    fn self_write_that_converges_is_allowed() {
        let (runtime, store) = setup(json!({ "n": 0 }));

        let reader = store.clone();
        let _stop = runtime
            .effect(move || {
                let n = reader.get("n").as_i64().unwrap();
                if n < 5 {
                    reader.set("n", n + 1)?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get("n"), Value::from(5));
        assert_eq!(store.subscriber_count("n"), 1);
    }

    #[test]
    fn effects_share_one_disposer() {
        let (runtime, store) = setup(json!({ "a": 0, "b": 0 }));
        let (runs, runs_clone) = counter();

        let (ra, rb) = (store.clone(), store.clone());
        let (ca, cb) = (runs_clone.clone(), runs_clone);
        let a: EffectFn = Box::new(move || {
            ra.get("a");
            ca.set(ca.get() + 1);
            Ok(())
        });
        let b: EffectFn = Box::new(move || {
            rb.get("b");
            cb.set(cb.get() + 1);
            Ok(())
        });
        let stop = runtime.effects([("a", a), ("b", b)]).unwrap();

        assert_eq!(runs.get(), 2);
        stop.dispose();
        store.set("a", 1).unwrap();
        store.set("b", 1).unwrap();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn effect_clone_shares_state() {
        let runtime = Runtime::default();
        let effect1 = Effect::new(&runtime, || Ok(())).unwrap();
        let effect2 = effect1.clone();

        assert_eq!(effect1.id(), effect2.id());

        effect1.execute().unwrap();
        assert_eq!(effect2.run_count(), 2);

        effect1.dispose();
        assert!(effect2.is_disposed());
    }
}
