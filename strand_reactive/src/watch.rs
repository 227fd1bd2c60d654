#![forbid(unsafe_code)]
use crate::{
    effect::{create_effect, Effect},
    runtime::untracked,
};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

/// A version of [`create_effect`] that separates *what* is tracked from
/// *what happens*: `deps` is read under tracking, and `callback` receives
/// the new and previous values whenever `deps` produces a new result.
///
/// The callback itself runs untracked, so signals it reads do not become
/// dependencies.
///
/// ```
/// # use strand_reactive::*;
/// # use std::{cell::RefCell, rc::Rc};
/// let num = create_source(0);
/// let log = Rc::new(RefCell::new(Vec::new()));
///
/// let watcher = watch(
///     move || num.get(),
///     {
///         let log = Rc::clone(&log);
///         move |num, prev| log.borrow_mut().push((*num, prev.copied()))
///     },
///     false,
/// );
///
/// num.set(1);
/// assert_eq!(*log.borrow(), vec![(1, Some(0))]);
///
/// watcher.dispose();
/// num.set(2); // nothing happens
/// assert_eq!(log.borrow().len(), 1);
/// ```
///
/// ## Immediate
///
/// If `immediate` is true the callback also runs at creation, with no
/// previous value. Otherwise it first runs after the first detected
/// change.
#[cfg_attr(
    debug_assertions,
    tracing::instrument(level = "trace", skip_all, fields(ty = %std::any::type_name::<W>()))
)]
#[track_caller]
pub fn watch<W>(
    deps: impl Fn() -> W + 'static,
    callback: impl Fn(&W, Option<&W>) + 'static,
    immediate: bool,
) -> Watcher
where
    W: Clone + 'static,
{
    watch_with_options(
        deps,
        callback,
        WatchOptions {
            immediate,
            ..Default::default()
        },
    )
}

/// Configuration for [`watch_with_options`].
pub struct WatchOptions<W> {
    /// Run the callback at creation, with no previous value.
    pub immediate: bool,
    /// Dispose the watcher after the first delivered callback.
    pub once: bool,
    /// Gate: the callback only fires when this returns true. The previous
    /// value still advances on gated runs.
    #[allow(clippy::type_complexity)]
    pub filter: Option<Rc<dyn Fn(&W, Option<&W>) -> bool>>,
}

impl<W> Default for WatchOptions<W> {
    fn default() -> Self {
        Self {
            immediate: false,
            once: false,
            filter: None,
        }
    }
}

/// [`watch`] with the full option set: `immediate`, `once`, and a `filter`
/// predicate gating the callback.
#[track_caller]
pub fn watch_with_options<W>(
    deps: impl Fn() -> W + 'static,
    callback: impl Fn(&W, Option<&W>) + 'static,
    options: WatchOptions<W>,
) -> Watcher
where
    W: Clone + 'static,
{
    let WatchOptions {
        immediate,
        once,
        filter,
    } = options;

    let prev_value = Rc::new(RefCell::new(None::<W>));
    let paused = Rc::new(Cell::new(false));
    let ignoring = Rc::new(Cell::new(false));
    // filled in after the effect exists, so `once` can dispose from inside
    let handle: Rc<Cell<Option<Effect>>> = Rc::new(Cell::new(None));
    let fired = Rc::new(Cell::new(false));

    let effect = create_effect({
        let prev_value = Rc::clone(&prev_value);
        let paused = Rc::clone(&paused);
        let ignoring = Rc::clone(&ignoring);
        let handle = Rc::clone(&handle);
        let fired = Rc::clone(&fired);
        move || {
            let new_value = deps();
            let old_value = prev_value.borrow_mut().replace(new_value.clone());
            let first_run = old_value.is_none();
            if first_run && !immediate {
                return;
            }
            if paused.get() || ignoring.get() {
                return;
            }
            if let Some(filter) = &filter {
                if !filter(&new_value, old_value.as_ref()) {
                    return;
                }
            }
            untracked(|| callback(&new_value, old_value.as_ref()));
            if once {
                fired.set(true);
                if let Some(effect) = handle.get() {
                    effect.dispose();
                }
            }
        }
    });
    handle.set(Some(effect));
    if once && fired.get() {
        // the immediate run already delivered
        effect.dispose();
    }
    Watcher {
        effect,
        paused,
        ignoring,
    }
}

/// Handle to a running [`watch`]. Cloneable; all clones control the same
/// watcher.
#[derive(Clone)]
pub struct Watcher {
    effect: Effect,
    paused: Rc<Cell<bool>>,
    ignoring: Rc<Cell<bool>>,
}

impl Watcher {
    /// Suppresses the callback. Dependencies are still tracked and the
    /// previous value still advances while paused.
    pub fn pause(&self) {
        self.paused.set(true);
    }

    /// Re-arms the callback. Changes that happened while paused are not
    /// replayed.
    pub fn resume(&self) {
        self.paused.set(false);
    }

    /// Runs `f` with the callback disarmed, restoring it afterwards even
    /// if `f` unwinds.
    pub fn ignore_updates<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev = self.ignoring.replace(true);
        let _restore = RestoreIgnoring {
            flag: Rc::clone(&self.ignoring),
            prev,
        };
        f()
    }

    /// Disposes the underlying effect. Idempotent.
    pub fn dispose(&self) {
        self.effect.dispose();
    }

    /// Whether the watcher has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.effect.is_disposed()
    }
}

struct RestoreIgnoring {
    flag: Rc<Cell<bool>>,
    prev: bool,
}

impl Drop for RestoreIgnoring {
    fn drop(&mut self) {
        self.flag.set(self.prev);
    }
}
