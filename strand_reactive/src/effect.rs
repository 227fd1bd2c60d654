#![forbid(unsafe_code)]
use crate::{
    node::{NodeFlags, NodeId, ReactiveNode, ReactiveNodeType},
    runtime::with_runtime,
};
use std::{cell::Cell, cell::RefCell, fmt, rc::Rc};

/// Creates an [`Effect`] and runs it once immediately.
///
/// Effects run a chunk of side-effectful code whenever the sources and
/// derived values they read change. The first run happens eagerly at
/// creation; it tracks every reactive read in the body, and the effect
/// re-runs whenever one of those dependencies changes. Each re-run
/// re-tracks from scratch, so dependencies may differ between runs.
///
/// Effects are intended for *side effects* of the system: writing to a
/// log, to the DOM, to a file. Don't use them to synchronize state within
/// the system. That is what [`create_derived`](crate::create_derived) is
/// for.
///
/// ```
/// # use strand_reactive::*;
/// # use std::{cell::RefCell, rc::Rc};
/// let a = create_source(0);
/// let log = Rc::new(RefCell::new(Vec::new()));
///
/// create_effect({
///     let log = Rc::clone(&log);
///     move || log.borrow_mut().push(a.get())
/// });
/// assert_eq!(*log.borrow(), vec![0]);
///
/// a.set(1);
/// assert_eq!(*log.borrow(), vec![0, 1]);
/// ```
#[cfg_attr(debug_assertions, tracing::instrument(level = "trace", skip_all))]
#[track_caller]
pub fn create_effect(f: impl FnMut() + 'static) -> Effect {
    let effect = create_concrete_effect(f);
    with_runtime(|runtime| runtime.run_effect_body(effect.id));
    effect
}

/// Creates an [`Effect`] whose first run is deferred.
///
/// A lazy effect has no dependencies until something gives it some: either
/// an explicit [`Effect::run`], or
/// [`track_with_effect`](crate::track_with_effect) priming its initial
/// edge set.
#[cfg_attr(debug_assertions, tracing::instrument(level = "trace", skip_all))]
#[track_caller]
pub fn create_lazy_effect(f: impl FnMut() + 'static) -> Effect {
    create_concrete_effect(f)
}

#[track_caller]
fn create_concrete_effect(f: impl FnMut() + 'static) -> Effect {
    with_runtime(|runtime| {
        let state = Rc::new(EffectState {
            body: RefCell::new(Box::new(f)),
            paused: Cell::new(false),
            scheduler: RefCell::new(None),
        });
        let id = runtime.create_node(ReactiveNode::new(
            ReactiveNodeType::Effect { state },
            NodeFlags::WATCHING,
        ));
        // ownership edge: a nested effect belongs to the running
        // subscriber, otherwise to the surrounding scope
        if let Some(sub) = runtime.active_sub.get() {
            runtime.link(id, sub);
        } else if let Some(scope) = runtime.active_scope.get() {
            runtime.link(id, scope);
        }
        Effect {
            id,
            #[cfg(debug_assertions)]
            defined_at: std::panic::Location::caller(),
        }
    })
}

/// Registers a cleanup callback on the currently running effect.
///
/// Cleanups run in LIFO order immediately before the effect's next body
/// run, and at disposal. Outside an effect, the callback is attached to
/// the active scope as a disposer instead; with neither, it is dropped.
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    with_runtime(|runtime| {
        if let Some(sub) = runtime.active_sub.get() {
            runtime.add_cleanup(sub, Box::new(f));
        } else if let Some(scope) = runtime.active_scope.get() {
            runtime.add_disposer(scope, Box::new(f));
        } else {
            tracing::debug!("on_cleanup called outside any reactive context");
        }
    });
}

pub(crate) struct EffectState {
    pub body: RefCell<Box<dyn FnMut()>>,
    pub paused: Cell<bool>,
    #[allow(clippy::type_complexity)]
    pub scheduler: RefCell<Option<Rc<dyn Fn(Effect) -> bool>>>,
}

/// A reactive node with a side-effectful body, re-run when any of its
/// dependencies changes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    pub(crate) id: NodeId,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect").field("id", &self.id).finish()
    }
}

impl Effect {
    #[track_caller]
    pub(crate) fn from_id(id: NodeId) -> Self {
        Self {
            id,
            #[cfg(debug_assertions)]
            defined_at: std::panic::Location::caller(),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    /// Forces an immediate body execution, with full re-tracking.
    #[cfg_attr(
        debug_assertions,
        tracing::instrument(
            level = "trace",
            name = "Effect::run()",
            skip_all,
            fields(
                id = ?self.id,
                defined_at = %self.defined_at
            )
        )
    )]
    pub fn run(&self) {
        with_runtime(|runtime| runtime.run_effect_body(self.id));
    }

    /// Suspends body execution. Notifications received while paused leave
    /// their dirty markers in place; [`resume`](Self::resume) settles
    /// them.
    pub fn pause(&self) {
        if let Some(state) = self.state() {
            state.paused.set(true);
        }
    }

    /// Resumes body execution. If the effect was marked while paused it
    /// runs now (or at the end of the open batch).
    pub fn resume(&self) {
        let Some(state) = self.state() else {
            return;
        };
        state.paused.set(false);
        with_runtime(|runtime| {
            let flags = runtime.flags_of(self.id);
            if !flags.intersects(NodeFlags::DIRTY | NodeFlags::PENDING) {
                return;
            }
            if runtime.batch_depth.get() == 0 {
                runtime.run_effect(self.id);
            } else if !flags.contains(NodeFlags::QUEUED) {
                // re-queue: the pause consumed this effect's flush slot
                if let Some(node) =
                    runtime.nodes.borrow_mut().get_mut(self.id)
                {
                    node.flags |= NodeFlags::QUEUED;
                }
                runtime.queue.borrow_mut().push(self.id);
            }
        });
    }

    /// Installs a scheduler hook consulted at flush time. Returning `true`
    /// means "scheduled elsewhere": the engine skips the immediate run and
    /// the hook is responsible for eventually calling
    /// [`run`](Self::run).
    pub fn set_scheduler(&self, hook: impl Fn(Effect) -> bool + 'static) {
        if let Some(state) = self.state() {
            *state.scheduler.borrow_mut() = Some(Rc::new(hook));
        }
    }

    /// Registers a cleanup callback, run in LIFO order before the next
    /// body run and at disposal.
    pub fn on_cleanup(&self, f: impl FnOnce() + 'static) {
        with_runtime(|runtime| runtime.add_cleanup(self.id, Box::new(f)));
    }

    /// Registers a callback to run when this effect is disposed.
    pub fn on_dispose(&self, f: impl FnOnce() + 'static) {
        with_runtime(|runtime| runtime.add_disposer(self.id, Box::new(f)));
    }

    /// Disposes the effect: runs its cleanup list, then its disposers, and
    /// detaches every edge. A disposed effect still queued for a flush is
    /// skipped. Idempotent.
    pub fn dispose(&self) {
        with_runtime(|runtime| runtime.dispose_node(self.id));
    }

    /// Whether this effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        !with_runtime(|runtime| runtime.is_alive(self.id))
    }

    fn state(&self) -> Option<Rc<EffectState>> {
        with_runtime(|runtime| {
            let nodes = runtime.nodes.borrow();
            nodes.get(self.id).and_then(|node| match &node.node_type {
                ReactiveNodeType::Effect { state } => Some(Rc::clone(state)),
                _ => None,
            })
        })
    }
}
