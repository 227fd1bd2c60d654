#![forbid(unsafe_code)]
use crate::{
    node::{NodeFlags, NodeId, ReactiveNode, ReactiveNodeType},
    runtime::{with_runtime, RestoreScope},
};
use std::fmt;

/// Creates a [`Scope`] and runs `f` inside it.
///
/// While `f` runs, the scope is the active scope: effects and nested
/// scopes created without a running subscriber attach to it, and disposing
/// the scope later disposes all of them in LIFO order. The scope itself
/// attaches to whatever scope surrounds it, so cascades nest.
///
/// Scopes manage memory within the reactive system. A keyed list, for
/// example, wants one scope per row so a removed row's effects are
/// released together.
///
/// ```
/// # use strand_reactive::*;
/// let a = create_source(0);
/// let scope = create_scope(|| {
///     create_effect(move || {
///         let _ = a.get();
///     });
/// });
/// scope.dispose(); // the effect is disposed with it
/// ```
#[cfg_attr(debug_assertions, tracing::instrument(level = "trace", skip_all))]
#[track_caller]
pub fn create_scope(f: impl FnOnce()) -> Scope {
    create_concrete_scope(f, true)
}

/// Like [`create_scope`], but the new scope does not attach to its parent:
/// disposing the surrounding scope leaves it untouched.
#[cfg_attr(debug_assertions, tracing::instrument(level = "trace", skip_all))]
#[track_caller]
pub fn create_detached_scope(f: impl FnOnce()) -> Scope {
    create_concrete_scope(f, false)
}

#[track_caller]
fn create_concrete_scope(f: impl FnOnce(), attach: bool) -> Scope {
    let id = with_runtime(|runtime| {
        let id = runtime.create_node(ReactiveNode::new(
            ReactiveNodeType::Scope,
            NodeFlags::empty(),
        ));
        if attach {
            if let Some(parent) = runtime.active_scope.get() {
                runtime.link(id, parent);
            }
        }
        id
    });
    let scope = Scope {
        id,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    };
    scope.run_in(f);
    scope
}

/// A reactive node that owns the effects and scopes created under it, for
/// cascade disposal. It runs no body of its own.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub(crate) id: NodeId,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("id", &self.id).finish()
    }
}

impl Scope {
    /// Re-enters the scope: runs `f` with this scope installed as the
    /// active scope, restoring the previous one on all exit paths.
    pub fn run_in<T>(&self, f: impl FnOnce() -> T) -> T {
        let prev =
            with_runtime(|runtime| runtime.active_scope.replace(Some(self.id)));
        let _restore = RestoreScope(prev);
        f()
    }

    /// Disposes the scope and, in LIFO order, every effect and scope
    /// created while it was active. Idempotent.
    #[cfg_attr(
        debug_assertions,
        tracing::instrument(
            level = "trace",
            name = "Scope::dispose()",
            skip_all,
            fields(
                id = ?self.id,
                defined_at = %self.defined_at
            )
        )
    )]
    pub fn dispose(&self) {
        with_runtime(|runtime| runtime.dispose_node(self.id));
    }

    /// Whether this scope has been disposed.
    pub fn is_disposed(&self) -> bool {
        !with_runtime(|runtime| runtime.is_alive(self.id))
    }

    /// Registers a callback to run when this scope is disposed.
    pub fn on_dispose(&self, f: impl FnOnce() + 'static) {
        with_runtime(|runtime| runtime.add_disposer(self.id, Box::new(f)));
    }
}
