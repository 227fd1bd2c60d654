#![forbid(unsafe_code)]
use crate::{
    node::{AnyComputation, NodeError, NodeFlags, NodeId, ReactiveNode, ReactiveNodeType},
    runtime::with_runtime,
};
use std::{any::Any, cell::RefCell, fmt, marker::PhantomData, rc::Rc};

/// Creates a [`Source`], the basic reactive primitive: a value that is
/// externally written and notifies subscribers when it changes.
///
/// Writes are suppressed by equality: setting a source to a value equal to
/// the one it already holds propagates nothing.
///
/// ```
/// # use strand_reactive::*;
/// let count = create_source(0);
///
/// // calling the getter clones and returns the value
/// assert_eq!(count.get(), 0);
///
/// // calling the setter sets the value
/// count.set(1);
/// assert_eq!(count.get(), 1);
///
/// // or we can mutate it in place with update()
/// count.update(|n| *n += 1);
/// assert_eq!(count.get(), 2);
/// ```
#[cfg_attr(
    debug_assertions,
    tracing::instrument(level = "trace", skip_all, fields(ty = %std::any::type_name::<T>()))
)]
#[track_caller]
pub fn create_source<T>(value: T) -> Source<T>
where
    T: Clone + PartialEq + 'static,
{
    create_source_with_compare(value, |a: &T, b: &T| a == b)
}

/// Creates a [`Source`] with a custom equality predicate used for write
/// suppression and batch-collapse detection.
///
/// Wrappers around mutable collections install `|_, _| false` so every
/// write counts as a change regardless of contents.
#[track_caller]
pub fn create_source_with_compare<T>(
    value: T,
    compare: impl Fn(&T, &T) -> bool + 'static,
) -> Source<T>
where
    T: Clone + 'static,
{
    let slot = SourceSlot {
        previous: value.clone(),
        current: value,
        compare: Rc::new(compare),
    };
    let id = with_runtime(|runtime| {
        runtime.create_node(ReactiveNode::with_value(
            ReactiveNodeType::Source {
                update: Rc::new(SourceState::<T> { ty: PhantomData }),
                auto_dispose: false,
            },
            NodeFlags::MUTABLE,
            Rc::new(RefCell::new(slot)),
        ))
    });
    Source {
        id,
        ty: PhantomData,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

/// A reactive node whose value is externally written.
///
/// `Source` is a `Copy` handle into the thread-local reactive runtime.
/// Reading it inside a tracked context (a derived getter or an effect
/// body) establishes a dependency edge; writing it marks the subscriber
/// subgraph and flushes affected effects once the outermost batch ends.
pub struct Source<T>
where
    T: 'static,
{
    pub(crate) id: NodeId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Source<T> {}

impl<T> PartialEq for Source<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Source<T> {}

impl<T> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("id", &self.id).finish()
    }
}

/// The typed payload behind a source node: the live value, the value its
/// subscribers last observed, and the equality predicate.
pub(crate) struct SourceSlot<T> {
    pub current: T,
    pub previous: T,
    pub compare: Rc<dyn Fn(&T, &T) -> bool>,
}

/// Pull-phase update for a source: folds the live value into the
/// last-observed value and reports whether they differed. This is what
/// makes writes that collapse inside a batch (x: 0 → 1 → 0) run nothing.
pub(crate) struct SourceState<T> {
    ty: PhantomData<T>,
}

impl<T> AnyComputation for SourceState<T>
where
    T: Clone + 'static,
{
    fn run(&self, value: Rc<RefCell<dyn Any>>) -> bool {
        let mut value = value.borrow_mut();
        let slot = value
            .downcast_mut::<SourceSlot<T>>()
            .expect("to downcast source value");
        let changed = !(slot.compare)(&slot.previous, &slot.current);
        slot.previous = slot.current.clone();
        changed
    }
}

impl<T> Source<T>
where
    T: 'static,
{
    /// Applies `f` to the current value, subscribing the running tracked
    /// context to this source.
    #[track_caller]
    pub fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with(f)
            .expect("tried to access a source that has been disposed")
    }

    /// Fallible [`with`](Self::with).
    pub fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Result<O, NodeError> {
        self.read(f, true)
    }

    /// Applies `f` to the current value without establishing a dependency.
    #[track_caller]
    pub fn with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with_untracked(f)
            .expect("tried to access a source that has been disposed")
    }

    /// Fallible [`with_untracked`](Self::with_untracked).
    pub fn try_with_untracked<O>(
        &self,
        f: impl FnOnce(&T) -> O,
    ) -> Result<O, NodeError> {
        self.read(f, false)
    }

    fn read<O>(
        &self,
        f: impl FnOnce(&T) -> O,
        track: bool,
    ) -> Result<O, NodeError> {
        with_runtime(|runtime| {
            runtime.update_source_if_necessary(self.id);
            if track {
                runtime.track_dep(self.id);
            }
            let value = runtime.try_node_value(self.id)?;
            let value = value.borrow();
            let slot = value
                .downcast_ref::<SourceSlot<T>>()
                .ok_or(NodeError::Type(std::any::type_name::<T>()))?;
            Ok(f(&slot.current))
        })
    }

    /// Clones and returns the current value, subscribing the running
    /// tracked context to this source.
    ///
    /// # Panics
    /// Panics if the source has been disposed.
    #[track_caller]
    #[inline(always)]
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Fallible [`get`](Self::get).
    #[inline(always)]
    pub fn try_get(&self) -> Result<T, NodeError>
    where
        T: Clone,
    {
        self.try_with(T::clone)
    }

    /// Clones and returns the current value without establishing a
    /// dependency.
    #[track_caller]
    #[inline(always)]
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.with_untracked(T::clone)
    }

    /// Fallible [`get_untracked`](Self::get_untracked).
    #[inline(always)]
    pub fn try_get_untracked(&self) -> Result<T, NodeError>
    where
        T: Clone,
    {
        self.try_with_untracked(T::clone)
    }

    /// Sets the value. If the new value differs from the current one (by
    /// the node's equality predicate), marks the subscriber subgraph and
    /// flushes at batch depth zero.
    #[cfg_attr(
        debug_assertions,
        tracing::instrument(
            level = "trace",
            name = "Source::set()",
            skip_all,
            fields(
                id = ?self.id,
                defined_at = %self.defined_at
            )
        )
    )]
    #[track_caller]
    pub fn set(&self, new_value: T) {
        self.try_set(new_value)
            .expect("tried to set a source that has been disposed")
    }

    /// Fallible [`set`](Self::set).
    pub fn try_set(&self, new_value: T) -> Result<(), NodeError> {
        with_runtime(|runtime| {
            let value = runtime.try_node_value(self.id)?;
            let changed = {
                let mut value = value.borrow_mut();
                let slot = value
                    .downcast_mut::<SourceSlot<T>>()
                    .ok_or(NodeError::Type(std::any::type_name::<T>()))?;
                if (slot.compare)(&slot.current, &new_value) {
                    false
                } else {
                    slot.current = new_value;
                    true
                }
            };
            if changed {
                if let Some(observer) = runtime.observer() {
                    let value = value.borrow();
                    if let Some(slot) = value.downcast_ref::<SourceSlot<T>>() {
                        observer.on_update(
                            self.id,
                            &slot.current,
                            Some(&slot.previous),
                        );
                    }
                }
                runtime.mark_dirty_and_propagate(self.id);
            }
            Ok(())
        })
    }

    /// Mutates the value in place and notifies subscribers.
    ///
    /// `update` does not consult the equality predicate: subscribers re-run
    /// even if the closure left the value untouched.
    #[track_caller]
    pub fn update(&self, f: impl FnOnce(&mut T))
    where
        T: Clone,
    {
        self.try_update(f)
            .expect("tried to update a source that has been disposed")
    }

    /// Fallible [`update`](Self::update).
    pub fn try_update<O>(
        &self,
        f: impl FnOnce(&mut T) -> O,
    ) -> Result<O, NodeError>
    where
        T: Clone,
    {
        with_runtime(|runtime| {
            let value = runtime.try_node_value(self.id)?;
            let result = {
                let mut value = value.borrow_mut();
                let slot = value
                    .downcast_mut::<SourceSlot<T>>()
                    .ok_or(NodeError::Type(std::any::type_name::<T>()))?;
                let result = f(&mut slot.current);
                slot.previous = slot.current.clone();
                result
            };
            runtime.force_notify(self.id);
            Ok(result)
        })
    }

    /// Sets the value without any propagation; subscribers never learn
    /// about it.
    pub fn set_untracked(&self, new_value: T)
    where
        T: Clone,
    {
        self.try_update_untracked(|value| *value = new_value)
            .expect("tried to set a source that has been disposed")
    }

    /// Mutates the value in place without any propagation.
    pub fn update_untracked(&self, f: impl FnOnce(&mut T))
    where
        T: Clone,
    {
        self.try_update_untracked(f)
            .expect("tried to update a source that has been disposed")
    }

    /// Fallible [`update_untracked`](Self::update_untracked).
    pub fn try_update_untracked<O>(
        &self,
        f: impl FnOnce(&mut T) -> O,
    ) -> Result<O, NodeError>
    where
        T: Clone,
    {
        with_runtime(|runtime| {
            let value = runtime.try_node_value(self.id)?;
            let mut value = value.borrow_mut();
            let slot = value
                .downcast_mut::<SourceSlot<T>>()
                .ok_or(NodeError::Type(std::any::type_name::<T>()))?;
            let result = f(&mut slot.current);
            slot.previous = slot.current.clone();
            Ok(result)
        })
    }

    /// Forces propagation to subscribers even though the value has not
    /// changed. This is the escape hatch used after in-place mutation of
    /// a value the equality predicate cannot see through.
    #[cfg_attr(
        debug_assertions,
        tracing::instrument(
            level = "trace",
            name = "Source::notify()",
            skip_all,
            fields(
                id = ?self.id,
                defined_at = %self.defined_at
            )
        )
    )]
    pub fn notify(&self) {
        with_runtime(|runtime| runtime.force_notify(self.id));
    }

    /// Subscribes the running tracked context to this source without
    /// reading its value.
    pub fn track(&self) {
        with_runtime(|runtime| runtime.track_dep(self.id));
    }

    /// Opts this source into auto-disposal: once its last subscriber
    /// unlinks, the node is disposed.
    pub fn dispose_on_unwatched(&self) {
        with_runtime(|runtime| {
            if let Some(node) = runtime.nodes.borrow_mut().get_mut(self.id) {
                if let ReactiveNodeType::Source { auto_dispose, .. } =
                    &mut node.node_type
                {
                    *auto_dispose = true;
                }
            }
        });
    }

    /// Disposes the source. Idempotent; registered disposers run once, in
    /// LIFO order.
    pub fn dispose(&self) {
        with_runtime(|runtime| runtime.dispose_node(self.id));
    }

    /// Whether this source has been disposed.
    pub fn is_disposed(&self) -> bool {
        !with_runtime(|runtime| runtime.is_alive(self.id))
    }

    /// Registers a callback to run when this source is disposed. Ignored
    /// if the source is already gone.
    pub fn on_dispose(&self, f: impl FnOnce() + 'static) {
        with_runtime(|runtime| runtime.add_disposer(self.id, Box::new(f)));
    }
}

#[cfg(feature = "nightly")]
impl<T: Clone> FnOnce<()> for Source<T> {
    type Output = T;

    #[inline(always)]
    extern "rust-call" fn call_once(self, _args: ()) -> Self::Output {
        self.get()
    }
}

#[cfg(feature = "nightly")]
impl<T: Clone> FnMut<()> for Source<T> {
    #[inline(always)]
    extern "rust-call" fn call_mut(&mut self, _args: ()) -> Self::Output {
        self.get()
    }
}

#[cfg(feature = "nightly")]
impl<T: Clone> Fn<()> for Source<T> {
    #[inline(always)]
    extern "rust-call" fn call(&self, _args: ()) -> Self::Output {
        self.get()
    }
}
