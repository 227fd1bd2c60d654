#![forbid(unsafe_code)]
use crate::{
    batch,
    node::{AnyComputation, NodeError, NodeFlags, NodeId, ReactiveNode, ReactiveNodeType},
    runtime::with_runtime,
};
use std::{any::Any, cell::Cell, cell::RefCell, fmt, marker::PhantomData, ops::Deref, rc::Rc};

/// Creates a [`Derived`], a lazily recomputed reactive value.
///
/// A derived value comes with two guarantees:
/// 1. It recomputes only *once* per change, no matter how many times it is
///    read.
/// 2. It notifies its subscribers only if the recomputed value actually
///    differs from the cached one.
///
/// Nothing runs at creation time; the first read inside any context
/// triggers the first computation. The getter receives the previously
/// cached value, `None` on the first run.
///
/// ```
/// # use strand_reactive::*;
/// let count = create_source(1);
/// let double = create_derived(move |_| count.get() * 2);
///
/// assert_eq!(double.get(), 2);
/// count.set(5);
/// assert_eq!(double.get(), 10);
/// ```
#[cfg_attr(
    debug_assertions,
    tracing::instrument(level = "trace", skip_all, fields(ty = %std::any::type_name::<T>()))
)]
#[track_caller]
pub fn create_derived<T>(f: impl Fn(Option<&T>) -> T + 'static) -> Derived<T>
where
    T: PartialEq + 'static,
{
    create_derived_with_compare(f, |a: &T, b: &T| a == b)
}

/// Creates a [`Derived`] with a custom equality predicate deciding whether
/// a recomputed value counts as changed.
#[track_caller]
pub fn create_derived_with_compare<T>(
    f: impl Fn(Option<&T>) -> T + 'static,
    compare: impl Fn(&T, &T) -> bool + 'static,
) -> Derived<T>
where
    T: 'static,
{
    Derived {
        id: create_concrete_derived(f, compare, None),
        ty: PhantomData,
        #[cfg(debug_assertions)]
        defined_at: std::panic::Location::caller(),
    }
}

/// Creates a [`WritableDerived`]: a derived value with a write-through
/// setter. Writing it invokes the setter, which typically writes the
/// sources the getter reads; the setter always runs inside a [`batch`] so
/// a setter touching several sources appears atomic.
#[track_caller]
pub fn create_writable_derived<T>(
    getter: impl Fn(Option<&T>) -> T + 'static,
    setter: impl Fn(T) + 'static,
) -> WritableDerived<T>
where
    T: PartialEq + 'static,
{
    let setter: Rc<dyn Any> = Rc::new(SetterState::<T>(Box::new(setter)));
    WritableDerived {
        inner: Derived {
            id: create_concrete_derived(
                getter,
                |a: &T, b: &T| a == b,
                Some(setter),
            ),
            ty: PhantomData,
            #[cfg(debug_assertions)]
            defined_at: std::panic::Location::caller(),
        },
    }
}

fn create_concrete_derived<T>(
    f: impl Fn(Option<&T>) -> T + 'static,
    compare: impl Fn(&T, &T) -> bool + 'static,
    setter: Option<Rc<dyn Any>>,
) -> NodeId
where
    T: 'static,
{
    with_runtime(|runtime| {
        let state = Rc::new(DerivedState {
            f,
            compare,
            id: Cell::new(NodeId::default()),
            ty: PhantomData,
        });
        let id = runtime.create_node(ReactiveNode::with_value(
            ReactiveNodeType::Derived {
                f: Rc::clone(&state) as Rc<dyn AnyComputation>,
                setter,
            },
            // lazy: dirty at birth, computed on first read
            NodeFlags::MUTABLE | NodeFlags::DIRTY,
            Rc::new(RefCell::new(None::<T>)),
        ));
        state.id.set(id);
        id
    })
}

/// A reactive node whose value is recomputed from other reactive reads.
pub struct Derived<T>
where
    T: 'static,
{
    pub(crate) id: NodeId,
    pub(crate) ty: PhantomData<T>,
    #[cfg(debug_assertions)]
    pub(crate) defined_at: &'static std::panic::Location<'static>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Derived<T> {}

impl<T> PartialEq for Derived<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Derived<T> {}

impl<T> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived").field("id", &self.id).finish()
    }
}

pub(crate) struct DerivedState<T, F, C>
where
    F: Fn(Option<&T>) -> T,
    C: Fn(&T, &T) -> bool,
{
    f: F,
    compare: C,
    id: Cell<NodeId>,
    ty: PhantomData<T>,
}

impl<T, F, C> AnyComputation for DerivedState<T, F, C>
where
    T: 'static,
    F: Fn(Option<&T>) -> T,
    C: Fn(&T, &T) -> bool,
{
    fn run(&self, value: Rc<RefCell<dyn Any>>) -> bool {
        // the cache stays borrowed (immutably) while the getter runs, so a
        // reentrant cycle-guarded read can still see the old value
        let new_value = {
            let value = value.borrow();
            let cached = value
                .downcast_ref::<Option<T>>()
                .expect("to downcast derived value");
            (self.f)(cached.as_ref())
        };
        let mut value = value.borrow_mut();
        let cached = value
            .downcast_mut::<Option<T>>()
            .expect("to downcast derived value");
        let changed = match cached.as_ref() {
            Some(old) => !(self.compare)(old, &new_value),
            None => true,
        };
        if changed {
            if let Some(observer) = crate::runtime::with_runtime(|rt| rt.observer()) {
                observer.on_update(
                    self.id.get(),
                    &new_value,
                    cached.as_ref().map(|old| old as &dyn Any),
                );
            }
            *cached = Some(new_value);
        }
        changed
    }
}

pub(crate) struct SetterState<T>(pub Box<dyn Fn(T)>);

impl<T> Derived<T>
where
    T: 'static,
{
    /// Applies `f` to the value, recomputing it first if dependencies
    /// demand it, and subscribes the running tracked context.
    #[track_caller]
    pub fn with<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with(f)
            .expect("tried to access a derived value that has been disposed")
    }

    /// Fallible [`with`](Self::with).
    pub fn try_with<O>(&self, f: impl FnOnce(&T) -> O) -> Result<O, NodeError> {
        self.read(f, true)
    }

    /// Applies `f` to the value without establishing a dependency. The
    /// value may still recompute.
    #[track_caller]
    pub fn with_untracked<O>(&self, f: impl FnOnce(&T) -> O) -> O {
        self.try_with_untracked(f)
            .expect("tried to access a derived value that has been disposed")
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
            if !runtime.is_alive(self.id) {
                return Err(NodeError::Disposed);
            }
            if runtime
                .flags_of(self.id)
                .contains(NodeFlags::RECURSED_CHECK)
            {
                // reentry during our own recompute: resolve to the cached
                // value without linking or recomputing
                if let Some(observer) = runtime.observer() {
                    observer.on_cycle(self.id);
                }
            } else {
                runtime.update_derived_if_necessary(self.id);
                if track {
                    runtime.track_dep_scoped(self.id);
                }
            }
            let value = runtime.try_node_value(self.id)?;
            let value = value.borrow();
            let cached = value
                .downcast_ref::<Option<T>>()
                .ok_or(NodeError::Type(std::any::type_name::<T>()))?;
            match cached.as_ref() {
                Some(value) => Ok(f(value)),
                None => Err(NodeError::Cycle),
            }
        })
    }

    /// Clones and returns the value, recomputing it first if dependencies
    /// demand it, and subscribes the running tracked context.
    ///
    /// # Panics
    /// Panics if the derived value has been disposed.
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

    /// Clones and returns the value without establishing a dependency.
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

    /// Returns the last cached value without recomputing, `None` if the
    /// first computation has not happened yet.
    pub fn get_cached(&self) -> Option<T>
    where
        T: Clone,
    {
        self.try_get_cached()
            .expect("tried to access a derived value that has been disposed")
    }

    /// Fallible [`get_cached`](Self::get_cached).
    pub fn try_get_cached(&self) -> Result<Option<T>, NodeError>
    where
        T: Clone,
    {
        with_runtime(|runtime| {
            let value = runtime.try_node_value(self.id)?;
            let value = value.borrow();
            let cached = value
                .downcast_ref::<Option<T>>()
                .ok_or(NodeError::Type(std::any::type_name::<T>()))?;
            Ok(cached.clone())
        })
    }

    /// Forces a recompute now and, if the value changed, propagates to
    /// subscribers.
    #[cfg_attr(
        debug_assertions,
        tracing::instrument(
            level = "trace",
            name = "Derived::notify()",
            skip_all,
            fields(
                id = ?self.id,
                defined_at = %self.defined_at
            )
        )
    )]
    pub fn notify(&self) {
        with_runtime(|runtime| runtime.force_recompute(self.id));
    }

    /// Subscribes the running tracked context to this derived value
    /// without reading it.
    pub fn track(&self) {
        with_runtime(|runtime| {
            runtime.update_derived_if_necessary(self.id);
            runtime.track_dep_scoped(self.id);
        });
    }

    /// Disposes the derived value. Idempotent.
    pub fn dispose(&self) {
        with_runtime(|runtime| runtime.dispose_node(self.id));
    }

    /// Whether this derived value has been disposed.
    pub fn is_disposed(&self) -> bool {
        !with_runtime(|runtime| runtime.is_alive(self.id))
    }

    /// Registers a callback to run when this derived value is disposed.
    pub fn on_dispose(&self, f: impl FnOnce() + 'static) {
        with_runtime(|runtime| runtime.add_disposer(self.id, Box::new(f)));
    }
}

/// A [`Derived`] with a write-through setter.
pub struct WritableDerived<T>
where
    T: 'static,
{
    inner: Derived<T>,
}

impl<T> Clone for WritableDerived<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for WritableDerived<T> {}

impl<T> fmt::Debug for WritableDerived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableDerived")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl<T> Deref for WritableDerived<T> {
    type Target = Derived<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> WritableDerived<T>
where
    T: 'static,
{
    /// Invokes the setter with `value`. The setter runs inside a
    /// [`batch`], regardless of the caller's batch depth, so writes it
    /// performs appear atomic.
    #[track_caller]
    pub fn set(&self, value: T) {
        self.try_set(value)
            .expect("tried to set a derived value that has been disposed")
    }

    /// Fallible [`set`](Self::set).
    pub fn try_set(&self, value: T) -> Result<(), NodeError> {
        let setter = with_runtime(|runtime| {
            let nodes = runtime.nodes.borrow();
            match nodes.get(self.inner.id) {
                Some(node) if !node.disposed => match &node.node_type {
                    ReactiveNodeType::Derived {
                        setter: Some(setter),
                        ..
                    } => Ok(Rc::clone(setter)),
                    ReactiveNodeType::Derived { setter: None, .. } => {
                        Err(NodeError::NotWritable)
                    }
                    _ => Err(NodeError::Disposed),
                },
                _ => Err(NodeError::Disposed),
            }
        })?;
        let setter = setter
            .downcast::<SetterState<T>>()
            .map_err(|_| NodeError::Type(std::any::type_name::<T>()))?;
        batch(|| (setter.0)(value));
        Ok(())
    }
}

#[cfg(feature = "nightly")]
impl<T: Clone> FnOnce<()> for Derived<T> {
    type Output = T;

    #[inline(always)]
    extern "rust-call" fn call_once(self, _args: ()) -> Self::Output {
        self.get()
    }
}

#[cfg(feature = "nightly")]
impl<T: Clone> FnMut<()> for Derived<T> {
    #[inline(always)]
    extern "rust-call" fn call_mut(&mut self, _args: ()) -> Self::Output {
        self.get()
    }
}

#[cfg(feature = "nightly")]
impl<T: Clone> Fn<()> for Derived<T> {
    #[inline(always)]
    extern "rust-call" fn call(&self, _args: ()) -> Self::Output {
        self.get()
    }
}
