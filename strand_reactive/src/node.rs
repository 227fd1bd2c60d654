use crate::effect::EffectState;
use bitflags::bitflags;
use std::{any::Any, cell::RefCell, rc::Rc};
use thiserror::Error;

slotmap::new_key_type! {
    /// Unique ID assigned to a reactive node.
    pub struct NodeId;
}

slotmap::new_key_type! {
    /// Unique ID assigned to a dependency edge.
    pub struct LinkId;
}

bitflags! {
    /// Per-node state bits read and written by the propagation engine.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub(crate) struct NodeFlags: u32 {
        /// The node can invalidate subscribers (sources and derived values).
        const MUTABLE = 1 << 0;
        /// The node receives propagation notifications (effects).
        const WATCHING = 1 << 1;
        /// The node is currently between `start_tracking` and `end_tracking`.
        const RECURSED_CHECK = 1 << 2;
        /// Propagation visited this node during a still-unwinding recursion.
        const RECURSED = 1 << 3;
        /// A direct dependency has a known new value; recompute required.
        const DIRTY = 1 << 4;
        /// A transitive dependency may have changed; verify on read.
        const PENDING = 1 << 5;
        /// Already in the effect queue; do not enqueue twice.
        const QUEUED = 1 << 6;
    }
}

/// One directed dependency edge from `dep` to `sub`, threaded through two
/// intrusive doubly-linked chains: the sub's deps chain (`prev_dep` /
/// `next_dep`) and the dep's subs chain (`prev_sub` / `next_sub`).
#[derive(Clone, Copy)]
pub(crate) struct Link {
    pub dep: NodeId,
    pub sub: NodeId,
    /// Tracking-pass version at which this edge was established or renewed.
    /// Edges left behind `deps_tail` with an older version are stale and
    /// are swept by `end_tracking`.
    pub version: u32,
    pub prev_dep: Option<LinkId>,
    pub next_dep: Option<LinkId>,
    pub prev_sub: Option<LinkId>,
    pub next_sub: Option<LinkId>,
}

pub(crate) struct ReactiveNode {
    /// Type-erased payload. Sources store a `SourceSlot<T>`, derived nodes
    /// an `Option<T>` cache; effects and scopes have no value.
    pub value: Option<Rc<RefCell<dyn Any>>>,
    pub flags: NodeFlags,
    pub node_type: ReactiveNodeType,
    pub deps_head: Option<LinkId>,
    pub deps_tail: Option<LinkId>,
    pub subs_head: Option<LinkId>,
    pub subs_tail: Option<LinkId>,
    pub disposed: bool,
}

impl ReactiveNode {
    pub fn new(node_type: ReactiveNodeType, flags: NodeFlags) -> Self {
        Self {
            value: None,
            flags,
            node_type,
            deps_head: None,
            deps_tail: None,
            subs_head: None,
            subs_tail: None,
            disposed: false,
        }
    }

    pub fn with_value(
        node_type: ReactiveNodeType,
        flags: NodeFlags,
        value: Rc<RefCell<dyn Any>>,
    ) -> Self {
        Self {
            value: Some(value),
            ..Self::new(node_type, flags)
        }
    }

    pub fn value(&self) -> Rc<RefCell<dyn Any>> {
        self.value
            .clone()
            .expect("ReactiveNode.value to have a value")
    }
}

pub(crate) enum ReactiveNodeType {
    Source {
        /// Re-synchronizes the slot's previous value with its current value
        /// on pull, reporting whether they differed.
        update: Rc<dyn AnyComputation>,
        /// Dispose the source once its last subscriber unlinks.
        auto_dispose: bool,
    },
    Derived {
        f: Rc<dyn AnyComputation>,
        /// Write-through setter, present on writable derived nodes. Stored
        /// type-erased; the typed handle downcasts it back.
        setter: Option<Rc<dyn Any>>,
    },
    Effect {
        state: Rc<EffectState>,
    },
    Scope,
}

impl ReactiveNodeType {
    /// Whether disposal of an owner cascades into this node (rather than
    /// merely unlinking it).
    pub fn is_owned_child(&self) -> bool {
        matches!(
            self,
            ReactiveNodeType::Effect { .. } | ReactiveNodeType::Scope
        )
    }
}

/// The type-erased boundary between the untyped graph and typed user
/// closures. `run` updates the node's value slot in place and reports
/// whether the value changed.
pub(crate) trait AnyComputation {
    fn run(&self, value: Rc<RefCell<dyn Any>>) -> bool;
}

/// Errors surfaced by the fallible (`try_*`) accessors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node has been disposed; its value and edges are gone.
    #[error("tried to access a reactive node that has been disposed")]
    Disposed,
    /// A reentrant read of a derived value during its own first
    /// computation, before any cached value exists.
    #[error("derived value read itself before its first computation finished")]
    Cycle,
    /// A write was attempted on a derived node with no setter.
    #[error("tried to write to a derived value that has no setter")]
    NotWritable,
    /// The node's value slot did not hold the expected type.
    #[error("error casting node value to type {0}")]
    Type(&'static str),
}
