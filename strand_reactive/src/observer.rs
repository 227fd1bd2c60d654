use crate::{node::NodeId, runtime::with_runtime};
use std::{any::Any, rc::Rc};

/// Debug hook into the reactive graph, for devtools-style adapters.
///
/// Hooks are invoked from inside engine operations. They must observe, not
/// act: reading or writing the node they are being told about from inside
/// a hook is not supported.
#[allow(unused_variables)]
pub trait GraphObserver {
    /// A node was created.
    fn on_create(&self, node: NodeId) {}

    /// A source was written or a derived value recomputed to a different
    /// value. `old` is `None` on a derived value's first computation.
    fn on_update(&self, node: NodeId, new: &dyn Any, old: Option<&dyn Any>) {}

    /// A watching subscriber was queued for the next flush.
    fn on_notify(&self, node: NodeId) {}

    /// A node was disposed.
    fn on_dispose(&self, node: NodeId) {}

    /// A reentrant read was suppressed by the cycle guard.
    fn on_cycle(&self, node: NodeId) {}
}

/// Installs (or clears) the process-wide graph observer.
pub fn set_observer(observer: Option<Rc<dyn GraphObserver>>) {
    with_runtime(|runtime| *runtime.observer.borrow_mut() = observer);
}
