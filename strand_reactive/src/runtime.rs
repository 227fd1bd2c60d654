#![forbid(unsafe_code)]

use crate::{
    effect::Effect,
    node::{
        AnyComputation, Link, LinkId, NodeError, NodeFlags, NodeId,
        ReactiveNode, ReactiveNodeType,
    },
    observer::GraphObserver,
};
use slotmap::{SlotMap, SparseSecondaryMap};
use std::{
    any::Any,
    cell::{Cell, RefCell},
    rc::Rc,
};

thread_local! {
    pub(crate) static RUNTIME: Runtime = Runtime::new();
}

/// Runs a closure with the thread-local runtime. The reactive graph is
/// single-threaded; every handle created on this thread points into this
/// runtime.
#[inline(always)]
pub(crate) fn with_runtime<T>(f: impl FnOnce(&Runtime) -> T) -> T {
    RUNTIME.with(|runtime| f(runtime))
}

// The data structure that owns all the sources, derived values, effects,
// and scopes in the reactive system, together with the edge pool that
// connects them.
#[derive(Default)]
pub(crate) struct Runtime {
    pub nodes: RefCell<SlotMap<NodeId, ReactiveNode>>,
    pub links: RefCell<SlotMap<LinkId, Link>>,
    /// Disposer callbacks registered with `on_dispose`, run LIFO.
    pub disposers: RefCell<SparseSecondaryMap<NodeId, Vec<Box<dyn FnOnce()>>>>,
    /// Effect cleanup callbacks, run LIFO before the next body run and at
    /// disposal.
    pub cleanups: RefCell<SparseSecondaryMap<NodeId, Vec<Box<dyn FnOnce()>>>>,
    /// The subscriber whose reads are currently being recorded.
    pub active_sub: Cell<Option<NodeId>>,
    /// The scope that owns effects created right now.
    pub active_scope: Cell<Option<NodeId>>,
    /// The version of the tracking pass currently recording reads.
    pub version: Cell<u32>,
    /// Monotonic allocator behind `version`; bumped by every
    /// `start_tracking` so no two passes ever share a stamp.
    pub version_counter: Cell<u32>,
    pub batch_depth: Cell<u32>,
    /// FIFO effect queue. `notify_index` is the next slot to run; entries
    /// may be appended while a flush is draining.
    pub queue: RefCell<Vec<NodeId>>,
    pub notify_index: Cell<usize>,
    pub flushing: Cell<bool>,
    pub observer: RefCell<Option<Rc<dyn GraphObserver>>>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn observer(&self) -> Option<Rc<dyn GraphObserver>> {
        self.observer.borrow().clone()
    }

    pub(crate) fn create_node(&self, node: ReactiveNode) -> NodeId {
        let id = self.nodes.borrow_mut().insert(node);
        if let Some(observer) = self.observer() {
            observer.on_create(id);
        }
        id
    }

    pub(crate) fn is_alive(&self, id: NodeId) -> bool {
        self.nodes
            .borrow()
            .get(id)
            .map(|node| !node.disposed)
            .unwrap_or(false)
    }

    /// The node's value slot, or `Disposed` if the node is gone.
    pub(crate) fn try_node_value(
        &self,
        id: NodeId,
    ) -> Result<Rc<RefCell<dyn Any>>, NodeError> {
        let nodes = self.nodes.borrow();
        match nodes.get(id) {
            Some(node) if !node.disposed => {
                node.value.clone().ok_or(NodeError::Disposed)
            }
            _ => Err(NodeError::Disposed),
        }
    }

    pub(crate) fn add_disposer(
        &self,
        id: NodeId,
        f: Box<dyn FnOnce()>,
    ) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let mut disposers = self.disposers.borrow_mut();
        if let Some(entry) = disposers.entry(id) {
            entry.or_default().push(f);
            true
        } else {
            false
        }
    }

    pub(crate) fn add_cleanup(&self, id: NodeId, f: Box<dyn FnOnce()>) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let mut cleanups = self.cleanups.borrow_mut();
        if let Some(entry) = cleanups.entry(id) {
            entry.or_default().push(f);
            true
        } else {
            false
        }
    }

    #[inline(always)]
    pub(crate) fn flags_of(&self, id: NodeId) -> NodeFlags {
        self.nodes
            .borrow()
            .get(id)
            .map(|node| node.flags)
            .unwrap_or(NodeFlags::empty())
    }

    #[inline(always)]
    pub(crate) fn set_flags_of(&self, id: NodeId, flags: NodeFlags) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.flags = flags;
        }
    }

    #[inline(always)]
    pub(crate) fn remove_flags(&self, id: NodeId, flags: NodeFlags) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.flags -= flags;
        }
    }

    #[inline(always)]
    fn link_of(&self, id: LinkId) -> Option<Link> {
        self.links.borrow().get(id).copied()
    }

    #[inline(always)]
    pub(crate) fn deps_head_of(&self, id: NodeId) -> Option<LinkId> {
        self.nodes.borrow().get(id).and_then(|node| node.deps_head)
    }

    #[inline(always)]
    pub(crate) fn subs_head_of(&self, id: NodeId) -> Option<LinkId> {
        self.nodes.borrow().get(id).and_then(|node| node.subs_head)
    }

    /// Establishes the current subscriber's dependency on `id`.
    pub(crate) fn track_dep(&self, id: NodeId) {
        if let Some(sub) = self.active_sub.get() {
            self.link(id, sub);
        }
    }

    /// Like [`track_dep`](Self::track_dep), but falls back to the active
    /// scope so an otherwise-unobserved derived value is still released
    /// when the scope disposes.
    pub(crate) fn track_dep_scoped(&self, id: NodeId) {
        if let Some(sub) = self.active_sub.get() {
            self.link(id, sub);
        } else if let Some(scope) = self.active_scope.get() {
            self.link(id, scope);
        }
    }

    // ------------------------------------------------------------------
    // Edge pool
    // ------------------------------------------------------------------

    /// Establishes (or renews) the edge `dep → sub` for the current
    /// tracking pass.
    ///
    /// The version stamp lets a re-tracking pass reuse edges in place: an
    /// edge found right after `deps_tail` is the same dependency read in
    /// the same order as last time, so it is refreshed rather than
    /// reallocated, and anything left trailing `deps_tail` afterwards is
    /// stale by construction.
    pub(crate) fn link(&self, dep: NodeId, sub: NodeId) {
        if dep == sub {
            return;
        }
        let mut nodes = self.nodes.borrow_mut();
        let mut links = self.links.borrow_mut();
        if !nodes.contains_key(dep) || !nodes.contains_key(sub) {
            return;
        }
        let current_version = self.version.get();

        let prev_dep = nodes[sub].deps_tail;
        if let Some(prev) = prev_dep {
            if links.get(prev).map(|link| link.dep) == Some(dep) {
                // edge is current
                return;
            }
        }

        let next_dep = match prev_dep {
            Some(prev) => links.get(prev).and_then(|link| link.next_dep),
            None => nodes[sub].deps_head,
        };
        if let Some(next) = next_dep {
            if links.get(next).map(|link| link.dep) == Some(dep) {
                // same read order as the previous pass: reuse in place
                if let Some(link) = links.get_mut(next) {
                    link.version = current_version;
                }
                nodes[sub].deps_tail = Some(next);
                return;
            }
        }

        let prev_sub = nodes[dep].subs_tail;
        if let Some(prev) = prev_sub {
            if let Some(link) = links.get(prev) {
                if link.sub == sub && link.version == current_version {
                    // the same edge added twice within one pass
                    return;
                }
            }
        }

        let id = links.insert(Link {
            dep,
            sub,
            version: current_version,
            prev_dep,
            next_dep,
            prev_sub,
            next_sub: None,
        });
        match prev_dep {
            Some(prev) => links[prev].next_dep = Some(id),
            None => nodes[sub].deps_head = Some(id),
        }
        if let Some(next) = next_dep {
            links[next].prev_dep = Some(id);
        }
        nodes[sub].deps_tail = Some(id);
        match prev_sub {
            Some(prev) => links[prev].next_sub = Some(id),
            None => nodes[dep].subs_head = Some(id),
        }
        nodes[dep].subs_tail = Some(id);
    }

    /// Begins a tracking pass for `id`: allocates a fresh pass version,
    /// resets `deps_tail` so reads re-thread the chain from the front, and
    /// arms the reentry check. The caller's [`TrackingGuard`] restores the
    /// enclosing pass's version when this pass ends.
    pub(crate) fn start_tracking(&self, id: NodeId) {
        let next = self.version_counter.get().wrapping_add(1);
        self.version_counter.set(next);
        self.version.set(next);
        if let Some(node) = self.nodes.borrow_mut().get_mut(id) {
            node.deps_tail = None;
            node.flags = (node.flags
                - (NodeFlags::RECURSED | NodeFlags::DIRTY | NodeFlags::PENDING))
                | NodeFlags::RECURSED_CHECK;
        }
    }

    /// Ends a tracking pass: every link trailing `deps_tail` was not
    /// re-read and is swept, in order.
    pub(crate) fn end_tracking(&self, id: NodeId) {
        let mut unwatched = Vec::new();
        {
            let mut nodes = self.nodes.borrow_mut();
            let mut links = self.links.borrow_mut();
            let Some(node) = nodes.get(id) else {
                return;
            };
            let mut to_remove = match node.deps_tail {
                Some(tail) => links.get(tail).and_then(|link| link.next_dep),
                None => node.deps_head,
            };
            while let Some(link) = to_remove {
                let (next, released) = unlink_in(&mut nodes, &mut links, link);
                to_remove = next;
                if let Some(dep) = released {
                    unwatched.push(dep);
                }
            }
            if let Some(node) = nodes.get_mut(id) {
                node.flags -= NodeFlags::RECURSED_CHECK;
            }
        }
        for dep in unwatched {
            self.handle_unwatched(dep);
        }
    }

    /// Removes every dependency edge of `id`.
    pub(crate) fn purge_deps(&self, id: NodeId) {
        let mut unwatched = Vec::new();
        {
            let mut nodes = self.nodes.borrow_mut();
            let mut links = self.links.borrow_mut();
            let mut current = nodes.get(id).and_then(|node| node.deps_head);
            while let Some(link) = current {
                let (next, released) = unlink_in(&mut nodes, &mut links, link);
                current = next;
                if let Some(dep) = released {
                    unwatched.push(dep);
                }
            }
        }
        for dep in unwatched {
            self.handle_unwatched(dep);
        }
    }

    /// A dependency lost its last subscriber. Derived values release their
    /// own edges and re-arm for a lazy recompute; sources opted into
    /// auto-disposal and owned children (effects, scopes) are disposed.
    fn handle_unwatched(&self, dep: NodeId) {
        enum Action {
            Rearm,
            Dispose,
            Keep,
        }
        let action = {
            let nodes = self.nodes.borrow();
            match nodes.get(dep) {
                Some(node) if !node.disposed => match &node.node_type {
                    ReactiveNodeType::Derived { .. } => Action::Rearm,
                    ReactiveNodeType::Source { auto_dispose, .. } => {
                        if *auto_dispose {
                            Action::Dispose
                        } else {
                            Action::Keep
                        }
                    }
                    ReactiveNodeType::Effect { .. }
                    | ReactiveNodeType::Scope => Action::Dispose,
                },
                _ => Action::Keep,
            }
        };
        match action {
            Action::Rearm => {
                self.purge_deps(dep);
                self.set_flags_of(dep, NodeFlags::MUTABLE | NodeFlags::DIRTY);
            }
            Action::Dispose => self.dispose_node(dep),
            Action::Keep => {}
        }
    }

    // ------------------------------------------------------------------
    // Propagation (mark phase)
    // ------------------------------------------------------------------

    /// Walks the subscriber subgraph reachable from `head`, assigning
    /// `PENDING` markers and queueing watching subscribers. Iterative,
    /// with an explicit stack of sibling cursors; re-entrant visits are
    /// defused by the `RECURSED_CHECK` / `RECURSED` pair and a per-link
    /// validity check, so cycles degrade instead of looping.
    pub(crate) fn propagate(&self, head: LinkId) {
        let mut notified: Vec<NodeId> = Vec::new();
        {
            let mut nodes = self.nodes.borrow_mut();
            let links = self.links.borrow();
            let mut queue = self.queue.borrow_mut();

            let Some(first) = links.get(head).copied() else {
                return;
            };
            let mut link_id = head;
            let mut next = first.next_sub;
            let mut stack: Vec<Option<LinkId>> = Vec::new();

            'top: loop {
                if let Some(link) = links.get(link_id).copied() {
                    let sub = link.sub;
                    let flags =
                        nodes.get(sub).map(|n| n.flags).unwrap_or_default();
                    let mut local = flags;
                    if flags
                        .intersects(NodeFlags::MUTABLE | NodeFlags::WATCHING)
                    {
                        if !flags.intersects(
                            NodeFlags::RECURSED_CHECK
                                | NodeFlags::RECURSED
                                | NodeFlags::DIRTY
                                | NodeFlags::PENDING,
                        ) {
                            nodes[sub].flags = flags | NodeFlags::PENDING;
                        } else if !flags.intersects(
                            NodeFlags::RECURSED_CHECK | NodeFlags::RECURSED,
                        ) {
                            // already marked by this or an earlier pass
                            local = NodeFlags::empty();
                        } else if !flags.contains(NodeFlags::RECURSED_CHECK) {
                            nodes[sub].flags = (flags - NodeFlags::RECURSED)
                                | NodeFlags::PENDING;
                        } else if !flags
                            .intersects(NodeFlags::DIRTY | NodeFlags::PENDING)
                            && is_valid_link(&nodes, &links, link_id, sub)
                        {
                            // reentry into a subscriber that is mid-tracking:
                            // mark it, but do not notify it about itself
                            nodes[sub].flags =
                                flags | NodeFlags::RECURSED | NodeFlags::PENDING;
                            local = flags & NodeFlags::MUTABLE;
                        } else {
                            local = NodeFlags::empty();
                        }

                        if local.contains(NodeFlags::WATCHING) {
                            notify_in(
                                &mut nodes,
                                &links,
                                &mut queue,
                                &mut notified,
                                sub,
                            );
                        }
                        if local.contains(NodeFlags::MUTABLE) {
                            if let Some(sub_subs) =
                                nodes.get(sub).and_then(|n| n.subs_head)
                            {
                                link_id = sub_subs;
                                let branch = links
                                    .get(sub_subs)
                                    .and_then(|l| l.next_sub);
                                if branch.is_some() {
                                    stack.push(next);
                                    next = branch;
                                }
                                continue 'top;
                            }
                        }
                    }
                }

                if let Some(sibling) = next {
                    link_id = sibling;
                    next = links.get(sibling).and_then(|l| l.next_sub);
                    continue 'top;
                }
                while let Some(saved) = stack.pop() {
                    if let Some(sibling) = saved {
                        link_id = sibling;
                        next = links.get(sibling).and_then(|l| l.next_sub);
                        continue 'top;
                    }
                }
                break;
            }
        }
        self.dispatch_notify(notified);
    }

    /// Promotes `PENDING` to `DIRTY` on direct subscribers only, without
    /// recursing, and (re-)queues watching subscribers.
    pub(crate) fn shallow_propagate(&self, head: LinkId) {
        let mut notified: Vec<NodeId> = Vec::new();
        {
            let mut nodes = self.nodes.borrow_mut();
            let links = self.links.borrow();
            let mut queue = self.queue.borrow_mut();
            let mut current = Some(head);
            while let Some(link_id) = current {
                let Some(link) = links.get(link_id).copied() else {
                    break;
                };
                current = link.next_sub;
                let sub = link.sub;
                let Some(node) = nodes.get(sub) else {
                    continue;
                };
                let flags = node.flags;
                if (flags & (NodeFlags::PENDING | NodeFlags::DIRTY))
                    == NodeFlags::PENDING
                {
                    nodes[sub].flags = flags | NodeFlags::DIRTY;
                    if flags.contains(NodeFlags::WATCHING) {
                        notify_in(
                            &mut nodes,
                            &links,
                            &mut queue,
                            &mut notified,
                            sub,
                        );
                    }
                }
            }
        }
        self.dispatch_notify(notified);
    }

    fn dispatch_notify(&self, ids: Vec<NodeId>) {
        if ids.is_empty() {
            return;
        }
        if let Some(observer) = self.observer() {
            for id in ids {
                observer.on_notify(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dirty check (pull phase)
    // ------------------------------------------------------------------

    /// Walks `sub`'s dependency chain depth-first, updating each dirty
    /// mutable dependency, and reports whether anything under `sub`
    /// actually changed. Iterative, with an explicit stack of return
    /// frames. Missing links (unlinked mid-walk) end the affected branch.
    pub(crate) fn check_dirty(
        &self,
        mut link_id: LinkId,
        mut sub: NodeId,
    ) -> bool {
        let mut stack: Vec<LinkId> = Vec::new();
        let mut check_depth = 0usize;
        'top: loop {
            let Some(link) = self.link_of(link_id) else {
                return false;
            };
            let dep = link.dep;
            let dep_flags = self.flags_of(dep);
            let mut dirty = false;

            if self.flags_of(sub).contains(NodeFlags::DIRTY) {
                dirty = true;
            } else if dep_flags
                .contains(NodeFlags::MUTABLE | NodeFlags::DIRTY)
            {
                if self.update_node(dep) {
                    if let Some(subs) = self.subs_head_of(dep) {
                        if self
                            .link_of(subs)
                            .and_then(|l| l.next_sub)
                            .is_some()
                        {
                            self.shallow_propagate(subs);
                        }
                    }
                    dirty = true;
                }
            } else if dep_flags
                .contains(NodeFlags::MUTABLE | NodeFlags::PENDING)
            {
                if let Some(dep_deps) = self.deps_head_of(dep) {
                    if link.next_sub.is_some() || link.prev_sub.is_some() {
                        stack.push(link_id);
                    }
                    link_id = dep_deps;
                    sub = dep;
                    check_depth += 1;
                    continue 'top;
                }
            }

            if !dirty {
                if let Some(next_dep) =
                    self.link_of(link_id).and_then(|l| l.next_dep)
                {
                    link_id = next_dep;
                    continue 'top;
                }
            }

            while check_depth > 0 {
                check_depth -= 1;
                let Some(first_sub) = self.subs_head_of(sub) else {
                    return dirty;
                };
                let has_multiple_subs = self
                    .link_of(first_sub)
                    .and_then(|l| l.next_sub)
                    .is_some();
                link_id = if has_multiple_subs {
                    match stack.pop() {
                        Some(saved) => saved,
                        None => return dirty,
                    }
                } else {
                    first_sub
                };
                if dirty {
                    if self.update_node(sub) {
                        if has_multiple_subs {
                            self.shallow_propagate(first_sub);
                        }
                        sub = match self.link_of(link_id) {
                            Some(l) => l.sub,
                            None => return true,
                        };
                        continue;
                    }
                    dirty = false;
                } else {
                    self.remove_flags(sub, NodeFlags::PENDING);
                }
                sub = match self.link_of(link_id) {
                    Some(l) => l.sub,
                    None => return dirty,
                };
                if let Some(next_dep) =
                    self.link_of(link_id).and_then(|l| l.next_dep)
                {
                    link_id = next_dep;
                    continue 'top;
                }
            }
            return dirty;
        }
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Updates a node in place and reports whether its value changed.
    /// Sources re-synchronize their previous value; derived values
    /// recompute under tracking.
    pub(crate) fn update_node(&self, id: NodeId) -> bool {
        enum Update {
            Source(Rc<dyn AnyComputation>, Rc<RefCell<dyn Any>>),
            Derived,
        }
        let update = {
            let nodes = self.nodes.borrow();
            let Some(node) = nodes.get(id) else {
                return false;
            };
            match &node.node_type {
                ReactiveNodeType::Source { update, .. } => {
                    Update::Source(Rc::clone(update), node.value())
                }
                ReactiveNodeType::Derived { .. } => Update::Derived,
                _ => return false,
            }
        };
        match update {
            Update::Source(update, value) => {
                self.set_flags_of(id, NodeFlags::MUTABLE);
                update.run(value)
            }
            Update::Derived => self.update_derived(id),
        }
    }

    /// Recomputes a derived value inside a fresh tracking pass. The
    /// teardown (restore of the previous subscriber plus the stale-link
    /// sweep) runs on all exit paths, including unwinds out of the getter.
    pub(crate) fn update_derived(&self, id: NodeId) -> bool {
        let Some((f, value)) = ({
            let nodes = self.nodes.borrow();
            nodes.get(id).and_then(|node| match &node.node_type {
                ReactiveNodeType::Derived { f, .. } => {
                    Some((Rc::clone(f), node.value()))
                }
                _ => None,
            })
        }) else {
            return false;
        };
        let prev_version = self.version.get();
        self.start_tracking(id);
        let prev_sub = self.active_sub.replace(Some(id));
        let _tracking = TrackingGuard {
            id,
            prev_sub,
            prev_version,
        };
        f.run(value)
    }

    /// Pull path for a derived read: recompute when `DIRTY`, verify via
    /// [`check_dirty`](Self::check_dirty) when `PENDING`, otherwise clear
    /// a spent `PENDING` marker.
    pub(crate) fn update_derived_if_necessary(&self, id: NodeId) {
        let flags = self.flags_of(id);
        if flags.contains(NodeFlags::DIRTY)
            || (flags.contains(NodeFlags::PENDING)
                && self
                    .deps_head_of(id)
                    .map(|deps| self.check_dirty(deps, id))
                    .unwrap_or(false))
        {
            if self.update_node(id) {
                if let Some(subs) = self.subs_head_of(id) {
                    self.shallow_propagate(subs);
                }
            }
        } else if flags.contains(NodeFlags::PENDING) {
            self.remove_flags(id, NodeFlags::PENDING);
        }
    }

    /// Pull path for a source read: a pending write is folded into the
    /// previous value so co-subscribers get their `PENDING` promoted.
    pub(crate) fn update_source_if_necessary(&self, id: NodeId) {
        if self.flags_of(id).contains(NodeFlags::DIRTY) {
            if self.update_node(id) {
                if let Some(subs) = self.subs_head_of(id) {
                    self.shallow_propagate(subs);
                }
            }
        }
    }

    /// A source's value changed: mark it dirty and push markers through
    /// its subscriber subgraph, flushing if no batch is open.
    pub(crate) fn mark_dirty_and_propagate(&self, id: NodeId) {
        self.set_flags_of(id, NodeFlags::MUTABLE | NodeFlags::DIRTY);
        if let Some(subs) = self.subs_head_of(id) {
            self.propagate(subs);
            if self.batch_depth.get() == 0 {
                self.flush();
            }
        }
    }

    /// Force subscribers of `id` to re-run without any value change: deep
    /// markers first, then a shallow promote so the pull phase does not
    /// suppress on equality.
    pub(crate) fn force_notify(&self, id: NodeId) {
        if let Some(subs) = self.subs_head_of(id) {
            self.propagate(subs);
            self.shallow_propagate(subs);
            if self.batch_depth.get() == 0 {
                self.flush();
            }
        }
    }

    /// Force a derived value to recompute now and, if it changed, push the
    /// change to its subscribers.
    pub(crate) fn force_recompute(&self, id: NodeId) {
        if self.update_node(id) {
            if let Some(subs) = self.subs_head_of(id) {
                self.propagate(subs);
                self.shallow_propagate(subs);
            }
        }
        if self.batch_depth.get() == 0 {
            self.flush();
        }
    }

    // ------------------------------------------------------------------
    // Effect queue
    // ------------------------------------------------------------------

    /// Drains the effect queue in FIFO order of first enqueue. Effects
    /// enqueued while the flush is running are picked up by the same
    /// flush; only one flush is ever in flight.
    pub(crate) fn flush(&self) {
        if self.flushing.get() {
            return;
        }
        self.flushing.set(true);
        let _flushing = FlushingGuard;
        loop {
            let index = self.notify_index.get();
            let id = {
                let queue = self.queue.borrow();
                match queue.get(index) {
                    Some(id) => *id,
                    None => break,
                }
            };
            self.notify_index.set(index + 1);
            {
                let mut nodes = self.nodes.borrow_mut();
                match nodes.get_mut(id) {
                    Some(node) => node.flags -= NodeFlags::QUEUED,
                    // disposed while queued: the slot is a no-op
                    None => continue,
                }
            }
            tracing::trace!("flushing effect {id:?}");
            self.flush_effect(id);
        }
        self.queue.borrow_mut().clear();
        self.notify_index.set(0);
    }

    /// Runs one queued node, honoring its scheduler hook and pause state.
    pub(crate) fn flush_effect(&self, id: NodeId) {
        let state = {
            let nodes = self.nodes.borrow();
            match nodes.get(id) {
                Some(node) => match &node.node_type {
                    ReactiveNodeType::Effect { state } => {
                        Some(Rc::clone(state))
                    }
                    ReactiveNodeType::Scope => None,
                    _ => return,
                },
                None => return,
            }
        };
        if let Some(state) = &state {
            let hook = state.scheduler.borrow().clone();
            if let Some(hook) = hook {
                if hook(Effect::from_id(id)) {
                    // scheduled elsewhere; the hook re-enters via `run`
                    return;
                }
            }
            if state.paused.get() {
                return;
            }
        }
        self.run_effect(id);
    }

    /// The flush-side run: re-run the body when dirty (or verified dirty
    /// through `check_dirty`), otherwise clear a spent `PENDING` marker,
    /// then run any owned children that were queued under this node.
    pub(crate) fn run_effect(&self, id: NodeId) {
        let flags = self.flags_of(id);
        let dirty = flags.contains(NodeFlags::DIRTY)
            || (flags.contains(NodeFlags::PENDING)
                && self
                    .deps_head_of(id)
                    .map(|deps| self.check_dirty(deps, id))
                    .unwrap_or(false));
        if dirty {
            self.run_effect_body(id);
            return;
        }
        if flags.contains(NodeFlags::PENDING) {
            self.remove_flags(id, NodeFlags::PENDING);
        }
        let mut current = self.deps_head_of(id);
        while let Some(link_id) = current {
            let Some(link) = self.link_of(link_id) else {
                break;
            };
            current = link.next_dep;
            let dep = link.dep;
            if self.flags_of(dep).contains(NodeFlags::QUEUED) {
                self.remove_flags(dep, NodeFlags::QUEUED);
                self.flush_effect(dep);
            }
        }
    }

    /// Unconditionally executes an effect's body inside a fresh tracking
    /// pass, after running its cleanup list in LIFO order.
    pub(crate) fn run_effect_body(&self, id: NodeId) {
        let Some(state) = ({
            let nodes = self.nodes.borrow();
            nodes.get(id).and_then(|node| match &node.node_type {
                ReactiveNodeType::Effect { state } => Some(Rc::clone(state)),
                _ => None,
            })
        }) else {
            return;
        };
        // a body that triggers its own re-entry is a cycle; suppress it
        let Ok(mut body) = state.body.try_borrow_mut() else {
            if let Some(observer) = self.observer() {
                observer.on_cycle(id);
            }
            return;
        };
        let cleanups = self.cleanups.borrow_mut().remove(id).unwrap_or_default();
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
        let prev_version = self.version.get();
        self.start_tracking(id);
        let prev_sub = self.active_sub.replace(Some(id));
        let _tracking = TrackingGuard {
            id,
            prev_sub,
            prev_version,
        };
        (*body)();
    }

    // ------------------------------------------------------------------
    // Disposal
    // ------------------------------------------------------------------

    /// Disposes a node: cascades into owned children (LIFO), runs effect
    /// cleanups, runs disposers (LIFO, faults swallowed so every disposer
    /// runs), detaches every edge, and removes the record. Idempotent.
    pub(crate) fn dispose_node(&self, id: NodeId) {
        {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(id) else {
                return;
            };
            if node.disposed {
                return;
            }
            node.disposed = true;
        }

        // owned children first, newest first
        loop {
            let child = {
                let nodes = self.nodes.borrow();
                let links = self.links.borrow();
                nodes
                    .get(id)
                    .and_then(|node| node.deps_tail)
                    .and_then(|tail| {
                        links.get(tail).map(|link| (tail, link.dep))
                    })
            };
            let Some((tail_link, dep)) = child else {
                break;
            };
            let owned = {
                let nodes = self.nodes.borrow();
                nodes
                    .get(dep)
                    .map(|node| node.node_type.is_owned_child() && !node.disposed)
                    .unwrap_or(false)
            };
            if owned {
                self.dispose_node(dep);
            }
            if self.links.borrow().contains_key(tail_link) {
                let released = {
                    let mut nodes = self.nodes.borrow_mut();
                    let mut links = self.links.borrow_mut();
                    unlink_in(&mut nodes, &mut links, tail_link).1
                };
                if let Some(dep) = released {
                    self.handle_unwatched(dep);
                }
            }
        }

        let cleanups = self.cleanups.borrow_mut().remove(id).unwrap_or_default();
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }

        let disposers =
            self.disposers.borrow_mut().remove(id).unwrap_or_default();
        for disposer in disposers.into_iter().rev() {
            // a faulting disposer must not prevent the rest from running
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                disposer,
            ));
        }

        {
            let mut nodes = self.nodes.borrow_mut();
            let mut links = self.links.borrow_mut();
            let mut current = nodes.get(id).and_then(|node| node.subs_head);
            while let Some(link_id) = current {
                let next = links.get(link_id).and_then(|link| link.next_sub);
                unlink_in(&mut nodes, &mut links, link_id);
                current = next;
            }
        }

        self.nodes.borrow_mut().remove(id);
        if let Some(observer) = self.observer() {
            observer.on_dispose(id);
        }
    }
}

/// Removes one edge from both intrusive chains. Returns the edge's
/// `next_dep` (so dep-chain sweeps can continue) and the dep node if the
/// removal left it with no subscribers.
fn unlink_in(
    nodes: &mut SlotMap<NodeId, ReactiveNode>,
    links: &mut SlotMap<LinkId, Link>,
    id: LinkId,
) -> (Option<LinkId>, Option<NodeId>) {
    let Some(link) = links.remove(id) else {
        return (None, None);
    };
    let Link {
        dep,
        sub,
        prev_dep,
        next_dep,
        prev_sub,
        next_sub,
        ..
    } = link;
    match prev_dep {
        Some(prev) => {
            if let Some(prev) = links.get_mut(prev) {
                prev.next_dep = next_dep;
            }
        }
        None => {
            if let Some(node) = nodes.get_mut(sub) {
                node.deps_head = next_dep;
            }
        }
    }
    match next_dep {
        Some(next) => {
            if let Some(next) = links.get_mut(next) {
                next.prev_dep = prev_dep;
            }
        }
        None => {
            if let Some(node) = nodes.get_mut(sub) {
                node.deps_tail = prev_dep;
            }
        }
    }
    match prev_sub {
        Some(prev) => {
            if let Some(prev) = links.get_mut(prev) {
                prev.next_sub = next_sub;
            }
        }
        None => {
            if let Some(node) = nodes.get_mut(dep) {
                node.subs_head = next_sub;
            }
        }
    }
    match next_sub {
        Some(next) => {
            if let Some(next) = links.get_mut(next) {
                next.prev_sub = prev_sub;
            }
        }
        None => {
            if let Some(node) = nodes.get_mut(dep) {
                node.subs_tail = prev_sub;
            }
        }
    }
    let unwatched = match nodes.get(dep) {
        Some(node) if node.subs_head.is_none() => Some(dep),
        _ => None,
    };
    (next_dep, unwatched)
}

/// Whether `check` is still threaded into `sub`'s active deps chain (at or
/// before `deps_tail`). Guards propagation against edges unlinked during
/// the traversal.
fn is_valid_link(
    nodes: &SlotMap<NodeId, ReactiveNode>,
    links: &SlotMap<LinkId, Link>,
    check: LinkId,
    sub: NodeId,
) -> bool {
    let Some(node) = nodes.get(sub) else {
        return false;
    };
    let Some(tail) = node.deps_tail else {
        return false;
    };
    let mut current = node.deps_head;
    while let Some(link_id) = current {
        if link_id == check {
            return true;
        }
        if link_id == tail {
            break;
        }
        current = links.get(link_id).and_then(|link| link.next_dep);
    }
    false
}

/// Marks a watching subscriber queued, bubbling from nested effects to the
/// outermost unqueued owner so a flush runs owners before their children.
fn notify_in(
    nodes: &mut SlotMap<NodeId, ReactiveNode>,
    links: &SlotMap<LinkId, Link>,
    queue: &mut Vec<NodeId>,
    notified: &mut Vec<NodeId>,
    id: NodeId,
) {
    let (flags, parent_link) = match nodes.get(id) {
        Some(node) => (node.flags, node.subs_head),
        None => return,
    };
    if flags.contains(NodeFlags::QUEUED) {
        return;
    }
    if let Some(node) = nodes.get_mut(id) {
        node.flags = flags | NodeFlags::QUEUED;
    }
    notified.push(id);
    if let Some(parent) =
        parent_link.and_then(|link| links.get(link).map(|l| l.sub))
    {
        notify_in(nodes, links, queue, notified, parent);
        return;
    }
    queue.push(id);
}

/// Restores the previous active subscriber and pass version, then runs the
/// stale-link sweep, when a tracking pass ends - including unwinds out of
/// user code.
pub(crate) struct TrackingGuard {
    pub id: NodeId,
    pub prev_sub: Option<NodeId>,
    pub prev_version: u32,
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        with_runtime(|runtime| {
            runtime.active_sub.set(self.prev_sub);
            runtime.end_tracking(self.id);
            runtime.version.set(self.prev_version);
        });
    }
}

pub(crate) struct RestoreSub(pub Option<NodeId>);

impl Drop for RestoreSub {
    fn drop(&mut self) {
        with_runtime(|runtime| runtime.active_sub.set(self.0));
    }
}

pub(crate) struct RestoreScope(pub Option<NodeId>);

impl Drop for RestoreScope {
    fn drop(&mut self) {
        with_runtime(|runtime| runtime.active_scope.set(self.0));
    }
}

/// Unlinks and removes a throwaway subscriber node, on unwind as well as
/// on the normal path. Anything it read stays unaware it was ever watched.
struct RemoveSubOnDrop(NodeId);

impl Drop for RemoveSubOnDrop {
    fn drop(&mut self) {
        with_runtime(|runtime| {
            runtime.purge_deps(self.0);
            runtime.nodes.borrow_mut().remove(self.0);
        });
    }
}

struct FlushingGuard;

impl Drop for FlushingGuard {
    fn drop(&mut self) {
        with_runtime(|runtime| runtime.flushing.set(false));
    }
}

struct EndBatchOnDrop;

impl Drop for EndBatchOnDrop {
    fn drop(&mut self) {
        with_runtime(|runtime| {
            let depth = runtime.batch_depth.get().saturating_sub(1);
            runtime.batch_depth.set(depth);
            if depth == 0 && !std::thread::panicking() {
                runtime.flush();
            }
        });
    }
}

/// Runs `f` with effect flushing suspended. Writes inside the batch
/// collapse; the flush at the end runs each affected effect once. Batches
/// nest, and the depth is restored even if `f` unwinds.
///
/// ```
/// # use strand_reactive::*;
/// let a = create_source(1);
/// let b = create_source(2);
/// let sum = create_derived(move |_| a.get() + b.get());
/// batch(|| {
///     a.set(10);
///     b.set(20);
///     // no effect has run yet
/// });
/// assert_eq!(sum.get(), 30);
/// ```
pub fn batch<T>(f: impl FnOnce() -> T) -> T {
    with_runtime(|runtime| {
        runtime.batch_depth.set(runtime.batch_depth.get() + 1)
    });
    let _end = EndBatchOnDrop;
    f()
}

/// Runs `f` with dependency tracking suspended: reads inside establish no
/// edges. The previous subscriber is restored on all exit paths.
///
/// ```
/// # use strand_reactive::*;
/// let a = create_source(1);
/// let b = create_source(2);
/// let c = create_derived(move |_| a.get() + untracked(|| b.get()));
/// assert_eq!(c.get(), 3);
/// b.set(10);
/// // `c` has not noticed; it only tracks `a`
/// assert_eq!(c.get(), 3);
/// ```
pub fn untracked<T>(f: impl FnOnce() -> T) -> T {
    let prev = with_runtime(|runtime| runtime.active_sub.take());
    let _restore = RestoreSub(prev);
    f()
}

/// Runs `f` with the active scope cleared, so effects created inside are
/// not owned by the surrounding scope.
pub fn untracked_scope<T>(f: impl FnOnce() -> T) -> T {
    let prev = with_runtime(|runtime| runtime.active_scope.take());
    let _restore = RestoreScope(prev);
    f()
}

/// Runs `f`, collects every reactive read it performs into a throwaway
/// subscriber, and then notifies each read node's subscribers as if it had
/// changed, without touching any value. This is the escape hatch for
/// in-place mutation of values the graph cannot compare.
pub fn notify_all<T>(f: impl FnOnce() -> T) -> T {
    let temp = with_runtime(|runtime| {
        // throwaway subscriber; bypasses the observer on purpose
        runtime.nodes.borrow_mut().insert(ReactiveNode::new(
            ReactiveNodeType::Scope,
            NodeFlags::WATCHING,
        ))
    });
    let _cleanup = RemoveSubOnDrop(temp);
    let value = {
        let prev = with_runtime(|runtime| {
            runtime.active_sub.replace(Some(temp))
        });
        let _restore = RestoreSub(prev);
        f()
    };
    with_runtime(|runtime| {
        loop {
            let first = {
                let nodes = runtime.nodes.borrow();
                let links = runtime.links.borrow();
                nodes
                    .get(temp)
                    .and_then(|node| node.deps_head)
                    .and_then(|link_id| {
                        links.get(link_id).map(|link| (link_id, link.dep))
                    })
            };
            let Some((link_id, dep)) = first else {
                break;
            };
            let released = {
                let mut nodes = runtime.nodes.borrow_mut();
                let mut links = runtime.links.borrow_mut();
                unlink_in(&mut nodes, &mut links, link_id).1
            };
            if let Some(subs) = runtime.subs_head_of(dep) {
                runtime.propagate(subs);
                runtime.shallow_propagate(subs);
            }
            if let Some(dep) = released {
                runtime.handle_unwatched(dep);
            }
        }
        if runtime.batch_depth.get() == 0 {
            runtime.flush();
        }
    });
    value
}

/// Runs `f` with `effect` installed as the active subscriber, so reads
/// inside `f` become dependencies of the effect.
///
/// With `purge = false` the edges are appended to the effect's existing
/// dependency set; this is how a lazy effect is primed without running
/// its body. With `purge = true` a full tracking pass replaces the
/// dependency set. Either way, the effect's own re-runs always re-track
/// from scratch; priming only supplies the initial edge set.
pub fn track_with_effect<T>(
    f: impl FnOnce() -> T,
    effect: Effect,
    purge: bool,
) -> T {
    let id = effect.id();
    if purge {
        let (prev, prev_version) = with_runtime(|runtime| {
            let prev_version = runtime.version.get();
            runtime.start_tracking(id);
            (runtime.active_sub.replace(Some(id)), prev_version)
        });
        let _tracking = TrackingGuard {
            id,
            prev_sub: prev,
            prev_version,
        };
        f()
    } else {
        let prev =
            with_runtime(|runtime| runtime.active_sub.replace(Some(id)));
        let _restore = RestoreSub(prev);
        f()
    }
}
