#![cfg_attr(feature = "nightly", feature(fn_traits))]
#![cfg_attr(feature = "nightly", feature(unboxed_closures))]
#![forbid(unsafe_code)]

//! A fine-grained push/pull reactive runtime.
//!
//! ## Fine-Grained Reactivity
//!
//! Individual reactive values ("sources") trigger the code that reacts to
//! them ("effects") to re-run, through a dependency graph that is built
//! automatically by observing reads. The two halves meet in the middle:
//! writes *push* dirty markers through the graph's subscriber edges, and
//! reads *pull* recomputations lazily, so a derived value that nobody
//! reads costs nothing and an effect whose inputs are unchanged never
//! re-runs.
//!
//! The primitives:
//!
//! 1. *Sources:* [`create_source`], an externally written value with
//!    equality-suppressed change propagation.
//! 2. *Derived values:* [`create_derived`], recomputed lazily from other
//!    reactive reads, recomputing at most once per change.
//! 3. *Effects:* [`create_effect`], side-effectful bodies re-run when any
//!    dependency changes, scheduled through a FIFO queue with batching.
//! 4. *Scopes:* [`create_scope`], grouping effects for cascade disposal.
//! 5. *Watchers:* [`watch`], an effect specialization delivering
//!    `(new, previous)` pairs to a callback.
//!
//! ### Example
//! ```
//! use strand_reactive::*;
//! # use std::{cell::RefCell, rc::Rc};
//!
//! let count = create_source(1);
//!
//! // a derived value recomputes only when its inputs change
//! let double = create_derived(move |_| count.get() * 2);
//! assert_eq!(double.get(), 2);
//!
//! // an effect re-runs whenever anything it read changes
//! let log = Rc::new(RefCell::new(Vec::new()));
//! create_effect({
//!     let log = Rc::clone(&log);
//!     move || log.borrow_mut().push(double.get())
//! });
//! assert_eq!(*log.borrow(), vec![2]);
//!
//! count.set(3);
//! assert_eq!(*log.borrow(), vec![2, 6]);
//!
//! // writes inside a batch collapse into one flush
//! batch(|| {
//!     count.set(10);
//!     count.set(20);
//! });
//! assert_eq!(*log.borrow(), vec![2, 6, 40]);
//! ```
//!
//! The graph lives in a thread-local runtime; handles are `Copy` ids into
//! it. The engine itself never yields and never locks: all reactive work
//! happens on one logical task.

mod derived;
mod effect;
mod node;
mod observer;
mod runtime;
mod scope;
mod source;
mod watch;

pub use derived::*;
pub use effect::*;
pub use node::{LinkId, NodeError, NodeId};
pub use observer::*;
pub use runtime::{batch, notify_all, track_with_effect, untracked, untracked_scope};
pub use scope::*;
pub use source::*;
pub use watch::*;
