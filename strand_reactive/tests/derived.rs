use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};
use strand_reactive::{
    create_derived, create_effect, create_source, create_writable_derived,
    Derived, NodeError,
};

#[test]
fn derived_calculates_value() {
    let a = create_source(1);
    let b = create_source(2);
    let c = create_source(3);

    let d = create_derived(move |_| a.get() + b.get() + c.get());
    assert_eq!(d.get(), 6);
}

#[test]
fn derived_is_lazy_and_computes_once_per_change() {
    let calculations = Rc::new(RefCell::new(0));

    let a = create_source(1);
    let b = create_source(2);

    let d = create_derived({
        let calculations = Rc::clone(&calculations);
        move |_| {
            *calculations.borrow_mut() += 1;
            a.get() + b.get()
        }
    });

    // no eager compute
    assert_eq!(*calculations.borrow(), 0);

    assert_eq!(d.get(), 3);
    assert_eq!(d.get(), 3);
    assert_eq!(d.get(), 3);
    assert_eq!(*calculations.borrow(), 1);

    a.set(0);
    assert_eq!(d.get(), 2);
    assert_eq!(*calculations.borrow(), 2);
}

#[test]
fn nested_deriveds() {
    let a = create_source(0);
    let b = create_source(0);
    let c = create_derived(move |_| a.get() + b.get());
    let d = create_derived(move |_| c.get() * 2);
    let e = create_derived(move |_| d.get() + 1);

    assert_eq!(e.get(), 1);
    assert_eq!(d.get(), 0);
    assert_eq!(c.get(), 0);

    a.set(5);
    assert_eq!(c.get(), 5);
    assert_eq!(d.get(), 10);
    assert_eq!(e.get(), 11);

    b.set(1);
    assert_eq!(e.get(), 13);
    assert_eq!(d.get(), 12);
    assert_eq!(c.get(), 6);
}

#[test]
fn diamond_recomputes_once() {
    let name = create_source("Ada Lovelace".to_string());
    let first = create_derived(move |_| {
        name.with(|n| n.split_whitespace().next().unwrap().to_string())
    });
    let last = create_derived(move |_| {
        name.with(|n| n.split_whitespace().nth(1).unwrap().to_string())
    });

    let combined_count = Rc::new(RefCell::new(0));
    let combined = create_derived({
        let combined_count = Rc::clone(&combined_count);
        move |_| {
            *combined_count.borrow_mut() += 1;
            format!("{} {}", first.get(), last.get())
        }
    });

    assert_eq!(first.get(), "Ada");
    assert_eq!(last.get(), "Lovelace");

    name.set("Grace Hopper".to_string());
    assert_eq!(first.get(), "Grace");
    assert_eq!(last.get(), "Hopper");
    assert_eq!(combined.get(), "Grace Hopper");
    // both branches updated, but the join ran once
    assert_eq!(*combined_count.borrow(), 1);
}

#[test]
fn unchanged_recompute_does_not_rerun_subscribers() {
    let a = create_source(1);
    let parity = create_derived(move |_| a.get() % 2);
    let runs = Rc::new(RefCell::new(0));

    create_effect({
        let runs = Rc::clone(&runs);
        move || {
            let _ = parity.get();
            *runs.borrow_mut() += 1;
        }
    });
    assert_eq!(*runs.borrow(), 1);

    // 1 -> 3: parity unchanged, the effect must not re-run
    a.set(3);
    assert_eq!(*runs.borrow(), 1);

    a.set(4);
    assert_eq!(*runs.borrow(), 2);
}

#[test]
fn getter_receives_previous_value() {
    let a = create_source(1);
    let previous = Rc::new(RefCell::new(Vec::new()));

    let d = create_derived({
        let previous = Rc::clone(&previous);
        move |prev: Option<&i32>| {
            previous.borrow_mut().push(prev.copied());
            a.get() * 10
        }
    });

    assert_eq!(d.get(), 10);
    a.set(2);
    assert_eq!(d.get(), 20);
    assert_eq!(*previous.borrow(), vec![None, Some(10)]);
}

#[test]
fn get_cached_skips_recompute() {
    let a = create_source(1);
    let d = create_derived(move |_| a.get() * 2);

    // nothing computed yet
    assert_eq!(d.get_cached(), None);

    assert_eq!(d.get(), 2);
    a.set(5);
    // stale, but served without recomputing
    assert_eq!(d.get_cached(), Some(2));
    assert_eq!(d.get(), 10);
    assert_eq!(d.get_cached(), Some(10));
}

#[test]
fn notify_forces_recompute_and_propagation() {
    let counter = Rc::new(Cell::new(0));
    let d = create_derived({
        let counter = Rc::clone(&counter);
        move |_| counter.get()
    });
    let seen = Rc::new(RefCell::new(Vec::new()));

    create_effect({
        let seen = Rc::clone(&seen);
        move || seen.borrow_mut().push(d.get())
    });
    assert_eq!(*seen.borrow(), vec![0]);

    // out-of-graph input changed; force the derived to notice
    counter.set(42);
    d.notify();
    assert_eq!(*seen.borrow(), vec![0, 42]);
}

#[test]
fn dynamic_dependencies_follow_the_last_run() {
    let first = create_source("Nia");
    let last = create_source("Okafor");
    let use_last = create_source(true);

    let computations = Rc::new(RefCell::new(0));
    let name = create_derived({
        let computations = Rc::clone(&computations);
        move |_| {
            *computations.borrow_mut() += 1;
            if use_last.get() {
                format!("{} {}", first.get(), last.get())
            } else {
                first.get().to_string()
            }
        }
    });

    let runs = Rc::new(RefCell::new(0));
    create_effect({
        let runs = Rc::clone(&runs);
        move || {
            let _ = name.get();
            *runs.borrow_mut() += 1;
        }
    });
    assert_eq!(*runs.borrow(), 1);

    use_last.set(false);
    assert_eq!(name.get(), "Nia");
    let computed_so_far = *computations.borrow();

    // `last` fell out of the dependency set on the previous run
    last.set("Udo");
    assert_eq!(*computations.borrow(), computed_so_far);
    assert_eq!(*runs.borrow(), 2);

    use_last.set(true);
    assert_eq!(name.get(), "Nia Udo");
}

#[test]
fn cycle_guard_resolves_to_cached_value() {
    let slot: Rc<Cell<Option<Derived<i32>>>> = Rc::new(Cell::new(None));
    let inner_results = Rc::new(RefCell::new(Vec::new()));

    let d = create_derived({
        let slot = Rc::clone(&slot);
        let inner_results = Rc::clone(&inner_results);
        move |_| {
            let d = slot.get().unwrap();
            let inner = d.try_get();
            let seed = match &inner {
                Ok(value) => *value,
                Err(_) => 0,
            };
            inner_results
                .borrow_mut()
                .push(matches!(inner, Err(NodeError::Cycle)));
            seed + 1
        }
    });
    slot.set(Some(d));

    // first compute: the reentrant read has no cached value yet
    assert_eq!(d.get(), 1);
    assert_eq!(*inner_results.borrow(), vec![true]);

    // forcing a recompute: the reentrant read now sees the cached 1
    d.notify();
    assert_eq!(d.get(), 2);
    assert_eq!(*inner_results.borrow(), vec![true, false]);
}

#[test]
fn writable_derived_round_trip() {
    let celsius = create_source(0.0_f64);
    let fahrenheit = create_writable_derived(
        move |_| celsius.get() * 9.0 / 5.0 + 32.0,
        move |f| celsius.set((f - 32.0) * 5.0 / 9.0),
    );

    assert_eq!(fahrenheit.get(), 32.0);

    celsius.set(100.0);
    assert_eq!(fahrenheit.get(), 212.0);

    fahrenheit.set(32.0);
    assert_eq!(celsius.get(), 0.0);
    assert_eq!(fahrenheit.get(), 32.0);
}

#[test]
fn writable_derived_setter_is_atomic() {
    let x = create_source(0);
    let y = create_source(0);
    let pair = create_writable_derived(
        move |_| (x.get(), y.get()),
        move |(new_x, new_y)| {
            x.set(new_x);
            y.set(new_y);
        },
    );

    let runs = Rc::new(RefCell::new(0));
    create_effect({
        let runs = Rc::clone(&runs);
        move || {
            let _ = pair.get();
            *runs.borrow_mut() += 1;
        }
    });
    assert_eq!(*runs.borrow(), 1);

    // the setter writes two sources; subscribers observe one change
    pair.set((1, 2));
    assert_eq!(*runs.borrow(), 2);
    assert_eq!(pair.get(), (1, 2));
}

#[test]
fn disposed_derived_fails_fast() {
    let a = create_source(1);
    let d = create_derived(move |_| a.get());
    assert_eq!(d.get(), 1);

    d.dispose();
    assert!(d.is_disposed());
    assert!(matches!(d.try_get(), Err(NodeError::Disposed)));
}
