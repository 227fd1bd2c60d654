use std::{cell::RefCell, rc::Rc};
use strand_reactive::{
    create_derived, create_effect, create_scope, create_source, notify_all,
    untracked, untracked_scope,
};

#[test]
fn untracked_read_establishes_no_dependency() {
    let a = create_source(1);
    let b = create_source(2);
    let runs = Rc::new(RefCell::new(0));

    create_effect({
        let runs = Rc::clone(&runs);
        move || {
            let _ = a.get();
            let _ = untracked(|| b.get());
            *runs.borrow_mut() += 1;
        }
    });
    assert_eq!(*runs.borrow(), 1);

    a.set(10);
    assert_eq!(*runs.borrow(), 2);

    b.set(20);
    assert_eq!(*runs.borrow(), 2);
}

#[test]
fn untracked_inside_derived() {
    let a = create_source(0);
    let b = create_source(0);
    let c = create_derived(move |_| a.get() + untracked(|| b.get()));

    assert_eq!(c.get(), 0);
    a.set(1);
    assert_eq!(c.get(), 1);
    b.set(1);
    // hasn't updated, because we untracked before reading b
    assert_eq!(c.get(), 1);
    a.set(2);
    assert_eq!(c.get(), 3);
}

#[test]
fn get_untracked_establishes_no_dependency() {
    let a = create_source(-1);
    let a2 = create_source(1);
    let out = Rc::new(RefCell::new(String::new()));

    create_effect({
        let out = Rc::clone(&out);
        move || {
            let formatted =
                format!("Values are {} and {}", a.get(), a2.get_untracked());
            *out.borrow_mut() = formatted;
        }
    });
    assert_eq!(out.borrow().as_str(), "Values are -1 and 1");

    a2.set(-1);
    assert_eq!(out.borrow().as_str(), "Values are -1 and 1");

    a.set(1);
    assert_eq!(out.borrow().as_str(), "Values are 1 and -1");
}

#[test]
fn untracked_restores_the_subscriber() {
    let a = create_source(0);
    let b = create_source(0);
    let runs = Rc::new(RefCell::new(0));

    create_effect({
        let runs = Rc::clone(&runs);
        move || {
            untracked(|| b.get());
            // tracking resumes after the untracked region
            let _ = a.get();
            *runs.borrow_mut() += 1;
        }
    });

    a.set(1);
    assert_eq!(*runs.borrow(), 2);
    b.set(1);
    assert_eq!(*runs.borrow(), 2);
}

#[test]
fn untracked_scope_detaches_ownership() {
    let owned_disposals = Rc::new(RefCell::new(0));
    let free_disposals = Rc::new(RefCell::new(0));

    let scope = create_scope({
        let owned_disposals = Rc::clone(&owned_disposals);
        let free_disposals = Rc::clone(&free_disposals);
        move || {
            create_effect(|| {}).on_dispose({
                let owned_disposals = Rc::clone(&owned_disposals);
                move || *owned_disposals.borrow_mut() += 1
            });
            untracked_scope(|| {
                create_effect(|| {}).on_dispose({
                    let free_disposals = Rc::clone(&free_disposals);
                    move || *free_disposals.borrow_mut() += 1
                });
            });
        }
    });

    scope.dispose();
    assert_eq!(*owned_disposals.borrow(), 1);
    assert_eq!(*free_disposals.borrow(), 0);
}

#[test]
fn notify_all_forces_reads_to_fire() {
    let items = create_source(vec![1]);
    let lens = Rc::new(RefCell::new(Vec::new()));

    create_effect({
        let lens = Rc::clone(&lens);
        move || lens.borrow_mut().push(items.with(|v| v.len()))
    });
    assert_eq!(*lens.borrow(), vec![1]);

    // mutate silently, then mark everything read inside as changed
    items.update_untracked(|v| v.push(2));
    notify_all(|| {
        items.with(|_| ());
    });
    assert_eq!(*lens.borrow(), vec![1, 2]);
}

#[test]
fn notify_all_returns_value_and_skips_unread_sources() {
    let read = create_source(1);
    let unread = create_source(1);
    let read_runs = Rc::new(RefCell::new(0));
    let unread_runs = Rc::new(RefCell::new(0));

    create_effect({
        let read_runs = Rc::clone(&read_runs);
        move || {
            let _ = read.get();
            *read_runs.borrow_mut() += 1;
        }
    });
    create_effect({
        let unread_runs = Rc::clone(&unread_runs);
        move || {
            let _ = unread.get();
            *unread_runs.borrow_mut() += 1;
        }
    });

    let value = notify_all(|| read.get() * 10);
    assert_eq!(value, 10);
    assert_eq!(*read_runs.borrow(), 2);
    assert_eq!(*unread_runs.borrow(), 1);
}
