use criterion::{criterion_group, criterion_main, Criterion};
use strand_reactive::{create_derived, create_source, Derived};

fn deep_update(c: &mut Criterion) {
    c.bench_function("deep_update", |b| {
        b.iter(|| {
            let source = create_source(0usize);
            let mut chain = Vec::<Derived<usize>>::new();
            for i in 0..1000usize {
                let prev = chain.get(i.saturating_sub(1)).copied();
                if let Some(prev) = prev {
                    chain.push(create_derived(move |_: Option<&usize>| {
                        prev.get() + 1
                    }));
                } else {
                    chain.push(create_derived(move |_: Option<&usize>| {
                        source.get() + 1
                    }));
                }
            }
            let last = chain[999];
            assert_eq!(last.get(), 1000);
            source.set(1);
            assert_eq!(last.get(), 1001);
            for derived in &chain {
                derived.dispose();
            }
            source.dispose();
        });
    });
}

criterion_group!(deep, deep_update);
criterion_main!(deep);
