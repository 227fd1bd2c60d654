use criterion::{criterion_group, criterion_main, Criterion};
use strand_reactive::{batch, create_derived, create_source, Source};

fn narrow_down(c: &mut Criterion) {
    c.bench_function("narrow_down", |b| {
        b.iter(|| {
            let sources: Vec<Source<usize>> =
                (0..1000usize).map(create_source).collect();
            let sum = {
                let sources = sources.clone();
                create_derived(move |_: Option<&usize>| {
                    sources.iter().map(|source| source.get()).sum()
                })
            };
            assert_eq!(sum.get(), 499_500);
            batch(|| {
                for source in sources.iter().take(10) {
                    source.set(1000);
                }
            });
            assert_eq!(sum.get(), 509_455);
            sum.dispose();
            for source in &sources {
                source.dispose();
            }
        });
    });
}

criterion_group!(narrow, narrow_down);
criterion_main!(narrow);
