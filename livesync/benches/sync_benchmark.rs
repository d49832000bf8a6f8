use criterion::{black_box, criterion_group, criterion_main, Criterion};
use livesync::{
    ChangeKind, CollectionName, Delta, DeltaObserver, Dispatcher, Document, DocumentId, Fields,
    ObserverError, Reconciler, RemoteChange, Timestamp, Value,
};
use std::sync::Arc;

fn sample_document(n: i64) -> Document {
    let mut fields = Fields::new();
    fields.insert("name".to_string(), Value::from(format!("doc-{n}")));
    fields.insert("count".to_string(), Value::from(n as f64));
    Document::with_timestamps(fields, Timestamp(0), Timestamp(n))
}

fn bench_apply_upsert(c: &mut Criterion) {
    c.bench_function("reconciler_apply_1k_upserts", |b| {
        b.iter(|| {
            let mut reconciler =
                Reconciler::new(CollectionName::new("projects").unwrap());
            for n in 0..1_000i64 {
                let change = RemoteChange {
                    id: DocumentId::from(format!("doc-{}", n % 100).as_str()),
                    kind: ChangeKind::Modified,
                    document: Some(sample_document(n)),
                };
                black_box(reconciler.apply(black_box(change)));
            }
        })
    });
}

fn bench_apply_stale(c: &mut Criterion) {
    let mut reconciler = Reconciler::new(CollectionName::new("projects").unwrap());
    reconciler.apply(RemoteChange {
        id: DocumentId::from("doc"),
        kind: ChangeKind::Added,
        document: Some(sample_document(1_000_000)),
    });

    c.bench_function("reconciler_discard_stale", |b| {
        b.iter(|| {
            let change = RemoteChange {
                id: DocumentId::from("doc"),
                kind: ChangeKind::Modified,
                document: Some(sample_document(1)),
            };
            black_box(reconciler.apply(black_box(change)));
        })
    });
}

fn bench_resync(c: &mut Criterion) {
    let listing: Vec<(DocumentId, Document)> = (0..1_000i64)
        .map(|n| {
            (
                DocumentId::from(format!("doc-{n}").as_str()),
                sample_document(n),
            )
        })
        .collect();

    c.bench_function("reconciler_resync_1k_docs", |b| {
        b.iter(|| {
            let mut reconciler =
                Reconciler::new(CollectionName::new("projects").unwrap());
            black_box(reconciler.resync(black_box(listing.clone())));
        })
    });
}

fn bench_dispatch_fanout(c: &mut Criterion) {
    let mut dispatcher = Dispatcher::new();
    for _ in 0..100 {
        let observer: Arc<dyn DeltaObserver> =
            Arc::new(|delta: &Delta| -> Result<(), ObserverError> {
                black_box(&delta.id);
                Ok(())
            });
        dispatcher.register(observer);
    }
    let delta = Delta {
        collection: CollectionName::new("projects").unwrap(),
        kind: livesync::DeltaKind::Added,
        id: DocumentId::from("doc"),
        before: None,
        after: Some(sample_document(1)),
        sequence: 1,
    };

    c.bench_function("dispatch_100_observers", |b| {
        b.iter(|| {
            black_box(dispatcher.dispatch(black_box(&delta)));
        })
    });
}

criterion_group!(
    benches,
    bench_apply_upsert,
    bench_apply_stale,
    bench_resync,
    bench_dispatch_fanout
);
criterion_main!(benches);
