//! FIFO microbenchmark.

use criterion::{criterion_group, criterion_main, Criterion};

use transfer::buffer::Buf;
use transfer::fifo::Fifo;

fn bench_fifo(c: &mut Criterion) {
    c.bench_function("fifo_fill_drain_64", |b| {
        let mut fifo = Fifo::new(64);
        let mut bufs: Vec<_> = (0..64).map(|_| Buf::alloc_prog()).collect();
        b.iter(|| {
            while let Some(h) = bufs.pop() {
                fifo.put(h).ok().unwrap();
            }
            while let Some(h) = fifo.get() {
                bufs.push(h);
            }
        });
    });

    c.bench_function("fifo_peek", |b| {
        let mut fifo = Fifo::new(64);
        fifo.put(Buf::alloc_prog()).ok().unwrap();
        b.iter(|| fifo.peek().map(|h| h.ctx_id()));
    });
}

criterion_group!(benches, bench_fifo);
criterion_main!(benches);
