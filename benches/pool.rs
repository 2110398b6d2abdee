use criterion::{black_box, criterion_group, criterion_main, Criterion};
use muxnet::engine::HandleId;
use muxnet::socket::pool::{Acquired, ConnectionIdentity, ConnectionPool, Poolable};

#[derive(Clone)]
struct BenchConn {
    identity: ConnectionIdentity,
}

impl Poolable for BenchConn {
    fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    fn connect_host(&self) -> &str {
        "bench.test"
    }

    fn is_reusable(&self) -> bool {
        true
    }
}

/// Acquire/release cycles are pure bookkeeping; no I/O involved.
fn benchmark_pool_operations(c: &mut Criterion) {
    let identity = ConnectionIdentity::default();
    let authority = "https://bench.test:443";

    c.bench_function("pool_acquire_release_idle", |b| {
        let mut pool: ConnectionPool<BenchConn, BenchConn> = ConnectionPool::new(6);
        pool.acquire(authority, &identity, HandleId::from_raw(0));
        pool.release(
            authority,
            Some(BenchConn {
                identity: identity.clone(),
            }),
        );
        let mut n = 1;
        b.iter(|| {
            let acquired = pool.acquire(authority, &identity, HandleId::from_raw(n));
            n += 1;
            let conn = match acquired {
                Acquired::Idle(conn) => Some(conn),
                _ => None,
            };
            pool.release(authority, black_box(conn));
        })
    });

    c.bench_function("pool_queue_and_admit", |b| {
        b.iter(|| {
            let mut pool: ConnectionPool<BenchConn, BenchConn> = ConnectionPool::new(1);
            for n in 0..16 {
                pool.acquire(authority, &identity, HandleId::from_raw(n));
            }
            for _ in 0..16 {
                pool.release(authority, None);
                black_box(pool.admit_next(authority, |_| Some(identity.clone())));
            }
        })
    });

    let pool: ConnectionPool<BenchConn, BenchConn> = ConnectionPool::new(6);
    c.bench_function("pool_stats", |b| {
        b.iter(|| {
            black_box(pool.connection_count(authority));
            black_box(pool.waiting_count(authority));
        })
    });
}

criterion_group!(benches, benchmark_pool_operations);
criterion_main!(benches);
