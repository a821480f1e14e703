use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serv_core::Registry;

fn registry_churn(c: &mut Criterion) {
    c.bench_function("registry insert+remove 1k fds", |b| {
        let mut reg = Registry::with_capacity(1024);
        b.iter(|| {
            for fd in 3..1027 {
                reg.insert(fd, "127.0.0.1", 40000, (512, 512));
            }
            for fd in 3..1027 {
                black_box(reg.remove(fd));
            }
        });
    });

    c.bench_function("registry lookup hit", |b| {
        let mut reg = Registry::with_capacity(1024);
        for fd in 3..1027 {
            reg.insert(fd, "127.0.0.1", 40000, (512, 512));
        }
        b.iter(|| {
            for fd in 3..1027 {
                black_box(reg.lookup(black_box(fd)));
            }
        });
    });
}

criterion_group!(benches, registry_churn);
criterion_main!(benches);
