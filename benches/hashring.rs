use std::collections::HashSet;
use std::sync::Arc;

use chash_lb::{
    BalancerConfig, ConsistentHashingLoadBalancer, HashAlgorithm, SelectIn, ServerDirectory,
    ServerId,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn balancer(servers: u64, hash_algorithm: HashAlgorithm) -> ConsistentHashingLoadBalancer {
    let directory: ServerDirectory = (1..=servers)
        .map(|id| {
            let addr = format!("10.0.{}.{}:8000", id / 256, id % 256);
            (id, addr.parse().unwrap())
        })
        .collect();
    let config = BalancerConfig {
        hash_algorithm,
        ..BalancerConfig::default()
    };
    ConsistentHashingLoadBalancer::with_config(Arc::new(directory), config).unwrap()
}

fn servers(count: u64) -> Vec<ServerId> {
    (1..=count).map(ServerId::new).collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    {
        let mut group = c.benchmark_group("Selecting a server by code w/ n servers");
        for size in [1, 10, 100, 1000].iter() {
            let lb = balancer(*size, HashAlgorithm::Murmur3);
            lb.add_servers_in_batch(&servers(*size));
            group.bench_with_input(BenchmarkId::from_parameter(size), &lb, |b, lb| {
                let mut code = 0u32;
                b.iter(|| {
                    code = code.wrapping_add(0x9e37_79b9);
                    lb.select_server(&SelectIn::with_code(code))
                });
            });
        }
        group.finish();
    }

    {
        let mut group = c.benchmark_group("Selecting a server with half the servers excluded");
        for size in [10, 100].iter() {
            let lb = balancer(*size, HashAlgorithm::Murmur3);
            lb.add_servers_in_batch(&servers(*size));
            let excluded: HashSet<ServerId> = servers(*size / 2).into_iter().collect();
            group.bench_with_input(BenchmarkId::from_parameter(size), &lb, |b, lb| {
                b.iter(|| lb.select_server(&SelectIn::default().excluding(&excluded)));
            });
        }
        group.finish();
    }

    for algorithm in HashAlgorithm::ALL {
        let mut group = c.benchmark_group(format!("Adding and removing n servers with {algorithm}"));
        for size in [1, 10, 100].iter() {
            let lb = balancer(*size, algorithm);
            let batch = servers(*size);
            group.bench_with_input(BenchmarkId::from_parameter(size), &batch, |b, batch| {
                b.iter(|| {
                    lb.add_servers_in_batch(batch);
                    lb.remove_servers_in_batch(batch);
                });
            });
        }
        group.finish();
    }

    {
        let lb = balancer(100, HashAlgorithm::Murmur3);
        lb.add_servers_in_batch(&servers(99));
        let extra = ServerId::new(100);
        c.bench_function("Adding and removing one server next to 99", |b| {
            b.iter(|| {
                lb.add_server(&extra);
                lb.remove_server(&extra);
            });
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
