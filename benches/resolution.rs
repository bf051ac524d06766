//! Benchmarks for address resolution and multipath selection
//!
//! A lab switch with 96 logged in ports and a host with 200 multipath
//! devices over 4 distinct paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use san_topology::topology::normalize;
use san_topology::{
    choose_mpaths, Address, AddressSets, DriverRegistry, MultipathDevice, SanConfig, SanTopology,
};
use std::fmt::Write;

const PORTS: usize = 96;

fn wwpn(i: usize) -> String {
    format!("10:00:00:00:c9:95:{:02x}:{:02x}", i / 256, i % 256)
}

fn lab_config() -> String {
    let mut text = String::from(
        "[sw1]\ntype = switch\nmodel = SIM-FABRIC\nctrl_ip = 10.0.0.10\n\
         ctrl_user = admin\nctrl_pass = secret\nctrl_type = ssh\n",
    );
    for i in 0..PORTS {
        let _ = writeln!(text, "wwpn-{} = {}", i, wwpn(i));
    }
    text
}

fn load_topology() -> SanTopology {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = SanConfig::parse(&lab_config()).unwrap();
    let registry = DriverRegistry::with_builtin();
    let (topology, _) = rt.block_on(SanTopology::load(config, AddressSets::default(), &registry, None));
    topology
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolution");
    group.throughput(Throughput::Elements(3));

    group.bench_function("normalize_mixed", |b| {
        b.iter(|| {
            let _ = normalize(black_box("10-00-00-00-C9-95-2F-DE"));
            let _ = normalize(black_box("0800.2705.3771"));
            let _ = normalize(black_box("iqn.1994-05.com.redhat:st05"));
        });
    });

    group.finish();
}

fn bench_switch_of(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolution");
    group.throughput(Throughput::Elements(1));

    let topology = load_topology();
    let addrs: Vec<Address> = (0..PORTS).map(|i| Address::wwpn(&wwpn(i)).unwrap()).collect();

    group.bench_function("switch_of", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let addr = &addrs[counter % PORTS];
            black_box(topology.resolver().switch_of(addr).map(|owner| owner.port_id));
        });
    });

    group.finish();
}

fn bench_choose_mpaths(c: &mut Criterion) {
    let mut group = c.benchmark_group("multipath");
    group.throughput(Throughput::Elements(200));

    let free: Vec<MultipathDevice> = (0..200)
        .map(|i| MultipathDevice {
            name: format!("mpath{}", i),
            vendor: Some("NETAPP".into()),
            product: Some("LUN C-Mode".into()),
            h_wwpns: vec![Address::wwpn(&wwpn(i % 4)).unwrap()],
            t_wwpns: vec![Address::wwpn("50:0a:09:85:99:4b:8d:c5").unwrap()],
            ..Default::default()
        })
        .collect();

    group.bench_function("choose_200", |b| {
        b.iter(|| black_box(choose_mpaths(black_box(&free), None)));
    });

    group.finish();
}

criterion_group!(benches, bench_normalize, bench_switch_of, bench_choose_mpaths);
criterion_main!(benches);
