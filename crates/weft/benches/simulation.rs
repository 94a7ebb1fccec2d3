use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use weft::node::{ArithOp, ConnectionType, NodePort, REG_DATA, REG_RESET_VALUE};
use weft::{optimizer, rational, Circuit, ReferenceSimulator};

/// A chain of counters, each enabled by the previous one's wrap-around,
/// as a stand-in for register-heavy designs.
fn counter_chain(stages: usize) -> Circuit {
    let mut c = Circuit::new();
    let clk = c.create_root_clock("clk", rational(100_000_000, 1));
    let mut previous: Option<NodePort> = None;
    for stage in 0..stages {
        let reg = c.add_register(clk);
        let zero = c.add_constant(weft::value_state(0, 16), ConnectionType::BitVec(16));
        let one = c.add_constant(weft::value_state(1, 16), ConnectionType::BitVec(16));
        let add = c.add_arithmetic(ArithOp::Add);
        c.connect_input(NodePort::new(reg, REG_RESET_VALUE), NodePort::new(zero, 0)).unwrap();
        c.connect_input(NodePort::new(add, 0), NodePort::new(reg, 0)).unwrap();
        let increment = match previous {
            None => NodePort::new(one, 0),
            Some(prev) => {
                // Chain stages combinationally so evaluation has depth.
                let xor = c.add_logic(weft::node::LogicOp::Xor);
                c.connect_input(NodePort::new(xor, 0), prev).unwrap();
                c.connect_input(NodePort::new(xor, 1), NodePort::new(one, 0)).unwrap();
                NodePort::new(xor, 0)
            }
        };
        c.connect_input(NodePort::new(add, 1), increment).unwrap();
        c.connect_input(NodePort::new(reg, REG_DATA), NodePort::new(add, 0)).unwrap();

        let out = c.add_signal();
        c.node_mut(out).set_name(format!("stage_{}", stage));
        c.node_mut(out).ref_count = 1;
        c.connect_input(NodePort::new(out, 0), NodePort::new(reg, 0)).unwrap();
        previous = Some(NodePort::new(out, 0));
    }
    c
}

fn bench_simulation(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("simulation");

    group.bench_function("counter_chain_64_x_1000_cycles", |b| {
        b.iter_batched(
            || {
                let mut c = counter_chain(64);
                optimizer::optimize(&mut c, 3).unwrap();
                let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
                sim.power_on();
                sim
            },
            |mut sim| {
                sim.advance(rational(1000, 100_000_000));
                sim
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("optimize_level3_counter_chain_64", |b| {
        b.iter_batched(
            || counter_chain(64),
            |mut c| {
                optimizer::optimize(&mut c, 3).unwrap();
                c
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_simulation);
criterion_main!(benches);
