use std::cell::{Cell, RefCell};
use std::rc::Rc;

use test_case::test_case;

use crate::circuit::Circuit;
use crate::clock::ClockId;
use crate::node::{
    ArithOp, CompareOp, ConnectionType, LogicOp, MemPortDesc, MemType, MemoryDesc, NodeId,
    NodeKind, NodePort, PinDirection, TapLevel, TapTrigger, EXPORT_EXPORT, EXPORT_SIM,
    MEMPORT_ADDRESS, MEMPORT_ENABLE, MEMPORT_RDDATA, MEMPORT_WRDATA, REG_DATA, REG_RESET_VALUE,
};
use crate::optimizer;
use crate::rational::{rational, ClockRational};
use crate::simulator::{ReferenceSimulator, SensitivityList, SimulatorCallbacks, TimingPhase};
use crate::state::{bit_state, value_state, BitVecState, Plane};
use crate::subnet::Subnet;

fn ns(n: u64) -> ClockRational {
    rational(n, 1_000_000_000)
}

fn mhz(n: u64) -> ClockRational {
    rational(n * 1_000_000, 1)
}

fn connect(c: &mut Circuit, to: (NodeId, usize), from: (NodeId, usize)) {
    c.connect_input(NodePort::new(to.0, to.1), NodePort::new(from.0, from.1))
        .expect("test circuits are well-typed");
}

fn keepalive_signal(c: &mut Circuit, name: &str, from: NodePort) -> NodePort {
    let signal = c.add_signal();
    c.node_mut(signal).set_name(name);
    c.node_mut(signal).ref_count = 1;
    c.connect_input(NodePort::new(signal, 0), from).unwrap();
    NodePort::new(signal, 0)
}

/// 4-bit counter with reset value 0 incrementing by one every cycle.
fn counter_circuit() -> (Circuit, ClockId, NodePort, NodeId) {
    let mut c = Circuit::new();
    let clk = c.create_root_clock("clk", mhz(100));
    let reg = c.add_register(clk);
    let zero = c.add_constant(value_state(0, 4), ConnectionType::BitVec(4));
    let one = c.add_constant(value_state(1, 4), ConnectionType::BitVec(4));
    let add = c.add_arithmetic(ArithOp::Add);
    connect(&mut c, (reg, REG_RESET_VALUE), (zero, 0));
    connect(&mut c, (add, 0), (reg, 0));
    connect(&mut c, (add, 1), (one, 0));
    connect(&mut c, (reg, REG_DATA), (add, 0));
    let out = keepalive_signal(&mut c, "count", NodePort::new(reg, 0));
    (c, clk, out, reg)
}

#[derive(Default)]
struct Recorder {
    asserts: Vec<String>,
    warnings: Vec<String>,
}

impl SimulatorCallbacks for Recorder {
    fn on_warning(&mut self, _src: NodeId, msg: &str) {
        self.warnings.push(msg.to_string());
    }

    fn on_assert(&mut self, _src: NodeId, msg: &str) {
        self.asserts.push(msg.to_string());
    }
}

#[test]
fn counter_counts_modulo_16() {
    let (c, _clk, out, _reg) = counter_circuit();
    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();

    assert_eq!(sim.value_of_output_u64(out), Some(0));
    sim.advance(ns(10));
    assert_eq!(sim.value_of_output_u64(out), Some(1));
    sim.advance(ns(150));
    assert_eq!(sim.current_time(), ns(160));
    assert_eq!(sim.value_of_output_u64(out), Some(0));
}

#[test]
fn counter_survives_optimization() {
    let (mut c, _clk, out, _reg) = counter_circuit();
    optimizer::optimize(&mut c, 3).unwrap();
    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();
    sim.advance(ns(70));
    assert_eq!(sim.value_of_output_u64(out), Some(7));
}

#[test]
fn sr_latch_sets_and_resets() {
    let mut c = Circuit::new();
    let clk = c.create_root_clock("clk", mhz(100));
    let s = c.add_pin(PinDirection::Input);
    c.node_mut(s).output_mut(0).ty = ConnectionType::Bool;
    let r = c.add_pin(PinDirection::Input);
    c.node_mut(r).output_mut(0).ty = ConnectionType::Bool;

    let q_reg = c.add_register(clk);
    let zero = c.add_constant(bit_state(false), ConnectionType::Bool);
    connect(&mut c, (q_reg, REG_RESET_VALUE), (zero, 0));

    // Cross-coupled NORs with the state-holding register in the loop.
    let nor_qbar = c.add_logic(LogicOp::Nor);
    connect(&mut c, (nor_qbar, 0), (s, 0));
    connect(&mut c, (nor_qbar, 1), (q_reg, 0));
    let nor_q = c.add_logic(LogicOp::Nor);
    connect(&mut c, (nor_q, 0), (r, 0));
    connect(&mut c, (nor_q, 1), (nor_qbar, 0));
    connect(&mut c, (q_reg, REG_DATA), (nor_q, 0));

    // Registered inverted output.
    let qbar_reg = c.add_register(clk);
    let one = c.add_constant(bit_state(true), ConnectionType::Bool);
    connect(&mut c, (qbar_reg, REG_RESET_VALUE), (one, 0));
    connect(&mut c, (qbar_reg, REG_DATA), (nor_qbar, 0));

    let q = keepalive_signal(&mut c, "q", NodePort::new(q_reg, 0));

    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.add_simulation_process(move |h| async move {
        h.set_pin(s, &bit_state(false));
        h.set_pin(r, &bit_state(false));
        h.wait_clock(clk, TimingPhase::After).await;
        assert_eq!(h.sample_value(q), Some(0));

        // One-cycle set pulse: q goes and stays high.
        h.set_pin(s, &bit_state(true));
        h.wait_clock(clk, TimingPhase::After).await;
        h.set_pin(s, &bit_state(false));
        assert_eq!(h.sample_value(q), Some(1));
        h.wait_clock(clk, TimingPhase::After).await;
        assert_eq!(h.sample_value(q), Some(1));
        h.wait_clock(clk, TimingPhase::After).await;
        assert_eq!(h.sample_value(q), Some(1));

        // One-cycle reset pulse: q returns low.
        h.set_pin(r, &bit_state(true));
        h.wait_clock(clk, TimingPhase::After).await;
        h.set_pin(r, &bit_state(false));
        assert_eq!(h.sample_value(q), Some(0));
        h.wait_clock(clk, TimingPhase::After).await;
        assert_eq!(h.sample_value(q), Some(0));
    });
    sim.power_on();
    sim.advance(ns(100));
}

fn memory_with_ports(
    write_before_read: bool,
) -> (Circuit, ClockId, NodeId, NodeId, NodeId, NodePort) {
    let mut c = Circuit::new();
    let clk = c.create_root_clock("clk", mhz(100));

    let mut init = BitVecState::new(128);
    for i in 0..16u64 {
        init.insert(Plane::Value, (i as usize) * 8, 8, i * i);
    }
    init.set_range(Plane::Defined, 0, 128);
    let mem = c.add_memory(MemoryDesc {
        size: 128,
        word_width: 8,
        mem_type: MemType::DontCare,
        initial: Some(init),
        no_conflicts: false,
    });

    let addr = c.add_constant(value_state(3, 4), ConnectionType::BitVec(4));
    let enable = c.add_constant(bit_state(true), ConnectionType::Bool);
    let data = c.add_constant(value_state(0xff, 8), ConnectionType::BitVec(8));

    let wp = c.add_mem_port(mem, MemPortDesc { word_width: 8, reads: false, writes: true });
    c.attach_clock(wp, 0, clk);
    connect(&mut c, (wp, MEMPORT_ADDRESS), (addr, 0));
    connect(&mut c, (wp, MEMPORT_ENABLE), (enable, 0));
    connect(&mut c, (wp, MEMPORT_WRDATA), (data, 0));

    let rp = c.add_mem_port(mem, MemPortDesc { word_width: 8, reads: true, writes: false });
    connect(&mut c, (rp, MEMPORT_ADDRESS), (addr, 0));
    connect(&mut c, (rp, MEMPORT_ENABLE), (enable, 0));

    if write_before_read {
        optimizer::memory::order_after(&mut c, rp, Some(wp));
    } else {
        optimizer::memory::order_after(&mut c, wp, Some(rp));
    }

    let out = keepalive_signal(&mut c, "read_data", NodePort::new(rp, MEMPORT_RDDATA));
    (c, clk, mem, wp, rp, out)
}

#[test]
fn read_before_write_returns_old_value() {
    let (mut c, _clk, mem, _wp, _rp, out) = memory_with_ports(false);
    optimizer::optimize(&mut c, 3).unwrap();

    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();
    sim.advance(ns(2));
    // Same-cycle read sees the pre-write content: 3 * 3.
    assert_eq!(sim.value_of_output_u64(out), Some(9));

    sim.advance(ns(6));
    let content = sim.value_of_internal_state(mem, 0);
    assert_eq!(content.extract(Plane::Value, 3 * 8, 8), 0xff);
    assert!(content.all_defined(3 * 8, 8));
}

#[test]
fn write_first_port_forwards_new_value() {
    let (mut c, _clk, mem, _wp, _rp, out) = memory_with_ports(true);
    optimizer::optimize(&mut c, 3).unwrap();

    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();
    sim.advance(ns(2));
    // The injected collision bypass forwards the write data combinationally.
    assert_eq!(sim.value_of_output_u64(out), Some(0xff));

    sim.advance(ns(6));
    let content = sim.value_of_internal_state(mem, 0);
    assert_eq!(content.extract(Plane::Value, 3 * 8, 8), 0xff);
}

#[test]
fn simultaneous_writes_resolve_in_program_order() {
    let mut c = Circuit::new();
    let clk = c.create_root_clock("clk", mhz(100));
    let mem = c.add_memory(MemoryDesc {
        size: 128,
        word_width: 8,
        mem_type: MemType::DontCare,
        initial: None,
        no_conflicts: false,
    });
    let addr = c.add_constant(value_state(5, 4), ConnectionType::BitVec(4));
    let enable = c.add_constant(bit_state(true), ConnectionType::Bool);
    let d1 = c.add_constant(value_state(0x11, 8), ConnectionType::BitVec(8));
    let d2 = c.add_constant(value_state(0x22, 8), ConnectionType::BitVec(8));

    let w1 = c.add_mem_port(mem, MemPortDesc { word_width: 8, reads: false, writes: true });
    c.attach_clock(w1, 0, clk);
    connect(&mut c, (w1, MEMPORT_ADDRESS), (addr, 0));
    connect(&mut c, (w1, MEMPORT_ENABLE), (enable, 0));
    connect(&mut c, (w1, MEMPORT_WRDATA), (d1, 0));
    let w2 = c.add_mem_port(mem, MemPortDesc { word_width: 8, reads: false, writes: true });
    c.attach_clock(w2, 0, clk);
    connect(&mut c, (w2, MEMPORT_ADDRESS), (addr, 0));
    connect(&mut c, (w2, MEMPORT_ENABLE), (enable, 0));
    connect(&mut c, (w2, MEMPORT_WRDATA), (d2, 0));
    optimizer::memory::order_after(&mut c, w2, Some(w1));

    optimizer::optimize(&mut c, 3).unwrap();

    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();
    sim.advance(ns(8));
    let content = sim.value_of_internal_state(mem, 0);
    // The explicitly later write wins the collision.
    assert_eq!(content.extract(Plane::Value, 5 * 8, 8), 0x22);
    assert!(content.all_defined(5 * 8, 8));
}

#[test]
fn const_select_mux_disappears() {
    let mut c = Circuit::new();
    let sel = c.add_constant(bit_state(true), ConnectionType::Bool);
    let a = c.add_constant(value_state(7, 4), ConnectionType::BitVec(4));
    let b = c.add_constant(value_state(13, 4), ConnectionType::BitVec(4));
    let mux = c.add_mux(2);
    connect(&mut c, (mux, 0), (sel, 0));
    connect(&mut c, (mux, 1), (a, 0));
    connect(&mut c, (mux, 2), (b, 0));
    let out = keepalive_signal(&mut c, "selected", NodePort::new(mux, 0));

    optimizer::optimize(&mut c, 3).unwrap();

    assert!(
        !c.nodes().any(|n| matches!(n.kind, NodeKind::Multiplexer { .. })),
        "the mux must be gone after level-3 optimization"
    );
    let driver = c.driver(out).unwrap();
    let resolved = c.non_signal_driver(out).unwrap_or(driver);
    match &c.node(resolved.node).kind {
        NodeKind::Constant { value, .. } => {
            assert_eq!(value.extract(Plane::Value, 0, 4), 13);
        }
        other => panic!("expected constant, got {:?}", other),
    }
}

#[test]
fn retiming_binds_read_register_to_memory() {
    let mut c = Circuit::new();
    let clk = c.create_root_clock("clk", mhz(100));

    let mut init = BitVecState::new(1024);
    for i in 0..128u64 {
        init.insert(Plane::Value, (i as usize) * 8, 8, i);
    }
    init.set_range(Plane::Defined, 0, 1024);
    let mem = c.add_memory(MemoryDesc {
        size: 1024,
        word_width: 8,
        mem_type: MemType::DontCare, // > 64 words, promoted to block RAM
        initial: Some(init),
        no_conflicts: false,
    });

    let addr_pin = c.add_pin(PinDirection::Input);
    c.node_mut(addr_pin).output_mut(0).ty = ConnectionType::BitVec(7);
    let rp = c.add_mem_port(mem, MemPortDesc { word_width: 8, reads: true, writes: false });
    connect(&mut c, (rp, MEMPORT_ADDRESS), (addr_pin, 0));

    // Combinational function between the port and the register.
    let mask = c.add_constant(value_state(0x5a, 8), ConnectionType::BitVec(8));
    let xor = c.add_logic(LogicOp::Xor);
    connect(&mut c, (xor, 0), (rp, MEMPORT_RDDATA));
    connect(&mut c, (xor, 1), (mask, 0));
    let reg = c.add_register(clk);
    connect(&mut c, (reg, REG_DATA), (xor, 0));
    let out = keepalive_signal(&mut c, "scrambled", NodePort::new(reg, 0));

    optimizer::optimize(&mut c, 3).unwrap();

    // The original register is gone; a new one is fused onto the port.
    assert!(!c.contains_node(reg));
    let bound: Vec<&crate::node::Node> = c
        .nodes()
        .filter(|n| n.register_flags().is_some_and(|f| f.bound_to_memory))
        .collect();
    assert_eq!(bound.len(), 1);
    let sync_reg = bound[0].id;
    assert_eq!(
        c.non_signal_driver(NodePort::new(sync_reg, REG_DATA)),
        Some(NodePort::new(rp, MEMPORT_RDDATA))
    );
    // The combinational function moved downstream of the register.
    assert_eq!(c.non_signal_driver(NodePort::new(xor, 0)), Some(NodePort::new(sync_reg, 0)));

    // Latency is unchanged: one cycle from address to scrambled output.
    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();
    sim.set_input_pin(addr_pin, &value_state(2, 7));
    sim.advance(ns(2));
    assert_eq!(sim.value_of_output_u64(out), None); // nothing registered yet
    sim.advance(ns(5));
    assert_eq!(sim.value_of_output_u64(out), Some(2 ^ 0x5a));
}

#[test]
fn assertion_tap_fires_per_transition() {
    let (mut c, _clk, _out, reg) = counter_circuit();
    let three = c.add_constant(value_state(3, 4), ConnectionType::BitVec(4));
    let eq = c.add_compare(CompareOp::Eq);
    connect(&mut c, (eq, 0), (reg, 0));
    connect(&mut c, (eq, 1), (three, 0));
    let tap = c.create_node(NodeKind::SignalTap {
        level: TapLevel::Assert,
        trigger: TapTrigger::FirstInputHigh,
    });
    c.node_mut(tap).set_name("count_is_three");
    connect(&mut c, (tap, 0), (eq, 0));

    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.add_callbacks(recorder.clone());
    sim.power_on();
    sim.advance(ns(200));
    sim.commit_state();

    // The counter passes 3 twice in twenty cycles; the tap fires once per
    // low-to-high transition of its condition, not per cycle it holds.
    assert_eq!(recorder.borrow().asserts.len(), 2);
    assert!(recorder.borrow().asserts[0].contains("count_is_three"));
    assert!(recorder.borrow().warnings.is_empty());
}

#[test]
fn optimization_is_idempotent() {
    let (mut c, _clk, _out, _reg) = counter_circuit();
    optimizer::optimize(&mut c, 3).unwrap();
    let count_once = c.node_count();
    let mut kinds_once: Vec<String> = c.nodes().map(|n| n.type_name()).collect();
    kinds_once.sort();

    optimizer::optimize(&mut c, 3).unwrap();
    let mut kinds_twice: Vec<String> = c.nodes().map(|n| n.type_name()).collect();
    kinds_twice.sort();

    assert_eq!(c.node_count(), count_once);
    assert_eq!(kinds_once, kinds_twice);
}

#[test]
fn combinational_cycles_are_reported() {
    let mut c = Circuit::new();
    let p = c.add_pin(PinDirection::Input);
    c.node_mut(p).output_mut(0).ty = ConnectionType::Bool;
    let and = c.add_logic(LogicOp::And);
    let not = c.add_logic(LogicOp::Not);
    connect(&mut c, (not, 0), (and, 0));
    connect(&mut c, (and, 0), (not, 0));
    connect(&mut c, (and, 1), (p, 0));
    keepalive_signal(&mut c, "oops", NodePort::new(and, 0));

    let err = ReferenceSimulator::compile(c, &[]).unwrap_err();
    match err {
        crate::errors::DesignError::CombinationalCycle { count, report } => {
            assert_eq!(count, 2);
            assert!(report.contains("and"));
            assert!(report.contains("not"));
        }
        other => panic!("expected cycle error, got {}", other),
    }
}

#[test]
fn export_override_separates_simulation_and_export() {
    let mut c = Circuit::new();
    let sim_const = c.add_constant(bit_state(true), ConnectionType::Bool);
    let export_const = c.add_constant(bit_state(false), ConnectionType::Bool);
    let or_override = c.create_node(NodeKind::ExportOverride);
    connect(&mut c, (or_override, EXPORT_SIM), (sim_const, 0));
    connect(&mut c, (or_override, EXPORT_EXPORT), (export_const, 0));
    let pin = c.add_pin(PinDirection::Output);
    connect(&mut c, (pin, 0), (or_override, 0));

    let sim_subnet = Subnet::all_for_simulation(&c, &[]);
    assert!(sim_subnet.contains(sim_const));
    assert!(!sim_subnet.contains(export_const));
    assert!(!sim_subnet.contains(or_override));

    let export_subnet = Subnet::all_for_export(&c, false);
    assert!(export_subnet.contains(export_const));
    assert!(export_subnet.contains(or_override));
    assert!(!export_subnet.contains(sim_const));

    // The simulator sees the simulation driver.
    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();
    assert_eq!(sim.value_of_output_u64(NodePort::new(sim_const, 0)), Some(1));
}

#[test]
fn register_resets_must_be_constant_for_export() {
    let (c, _clk, _out, _reg) = counter_circuit();
    c.check_export_invariants().unwrap();

    // A reset driven by a pin is not exportable.
    let mut c = Circuit::new();
    let clk = c.create_root_clock("clk", mhz(100));
    let reg = c.add_register(clk);
    let pin = c.add_pin(PinDirection::Input);
    c.node_mut(pin).output_mut(0).ty = ConnectionType::BitVec(4);
    connect(&mut c, (reg, REG_RESET_VALUE), (pin, 0));
    assert!(matches!(
        c.check_export_invariants(),
        Err(crate::errors::DesignError::ResetValueNotConstant { .. })
    ));

    // Through a signal chain it still resolves.
    let mut c = Circuit::new();
    let clk = c.create_root_clock("clk", mhz(100));
    let reg = c.add_register(clk);
    let zero = c.add_constant(value_state(0, 4), ConnectionType::BitVec(4));
    let mut wire = NodePort::new(zero, 0);
    c.append_signal(&mut wire);
    connect(&mut c, (reg, REG_RESET_VALUE), (wire.node, 0));
    c.check_export_invariants().unwrap();
}

#[test]
fn derived_clocks_share_pins_and_merge_reset_holds() {
    let mut c = Circuit::new();
    let root = c.create_root_clock("clk", mhz(100));
    c.clock_mut(root).raise_min_reset_cycles(2);
    let same = c.create_derived_clock(root, rational(1, 1));
    c.clock_mut(same).raise_min_reset_cycles(5);
    let half = c.create_derived_clock(root, rational(1, 2));
    c.clock_mut(half).name = "clk_div2".into();

    // One register per clock keeps all three relevant.
    for clock in [root, same, half] {
        let reg = c.add_register(clock);
        let zero = c.add_constant(bit_state(false), ConnectionType::Bool);
        connect(&mut c, (reg, REG_RESET_VALUE), (zero, 0));
        connect(&mut c, (reg, REG_DATA), (reg, 0));
        keepalive_signal(&mut c, "state", NodePort::new(reg, 0));
    }

    let subnet = Subnet::all(&c);
    let pins = crate::clock::allocate_clock_pins(&c, &subnet);

    // Root and its same-frequency, same-name derivative share one pin.
    assert_eq!(pins.clock_pins.len(), 2);
    assert_eq!(pins.clock_to_pin[&root], pins.clock_to_pin[&same]);
    assert_ne!(pins.clock_to_pin[&root], pins.clock_to_pin[&half]);

    // Reset hold is merged by maximum over the sharers.
    let reset_pin = pins.clock_to_reset_pin[&root];
    assert_eq!(pins.reset_pins[reset_pin].min_reset_cycles, 5);
}

#[test]
fn processes_fork_join_and_watch_changes() {
    let mut c = Circuit::new();
    let p = c.add_pin(PinDirection::Input);
    c.node_mut(p).output_mut(0).ty = ConnectionType::Bool;
    let not = c.add_logic(LogicOp::Not);
    connect(&mut c, (not, 0), (p, 0));
    let out = keepalive_signal(&mut c, "inverted", NodePort::new(not, 0));

    let observed: Rc<Cell<Option<u64>>> = Rc::new(Cell::new(None));
    let finished: Rc<Cell<bool>> = Rc::new(Cell::new(false));

    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    {
        let observed = observed.clone();
        let finished = finished.clone();
        sim.add_simulation_process(move |h| {
            let observed = observed.clone();
            let finished = finished.clone();
            async move {
                h.set_pin(p, &bit_state(true));
                h.wait_stable().await;
                assert_eq!(h.sample_value(out), Some(0));

                let child = h.fork({
                    let observed = observed.clone();
                    move |h2| async move {
                        h2.wait_change(SensitivityList::new().with(out)).await;
                        observed.set(h2.sample_value(out));
                    }
                });

                h.wait_for(ns(10)).await;
                h.set_pin(p, &bit_state(false));
                child.await;
                finished.set(true);
            }
        });
    }
    sim.power_on();
    sim.advance(ns(50));

    assert_eq!(observed.get(), Some(1));
    assert!(finished.get());
}

#[test]
fn abort_tears_down_processes_with_shutdown_flag() {
    let (c, _clk, _out, _reg) = counter_circuit();
    let saw_shutdown: Rc<Cell<bool>> = Rc::new(Cell::new(false));

    struct Guard {
        handle: crate::simulator::SimHandle,
        saw_shutdown: Rc<Cell<bool>>,
    }
    impl Drop for Guard {
        fn drop(&mut self) {
            self.saw_shutdown.set(self.handle.simulation_is_shutting_down());
        }
    }

    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    {
        let saw_shutdown = saw_shutdown.clone();
        sim.add_simulation_process(move |h| {
            let saw_shutdown = saw_shutdown.clone();
            async move {
                let _guard = Guard { handle: h.clone(), saw_shutdown };
                loop {
                    h.wait_for(ns(10)).await;
                }
            }
        });
    }
    sim.power_on();
    sim.advance(ns(30));
    sim.abort();

    assert!(sim.abort_called());
    assert!(saw_shutdown.get());
}

#[test_case(LogicOp::And, 0b1100, 0b1010, 0b1000; "and")]
#[test_case(LogicOp::Or, 0b1100, 0b1010, 0b1110; "or")]
#[test_case(LogicOp::Xor, 0b1100, 0b1010, 0b0110; "xor")]
#[test_case(LogicOp::Nand, 0b1100, 0b1010, 0b0111; "nand")]
#[test_case(LogicOp::Nor, 0b1100, 0b1010, 0b0001; "nor")]
#[test_case(LogicOp::Xnor, 0b1100, 0b1010, 0b1001; "xnor")]
fn logic_ops_evaluate(op: LogicOp, a: u64, b: u64, expected: u64) {
    let mut c = Circuit::new();
    let ca = c.add_constant(value_state(a, 4), ConnectionType::BitVec(4));
    let cb = c.add_constant(value_state(b, 4), ConnectionType::BitVec(4));
    let gate = c.add_logic(op);
    connect(&mut c, (gate, 0), (ca, 0));
    connect(&mut c, (gate, 1), (cb, 0));
    let out = keepalive_signal(&mut c, "y", NodePort::new(gate, 0));

    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();
    assert_eq!(sim.value_of_output_u64(out), Some(expected));
}

#[test_case(CompareOp::Eq, 5, 5, true; "eq")]
#[test_case(CompareOp::Neq, 5, 4, true; "neq")]
#[test_case(CompareOp::Lt, 3, 5, true; "lt")]
#[test_case(CompareOp::Gt, 3, 5, false; "gt")]
#[test_case(CompareOp::Leq, 5, 5, true; "leq")]
#[test_case(CompareOp::Geq, 4, 5, false; "geq")]
fn compare_ops_evaluate(op: CompareOp, a: u64, b: u64, expected: bool) {
    let mut c = Circuit::new();
    let ca = c.add_constant(value_state(a, 4), ConnectionType::BitVec(4));
    let cb = c.add_constant(value_state(b, 4), ConnectionType::BitVec(4));
    let cmp = c.add_compare(op);
    connect(&mut c, (cmp, 0), (ca, 0));
    connect(&mut c, (cmp, 1), (cb, 0));
    let out = keepalive_signal(&mut c, "flag", NodePort::new(cmp, 0));

    let mut fixture = crate::simulator::SimFixture::compile(c).unwrap();
    fixture.eval();
    assert_eq!(fixture.value_u64(out), Some(expected as u64));
    fixture.expect_clean();
}

#[test]
fn vcd_records_counter_waveform() {
    let (c, _clk, _out, _reg) = counter_circuit();
    let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
    sim.power_on();

    let signals = crate::simulator::waveform::named_signals(&sim.program());
    assert!(signals.iter().any(|(_, name, _)| name == "count"));

    let mut buffer: Vec<u8> = Vec::new();
    let mut vcd = crate::simulator::VcdWriter::new(&mut buffer, signals).unwrap();
    for _ in 0..3 {
        let time_ps = (sim.current_time() * 1_000_000_000_000u64).to_integer();
        vcd.dump(time_ps, |port| sim.value_of_output(port)).unwrap();
        sim.advance(ns(10));
    }

    let text = String::from_utf8(buffer).unwrap();
    assert!(text.contains("$var wire 4"));
    assert!(text.contains("b0000"));
    assert!(text.contains("b0001"));
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn direct_arith(op: ArithOp, a: u64, b: u64, width: usize) -> Option<u64> {
        let mask = (1u64 << width) - 1;
        Some(match op {
            ArithOp::Add => (a + b) & mask,
            ArithOp::Sub => a.wrapping_sub(b) & mask,
            ArithOp::Mul => (a * b) & mask,
            ArithOp::Div => {
                if b == 0 {
                    return None;
                }
                a / b
            }
            ArithOp::Rem => {
                if b == 0 {
                    return None;
                }
                a % b
            }
        })
    }

    proptest! {
        /// Constant folding replaces a fully constant arithmetic node with
        /// a constant equal to direct evaluation; division by zero stays
        /// unfolded (its result is undefined).
        #[test]
        fn constant_folding_is_sound(a in 0u64..256, b in 0u64..256, op_idx in 0usize..5) {
            let op = [ArithOp::Add, ArithOp::Sub, ArithOp::Mul, ArithOp::Div, ArithOp::Rem][op_idx];
            let mut c = Circuit::new();
            let ca = c.add_constant(value_state(a, 8), ConnectionType::BitVec(8));
            let cb = c.add_constant(value_state(b, 8), ConnectionType::BitVec(8));
            let node = c.add_arithmetic(op);
            connect(&mut c, (node, 0), (ca, 0));
            connect(&mut c, (node, 1), (cb, 0));
            let out = keepalive_signal(&mut c, "result", NodePort::new(node, 0));

            optimizer::optimize(&mut c, 3).unwrap();

            let resolved = c.non_signal_driver(out).unwrap();
            match direct_arith(op, a, b, 8) {
                Some(expected) => match &c.node(resolved.node).kind {
                    NodeKind::Constant { value, .. } => {
                        prop_assert_eq!(value.extract(Plane::Value, 0, 8), expected);
                    }
                    other => prop_assert!(false, "expected constant, got {:?}", other),
                },
                None => {
                    // Undefined result: the node must not be folded away.
                    prop_assert!(matches!(c.node(resolved.node).kind, NodeKind::Arithmetic(_)));
                }
            }
        }

        /// Direct interpretation and the compiled simulator agree on
        /// combinational arithmetic.
        #[test]
        fn simulator_matches_direct_eval(a in 0u64..256, b in 1u64..256) {
            let mut c = Circuit::new();
            let ca = c.add_constant(value_state(a, 8), ConnectionType::BitVec(8));
            let cb = c.add_constant(value_state(b, 8), ConnectionType::BitVec(8));
            let add = c.add_arithmetic(ArithOp::Add);
            connect(&mut c, (add, 0), (ca, 0));
            connect(&mut c, (add, 1), (cb, 0));
            let rem = c.add_arithmetic(ArithOp::Rem);
            connect(&mut c, (rem, 0), (add, 0));
            connect(&mut c, (rem, 1), (cb, 0));
            let out = keepalive_signal(&mut c, "out", NodePort::new(rem, 0));

            let mut sim = ReferenceSimulator::compile(c, &[]).unwrap();
            sim.power_on();
            prop_assert_eq!(sim.value_of_output_u64(out), Some(((a + b) & 0xff) % b));
        }
    }
}
