use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::HashMap;
use crate::node::NodePort;
use crate::state::{BitVecState, Plane};

use super::program::Program;

/// Streams named signals of a simulation into a VCD file. Values are
/// captured through [`VcdWriter::dump`] at every committed timestamp; only
/// changed signals are emitted.
pub struct VcdWriter<W: Write> {
    writer: W,
    signals: Vec<(NodePort, String, usize)>,
    id_map: HashMap<NodePort, String>,
    last_values: HashMap<NodePort, BitVecState>,
    timestamp: u64,
}

impl VcdWriter<BufWriter<File>> {
    /// Records all named signal nodes of the program into `path`.
    pub fn create<P: AsRef<Path>>(path: P, program: &Program) -> io::Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), named_signals(program))
    }
}

/// All named signal nodes of the compiled subnet, sorted by name.
pub fn named_signals(program: &Program) -> Vec<(NodePort, String, usize)> {
    let mut signals: Vec<(NodePort, String, usize)> = program
        .subnet
        .iter()
        .map(|id| program.circuit.node(id))
        .filter(|n| n.is_signal() && !n.name.is_empty())
        .map(|n| (NodePort::new(n.id, 0), n.name.clone(), n.output(0).ty.width()))
        .collect();
    signals.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    signals
}

impl<W: Write> VcdWriter<W> {
    pub fn new(mut writer: W, signals: Vec<(NodePort, String, usize)>) -> io::Result<Self> {
        let mut id_map = HashMap::default();

        writeln!(writer, "$version")?;
        writeln!(writer, "  weft")?;
        writeln!(writer, "$end")?;
        writeln!(writer, "$timescale 1ps $end")?;
        writeln!(writer, "$scope module top $end")?;
        for (index, (port, name, width)) in signals.iter().enumerate() {
            let vcd_id = generate_vcd_id(index);
            writeln!(writer, "$var wire {} {} {} $end", width, vcd_id, name)?;
            id_map.insert(*port, vcd_id);
        }
        writeln!(writer, "$upscope $end")?;
        writeln!(writer, "$enddefinitions $end")?;
        writeln!(writer, "$dumpvars")?;
        writeln!(writer, "$end")?;

        Ok(Self {
            writer,
            signals,
            id_map,
            last_values: HashMap::default(),
            timestamp: 0,
        })
    }

    /// Writes the state of all changed signals at the given timestamp (in
    /// the file's timescale units).
    pub fn dump(
        &mut self,
        timestamp: u64,
        mut get_value: impl FnMut(NodePort) -> BitVecState,
    ) -> io::Result<()> {
        if timestamp > self.timestamp || timestamp == 0 {
            writeln!(self.writer, "#{}", timestamp)?;
            self.timestamp = timestamp;
        }

        for (port, _, width) in &self.signals {
            let current = get_value(*port);
            if self.last_values.get(port) == Some(&current) {
                continue;
            }
            let vcd_id = &self.id_map[port];
            if *width == 1 {
                writeln!(self.writer, "{}{}", format_bit(&current, 0), vcd_id)?;
            } else {
                let mut bits = String::with_capacity(*width);
                for b in (0..*width).rev() {
                    bits.push(format_bit(&current, b));
                }
                writeln!(self.writer, "b{} {}", bits, vcd_id)?;
            }
            self.last_values.insert(*port, current);
        }
        self.writer.flush()
    }
}

fn format_bit(state: &BitVecState, bit: usize) -> char {
    if bit >= state.size() || !state.get(Plane::Defined, bit) {
        'x'
    } else if state.get(Plane::Value, bit) {
        '1'
    } else {
        '0'
    }
}

fn generate_vcd_id(num: usize) -> String {
    let mut id = String::new();
    let mut n = num;
    loop {
        let c = ((n % 94) + 33) as u8 as char;
        id.push(c);
        if n < 94 {
            break;
        }
        n = (n / 94) - 1;
    }
    id.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{undefined_state, value_state};

    #[test]
    fn header_and_changes() {
        let mut values: Vec<BitVecState> = vec![value_state(5, 4)];
        let signals = vec![(NodePort::new(crate::node::NodeId(0), 0), "counter".into(), 4)];
        let mut out: Vec<u8> = Vec::new();
        {
            let mut vcd = VcdWriter::new(&mut out, signals).unwrap();
            vcd.dump(0, |_| values[0].clone()).unwrap();
            // unchanged: no new change record
            vcd.dump(10, |_| values[0].clone()).unwrap();
            values[0] = value_state(6, 4);
            vcd.dump(20, |_| values[0].clone()).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("$var wire 4 ! counter $end"));
        assert!(text.contains("b0101 !"));
        assert!(text.contains("b0110 !"));
        assert_eq!(text.matches("b0101").count(), 1);
    }

    #[test]
    fn undefined_bits_render_as_x() {
        let signals = vec![(NodePort::new(crate::node::NodeId(0), 0), "bus".into(), 3)];
        let mut out: Vec<u8> = Vec::new();
        {
            let mut vcd = VcdWriter::new(&mut out, signals).unwrap();
            vcd.dump(0, |_| undefined_state(3)).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("bxxx !"));
    }
}
