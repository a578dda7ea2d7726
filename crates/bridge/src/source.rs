//! Variable Sources
//!
//! The boundary to the field-bus driver. A source is polled from the
//! real-time thread and hands out borrowed samples, so polling must not
//! block or allocate.

use std::sync::Arc;

use wire_protocol::{timestamp_us, DataType};

use crate::registry::{VariableHandle, VariableRegistry};

/// One changed value delivered by a source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Notification<'a> {
    pub handle: VariableHandle,
    pub name: &'a str,
    pub data_type: DataType,
    pub value: &'a [u8],
    /// Capture time in microseconds
    pub timestamp_us: u64,
}

/// Something that produces variable notifications
pub trait VariableSource: Send {
    fn name(&self) -> &str;

    /// Deliver all notifications pending since the last poll
    ///
    /// Returns how many were delivered.
    fn poll(&mut self, sink: &mut dyn FnMut(Notification<'_>)) -> usize;
}

/// Source producing synthetic values for every registered variable
///
/// Values change every emission: booleans toggle, numbers count up,
/// strings and custom values are filled with a rolling byte pattern.
pub struct SimulatedSource {
    name: String,
    registry: Arc<VariableRegistry>,
    every_cycles: u32,
    cycle: u64,
    scratch: Vec<u8>,
}

impl SimulatedSource {
    /// Emit every variable once per `every_cycles` polls
    pub fn new(name: &str, registry: Arc<VariableRegistry>, every_cycles: u32) -> Self {
        let largest = registry.iter().map(|v| v.size).max().unwrap_or(0);
        Self {
            name: name.to_string(),
            registry,
            every_cycles: every_cycles.max(1),
            cycle: 0,
            scratch: Vec::with_capacity(largest),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

/// Encode the synthetic value for `tick` into `out`
fn synthesize(data_type: DataType, size: usize, tick: u64, out: &mut Vec<u8>) {
    out.clear();
    match data_type {
        DataType::Bool => out.push((tick % 2) as u8),
        DataType::UInt8 => out.push(tick as u8),
        DataType::UInt16 => out.extend_from_slice(&(tick as u16).to_le_bytes()),
        DataType::UInt32 => out.extend_from_slice(&(tick as u32).to_le_bytes()),
        DataType::Int16 => out.extend_from_slice(&(tick as i16).to_le_bytes()),
        DataType::Int32 => out.extend_from_slice(&(tick as i32).to_le_bytes()),
        DataType::Int64 => out.extend_from_slice(&(tick as i64).to_le_bytes()),
        DataType::Real32 => out.extend_from_slice(&(20.0f32 + (tick % 100) as f32 * 0.1).to_le_bytes()),
        DataType::Real64 => out.extend_from_slice(&(1.0f64 + (tick % 1000) as f64 * 0.001).to_le_bytes()),
        DataType::String | DataType::Custom => {
            out.extend((0..size).map(|i| b'a' + ((tick as usize + i) % 26) as u8));
        }
    }
}

impl VariableSource for SimulatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, sink: &mut dyn FnMut(Notification<'_>)) -> usize {
        self.cycle += 1;
        if self.cycle % u64::from(self.every_cycles) != 0 {
            return 0;
        }

        let tick = self.cycle / u64::from(self.every_cycles);
        let now = timestamp_us();
        let mut delivered = 0;
        for variable in self.registry.iter() {
            synthesize(variable.data_type, variable.size, tick, &mut self.scratch);
            sink(Notification {
                handle: variable.handle,
                name: &variable.name,
                data_type: variable.data_type,
                value: &self.scratch,
                timestamp_us: now,
            });
            delivered += 1;
        }
        delivered
    }
}
