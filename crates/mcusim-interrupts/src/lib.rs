//! Interrupt line plumbing shared by the peripheral models.
//!
//! Peripherals never own the interrupt controller. They hold [`IrqLine`] handles that were wired
//! up by the machine at construction time and drive them as levels or pulses. The receiving end
//! is anything implementing [`IrqSink`]: the interrupt-source multiplexer, the edge latch, or the
//! interrupt controller stand-in ([`IrqRecorder`]).

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

pub trait IrqSink {
    fn set_irq(&mut self, line: u32, level: bool);

    fn raise_irq(&mut self, line: u32) {
        self.set_irq(line, true);
    }

    fn lower_irq(&mut self, line: u32) {
        self.set_irq(line, false);
    }

    /// Momentary assert-then-deassert.
    fn pulse_irq(&mut self, line: u32) {
        self.raise_irq(line);
        self.lower_irq(line);
    }
}

pub type SharedIrqSink = Rc<RefCell<dyn IrqSink>>;

/// One numbered output line of a device, bound to a sink.
///
/// A disconnected line silently drops every update, which lets devices be unit tested without
/// wiring.
#[derive(Clone, Default)]
pub struct IrqLine {
    sink: Option<SharedIrqSink>,
    line: u32,
}

impl IrqLine {
    pub fn new(sink: SharedIrqSink, line: u32) -> Self {
        Self {
            sink: Some(sink),
            line,
        }
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    pub fn set_level(&self, level: bool) {
        if let Some(sink) = &self.sink {
            sink.borrow_mut().set_irq(self.line, level);
        }
    }

    pub fn raise(&self) {
        self.set_level(true);
    }

    pub fn lower(&self) {
        self.set_level(false);
    }

    pub fn pulse(&self) {
        if let Some(sink) = &self.sink {
            sink.borrow_mut().pulse_irq(self.line);
        }
    }
}

impl fmt::Debug for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqLine")
            .field("line", &self.line)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    Raise(u32),
    Lower(u32),
}

/// Interrupt controller stand-in that records every line transition.
///
/// Priority and vector resolution are out of scope; this only tracks which numbered inputs are
/// asserted and how often each one went high.
#[derive(Debug, Default)]
pub struct IrqRecorder {
    asserted: BTreeSet<u32>,
    events: Vec<IrqEvent>,
    pulses: BTreeMap<u32, u64>,
}

impl IrqRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn is_asserted(&self, line: u32) -> bool {
        self.asserted.contains(&line)
    }

    /// Number of low-to-high transitions seen on `line`.
    pub fn pulse_count(&self, line: u32) -> u64 {
        self.pulses.get(&line).copied().unwrap_or(0)
    }

    pub fn events(&self) -> &[IrqEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<IrqEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn clear(&mut self) {
        self.asserted.clear();
        self.events.clear();
        self.pulses.clear();
    }
}

impl IrqSink for IrqRecorder {
    fn set_irq(&mut self, line: u32, level: bool) {
        if level {
            if self.asserted.insert(line) {
                *self.pulses.entry(line).or_default() += 1;
                tracing::trace!(line, "irq raised");
            }
            self.events.push(IrqEvent::Raise(line));
        } else {
            self.asserted.remove(&line);
            self.events.push(IrqEvent::Lower(line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_is_recorded_as_raise_then_lower() {
        let rec = IrqRecorder::new_shared();
        let line = IrqLine::new(rec.clone(), 23);

        line.pulse();

        let rec = rec.borrow();
        assert!(!rec.is_asserted(23));
        assert_eq!(rec.pulse_count(23), 1);
        assert_eq!(rec.events(), &[IrqEvent::Raise(23), IrqEvent::Lower(23)]);
    }

    #[test]
    fn held_level_counts_once() {
        let rec = IrqRecorder::new_shared();
        let line = IrqLine::new(rec.clone(), 5);

        line.raise();
        line.raise();
        assert!(rec.borrow().is_asserted(5));
        line.lower();
        line.raise();

        assert_eq!(rec.borrow().pulse_count(5), 2);
    }

    #[test]
    fn disconnected_line_is_a_no_op() {
        let line = IrqLine::disconnected();
        assert!(!line.is_connected());
        line.pulse();
        line.set_level(true);
    }
}
