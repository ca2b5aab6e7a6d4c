//! External interrupt/event controller: the edge/mask latch.
//!
//! Every [`IrqSink::set_irq`] call is one transition of the routed source (`true` = rising).
//! A configured edge latches the pending bit; the interrupt-controller line is pulsed only if
//! the line is unmasked in IMR at that moment. Unmasking later does not replay the edge.

use mcusim_interrupts::{IrqLine, IrqSink};
use mcusim_io_snapshot::codec::{Decoder, Encoder};
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{
    check_access, MmioDevice, MmioError, RegisterFile, RegisterSpec, GUEST_ERROR,
};

pub const EXTI_MMIO_SIZE: u64 = 0x400;
pub const EXTI_LINES: usize = 23;

const LINE_MASK: u32 = (1 << EXTI_LINES) - 1;

const REG_IMR: u64 = 0x00;
const REG_EMR: u64 = 0x04;
const REG_RTSR: u64 = 0x08;
const REG_FTSR: u64 = 0x0C;
const REG_SWIER: u64 = 0x10;
const REG_PR: u64 = 0x14;

const IDX_IMR: usize = 0;
const IDX_EMR: usize = 1;
const IDX_RTSR: usize = 2;
const IDX_FTSR: usize = 3;
const IDX_SWIER: usize = 4;
const IDX_PR: usize = 5;

static EXTI_REGS: &[RegisterSpec] = &[
    RegisterSpec::rw("IMR", REG_IMR, 0, LINE_MASK),
    RegisterSpec::rw("EMR", REG_EMR, 0, LINE_MASK),
    RegisterSpec::rw("RTSR", REG_RTSR, 0, LINE_MASK),
    RegisterSpec::rw("FTSR", REG_FTSR, 0, LINE_MASK),
    RegisterSpec::rw("SWIER", REG_SWIER, 0, LINE_MASK),
    RegisterSpec::w1c("PR", REG_PR, 0, LINE_MASK),
];

#[derive(Debug)]
pub struct Exti {
    regs: RegisterFile,
    events: [u64; EXTI_LINES],
    outputs: [IrqLine; EXTI_LINES],
}

impl Default for Exti {
    fn default() -> Self {
        Self::new()
    }
}

impl Exti {
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::new("EXTI", EXTI_REGS),
            events: [0; EXTI_LINES],
            outputs: std::array::from_fn(|_| IrqLine::disconnected()),
        }
    }

    pub fn connect_output(&mut self, line: usize, irq: IrqLine) {
        let Some(slot) = self.outputs.get_mut(line) else {
            tracing::warn!("edge latch line {line} out of range, not connected");
            return;
        };
        *slot = irq;
    }

    pub fn pending(&self) -> u32 {
        self.regs.get(IDX_PR)
    }

    /// Number of unmasked wake-up events seen on `line` (EMR path).
    pub fn event_count(&self, line: usize) -> u64 {
        self.events.get(line).copied().unwrap_or(0)
    }

    fn trigger(&mut self, line: usize) {
        let bit = 1u32 << line;
        self.regs.set(IDX_PR, self.regs.get(IDX_PR) | bit);
        if self.regs.get(IDX_EMR) & bit != 0 {
            self.events[line] += 1;
        }
        if self.regs.get(IDX_IMR) & bit != 0 {
            tracing::trace!(line, "exti pulse");
            self.outputs[line].pulse();
        }
    }

    fn write_reg(&mut self, offset: u64, size: usize, value: u32) {
        let Some(w) = self.regs.write(offset, size, value) else {
            return;
        };
        match w.index {
            IDX_SWIER => {
                let raised = w.new & !w.old;
                for line in 0..EXTI_LINES {
                    if raised & (1 << line) != 0 {
                        self.trigger(line);
                    }
                }
            }
            IDX_PR => {
                let cleared = w.old & !w.new;
                self.regs
                    .set(IDX_SWIER, self.regs.get(IDX_SWIER) & !cleared);
            }
            _ => {}
        }
    }
}

impl MmioDevice for Exti {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        check_access(EXTI_MMIO_SIZE, offset, size)?;
        let value = self.regs.read(offset, size).unwrap_or_else(|| {
            tracing::warn!(target: GUEST_ERROR, "EXTI read of reserved offset {offset:#x}");
            0
        });
        Ok(u64::from(value))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        check_access(EXTI_MMIO_SIZE, offset, size)?;
        self.write_reg(offset, size, value as u32);
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.events = [0; EXTI_LINES];
    }
}

impl IrqSink for Exti {
    fn set_irq(&mut self, line: u32, level: bool) {
        let line = line as usize;
        if line >= EXTI_LINES {
            tracing::warn!(target: GUEST_ERROR, "EXTI input {line} out of range");
            return;
        }
        let trigger_reg = if level { IDX_RTSR } else { IDX_FTSR };
        if self.regs.get(trigger_reg) & (1 << line) != 0 {
            self.trigger(line);
        }
    }
}

impl IoSnapshot for Exti {
    const DEVICE_ID: [u8; 4] = *b"EXTI";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_REGS: u16 = 1;
        const TAG_EVENTS: u16 = 2;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_REGS, self.regs.save());
        let events = self
            .events
            .iter()
            .fold(Encoder::new().u32(EXTI_LINES as u32), |e, &n| e.u64(n));
        w.field_bytes(TAG_EVENTS, events.finish());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_REGS: u16 = 1;
        const TAG_EVENTS: u16 = 2;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        self.reset();
        if let Some(buf) = r.bytes(TAG_REGS) {
            self.regs.load(buf)?;
        }
        if let Some(buf) = r.bytes(TAG_EVENTS) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > EXTI_LINES {
                return Err(SnapshotError::InvalidFieldEncoding("too many exti lines"));
            }
            for slot in self.events.iter_mut().take(count) {
                *slot = d.u64()?;
            }
            d.finish()?;
        }
        Ok(())
    }
}
