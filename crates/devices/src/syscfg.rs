//! System configuration controller: the interrupt-source multiplexer.
//!
//! Input lines are numbered `port * 16 + pin`. EXTICR1..4 pack one 4-bit port selector per pin
//! index; a transition is forwarded to output line `pin` only when the selector for that index
//! names the transitioning port, so at most one port per pin index ever reaches the edge latch.

use mcusim_interrupts::{IrqLine, IrqSink};
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{
    check_access, MmioDevice, MmioError, RegisterFile, RegisterSpec, GUEST_ERROR, UNIMP,
};

use crate::gpio::{PortId, GPIO_PINS};

pub const SYSCFG_MMIO_SIZE: u64 = 0x400;

const REG_MEMRMP: u64 = 0x00;
const REG_PMC: u64 = 0x04;
const REG_EXTICR1: u64 = 0x08;
const REG_CMPCR: u64 = 0x20;

const IDX_MEMRMP: usize = 0;
const IDX_PMC: usize = 1;
const IDX_EXTICR1: usize = 2;
const IDX_CMPCR: usize = 6;

const CMPCR_CMP_PD: u32 = 1 << 0;
const CMPCR_READY: u32 = 1 << 8;

static SYSCFG_REGS: &[RegisterSpec] = &[
    RegisterSpec::rw("MEMRMP", REG_MEMRMP, 0, 0x0000_0003),
    RegisterSpec::rw("PMC", REG_PMC, 0, 0x0080_0000),
    RegisterSpec::rw("EXTICR1", REG_EXTICR1, 0, 0x0000_FFFF),
    RegisterSpec::rw("EXTICR2", 0x0C, 0, 0x0000_FFFF),
    RegisterSpec::rw("EXTICR3", 0x10, 0, 0x0000_FFFF),
    RegisterSpec::rw("EXTICR4", 0x14, 0, 0x0000_FFFF),
    RegisterSpec::rw("CMPCR", REG_CMPCR, 0, CMPCR_CMP_PD),
];

#[derive(Debug)]
pub struct Syscfg {
    regs: RegisterFile,
    outputs: [IrqLine; GPIO_PINS],
}

impl Default for Syscfg {
    fn default() -> Self {
        Self::new()
    }
}

impl Syscfg {
    pub fn new() -> Self {
        Self {
            regs: RegisterFile::new("SYSCFG", SYSCFG_REGS),
            outputs: std::array::from_fn(|_| IrqLine::disconnected()),
        }
    }

    /// Input line number for `pin` of `port`.
    pub fn input_line(port: PortId, pin: usize) -> u32 {
        port.index() * GPIO_PINS as u32 + pin as u32
    }

    pub fn connect_output(&mut self, pin: usize, line: IrqLine) {
        let Some(slot) = self.outputs.get_mut(pin) else {
            tracing::warn!("multiplexer output {pin} out of range, not connected");
            return;
        };
        *slot = line;
    }

    fn selector(&self, pin: usize) -> u32 {
        let exticr = self.regs.get(IDX_EXTICR1 + pin / 4);
        (exticr >> ((pin % 4) * 4)) & 0xF
    }

    /// Port currently routed to edge-latch line `pin`, if the selector names a real port.
    pub fn selected_port(&self, pin: usize) -> Option<PortId> {
        PortId::from_index(self.selector(pin))
    }

    fn write_reg(&mut self, offset: u64, size: usize, value: u32) {
        let Some(w) = self.regs.write(offset, size, value) else {
            return;
        };
        match w.index {
            IDX_MEMRMP if w.old != w.new => {
                tracing::warn!(target: UNIMP, "SYSCFG memory remap {:#x} not modeled", w.new);
            }
            IDX_PMC if w.old != w.new => {
                tracing::warn!(target: UNIMP, "SYSCFG peripheral mode {:#x} not modeled", w.new);
            }
            IDX_CMPCR => {
                // The compensation cell settles instantly.
                let ready = if w.new & CMPCR_CMP_PD != 0 { CMPCR_READY } else { 0 };
                self.regs.set(IDX_CMPCR, (w.new & CMPCR_CMP_PD) | ready);
            }
            _ => {}
        }
    }
}

impl MmioDevice for Syscfg {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        check_access(SYSCFG_MMIO_SIZE, offset, size)?;
        let value = self.regs.read(offset, size).unwrap_or_else(|| {
            tracing::warn!(target: GUEST_ERROR, "SYSCFG read of reserved offset {offset:#x}");
            0
        });
        Ok(u64::from(value))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        check_access(SYSCFG_MMIO_SIZE, offset, size)?;
        self.write_reg(offset, size, value as u32);
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
    }
}

impl IrqSink for Syscfg {
    fn set_irq(&mut self, line: u32, level: bool) {
        let port = line / GPIO_PINS as u32;
        let pin = (line % GPIO_PINS as u32) as usize;
        if self.selector(pin) != port {
            return;
        }
        tracing::trace!(port, pin, level, "exti source transition");
        self.outputs[pin].set_level(level);
    }
}

impl IoSnapshot for Syscfg {
    const DEVICE_ID: [u8; 4] = *b"SYSC";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_REGS: u16 = 1;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_REGS, self.regs.save());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_REGS: u16 = 1;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        self.regs.reset();
        if let Some(buf) = r.bytes(TAG_REGS) {
            self.regs.load(buf)?;
        }
        Ok(())
    }
}
