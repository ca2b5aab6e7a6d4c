//! STM32F4 SPI in master mode.
//!
//! No FIFO and no bit clock: a DR write with SPE set exchanges one frame with the bus and the
//! reply is immediately available in DR. Chip-select inputs arrive as active-low lines through
//! [`IrqSink`], one per attached peripheral slot.

use bitflags::bitflags;
use mcusim_interrupts::{IrqLine, IrqSink};
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{
    check_access, MmioDevice, MmioError, RegisterFile, RegisterSpec, GUEST_ERROR, UNIMP,
};

use super::{reverse_bits, SsiBus, SsiPeripheral};

pub const STM32_SPI_MMIO_SIZE: u64 = 0x400;

const REG_CR1: u64 = 0x00;
const REG_CR2: u64 = 0x04;
const REG_SR: u64 = 0x08;
const REG_DR: u64 = 0x0C;
const REG_CRCPR: u64 = 0x10;
const REG_RXCRCR: u64 = 0x14;
const REG_TXCRCR: u64 = 0x18;
const REG_I2SCFGR: u64 = 0x1C;
const REG_I2SPR: u64 = 0x20;

const IDX_CR1: usize = 0;
const IDX_CR2: usize = 1;
const IDX_SR: usize = 2;
const IDX_DR: usize = 3;
const IDX_CRCPR: usize = 4;
const IDX_I2SCFGR: usize = 7;
const IDX_I2SPR: usize = 8;

static SPI_REGS: &[RegisterSpec] = &[
    RegisterSpec::rw("CR1", REG_CR1, 0, 0x0000_FFFF),
    RegisterSpec::rw("CR2", REG_CR2, 0, 0x0000_00F7),
    RegisterSpec::ro("SR", REG_SR, 0x0000_000A),
    RegisterSpec::rw("DR", REG_DR, 0, 0x0000_FFFF),
    RegisterSpec::rw("CRCPR", REG_CRCPR, 0x0000_0007, 0x0000_FFFF),
    RegisterSpec::ro("RXCRCR", REG_RXCRCR, 0),
    RegisterSpec::ro("TXCRCR", REG_TXCRCR, 0),
    RegisterSpec::rw("I2SCFGR", REG_I2SCFGR, 0, 0x0000_0FBF),
    RegisterSpec::rw("I2SPR", REG_I2SPR, 0x0000_0002, 0x0000_03FF),
];

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Cr1: u32 {
        const MSTR = 1 << 2;
        const SPE = 1 << 6;
        const LSBFIRST = 1 << 7;
        const DFF = 1 << 11;
        const CRCEN = 1 << 13;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Cr2: u32 {
        const RXDMAEN = 1 << 0;
        const TXDMAEN = 1 << 1;
        const ERRIE = 1 << 5;
        const RXNEIE = 1 << 6;
        const TXEIE = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Sr: u32 {
        const RXNE = 1 << 0;
        const TXE = 1 << 1;
        const OVR = 1 << 6;
        const BSY = 1 << 7;
    }
}

pub struct Stm32Spi {
    name: &'static str,
    regs: RegisterFile,
    bus: SsiBus,
    irq: IrqLine,
}

impl std::fmt::Debug for Stm32Spi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm32Spi")
            .field("name", &self.name)
            .field("regs", &self.regs)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Stm32Spi {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            regs: RegisterFile::new(name, SPI_REGS),
            bus: SsiBus::new(),
            irq: IrqLine::disconnected(),
        }
    }

    pub fn connect_irq(&mut self, irq: IrqLine) {
        self.irq = irq;
    }

    /// Attaches a peripheral; it stays deselected until its chip-select line is driven low.
    pub fn attach(&mut self, device: Box<dyn SsiPeripheral>) -> usize {
        self.bus.attach(device)
    }

    pub fn select(&mut self, slot: usize, selected: bool) {
        self.bus.set_selected(slot, selected);
    }

    fn sr(&self) -> Sr {
        Sr::from_bits_truncate(self.regs.get(IDX_SR))
    }

    fn set_sr(&mut self, sr: Sr) {
        let reserved = self.regs.get(IDX_SR) & !Sr::all().bits();
        self.regs.set(IDX_SR, reserved | sr.bits());
    }

    fn update_irq(&self) {
        let sr = self.sr();
        let cr2 = Cr2::from_bits_truncate(self.regs.get(IDX_CR2));
        let level = (sr.contains(Sr::RXNE) && cr2.contains(Cr2::RXNEIE))
            || (sr.contains(Sr::TXE) && cr2.contains(Cr2::TXEIE))
            || (sr.contains(Sr::OVR) && cr2.contains(Cr2::ERRIE));
        self.irq.set_level(level);
    }

    fn transmit(&mut self, value: u32) {
        let cr1 = Cr1::from_bits_truncate(self.regs.get(IDX_CR1));
        if !cr1.contains(Cr1::SPE) {
            tracing::warn!(
                target: GUEST_ERROR,
                spi = self.name,
                "DR write {value:#x} with SPE clear dropped"
            );
            return;
        }
        if !cr1.contains(Cr1::MSTR) {
            tracing::warn!(target: UNIMP, spi = self.name, "slave mode not modeled; acting as master");
        }

        let bits = if cr1.contains(Cr1::DFF) { 16 } else { 8 };
        let mask = (1u32 << bits) - 1;
        let msb_first = !cr1.contains(Cr1::LSBFIRST);

        let mut tx = value & mask;
        if msb_first {
            tx = reverse_bits(tx, bits);
        }
        let mut rx = self.bus.transfer(tx) & mask;
        if msb_first {
            rx = reverse_bits(rx, bits);
        }
        tracing::trace!(spi = self.name, tx, rx, "spi exchange");

        let mut sr = self.sr() - Sr::BSY;
        if sr.contains(Sr::RXNE) {
            tracing::warn!(target: GUEST_ERROR, spi = self.name, "receive overrun");
            sr |= Sr::OVR;
        }
        self.set_sr(sr | Sr::RXNE | Sr::TXE);
        self.regs.set(IDX_DR, rx);
    }

    fn write_reg(&mut self, offset: u64, size: usize, value: u32) {
        // DR holds the received frame; the written value goes straight to the shifter.
        if self.regs.index_of(offset & !3) == Some(IDX_DR) {
            self.transmit(value & 0xFFFF);
            self.update_irq();
            return;
        }

        let Some(w) = self.regs.write(offset, size, value) else {
            return;
        };
        match w.index {
            IDX_CR1 if Cr1::from_bits_truncate(w.new).contains(Cr1::CRCEN) => {
                tracing::warn!(target: UNIMP, spi = self.name, "hardware CRC not modeled");
            }
            IDX_CR2 => {
                if Cr2::from_bits_truncate(w.new).intersects(Cr2::RXDMAEN | Cr2::TXDMAEN) {
                    tracing::warn!(target: UNIMP, spi = self.name, "SPI DMA requests not modeled");
                }
            }
            IDX_CRCPR => {
                tracing::warn!(target: UNIMP, spi = self.name, "CRC polynomial stored but unused");
            }
            IDX_I2SCFGR | IDX_I2SPR => {
                tracing::warn!(target: UNIMP, spi = self.name, "I2S mode not modeled");
            }
            _ => {}
        }
        self.update_irq();
    }

    fn read_reg(&mut self, offset: u64, size: usize) -> u32 {
        let Some(value) = self.regs.read(offset, size) else {
            tracing::warn!(
                target: GUEST_ERROR,
                spi = self.name,
                "read of reserved offset {offset:#x}"
            );
            return 0;
        };
        if self.regs.index_of(offset & !3) == Some(IDX_DR) {
            let sr = self.sr() - Sr::RXNE - Sr::OVR;
            self.set_sr(sr);
            self.update_irq();
        }
        value
    }
}

impl MmioDevice for Stm32Spi {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        check_access(STM32_SPI_MMIO_SIZE, offset, size)?;
        Ok(u64::from(self.read_reg(offset, size)))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        check_access(STM32_SPI_MMIO_SIZE, offset, size)?;
        self.write_reg(offset, size, value as u32);
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.update_irq();
    }
}

impl IrqSink for Stm32Spi {
    /// Active-low chip-select input for slot `line`.
    fn set_irq(&mut self, line: u32, level: bool) {
        self.bus.set_selected(line as usize, !level);
    }
}

impl IoSnapshot for Stm32Spi {
    const DEVICE_ID: [u8; 4] = *b"SPIS";
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
        self.update_irq();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::testing::InvertingEcho;
    use mcusim_interrupts::IrqRecorder;
    use std::cell::RefCell;
    use std::rc::Rc;

    const SPE_MASTER: u64 = (1 << 6) | (1 << 2);

    fn spi_with_echo() -> (Stm32Spi, Rc<RefCell<InvertingEcho>>) {
        let echo = Rc::new(RefCell::new(InvertingEcho::new(16)));
        let mut spi = Stm32Spi::new("SPI1");
        let slot = spi.attach(Box::new(echo.clone()));
        spi.set_irq(slot as u32, false);
        (spi, echo)
    }

    #[test]
    fn reset_values() {
        let mut spi = Stm32Spi::new("SPI1");
        assert_eq!(spi.read(REG_SR, 4).unwrap(), 0x0A);
        assert_eq!(spi.read(REG_CRCPR, 4).unwrap(), 7);
        assert_eq!(spi.read(REG_I2SPR, 4).unwrap(), 2);
    }

    #[test]
    fn dr_write_exchanges_and_sets_rxne() {
        let (mut spi, echo) = spi_with_echo();
        spi.write(REG_CR1, 4, SPE_MASTER).unwrap();
        spi.write(REG_DR, 4, 0xA5).unwrap();

        assert_eq!(echo.borrow().seen, vec![0xA5]);
        assert_eq!(spi.read(REG_SR, 4).unwrap() & 0b11, 0b11);
        assert_eq!(spi.read(REG_DR, 4).unwrap(), 0x5A);
        assert_eq!(spi.read(REG_SR, 4).unwrap() & 1, 0);
    }

    #[test]
    fn msb_first_reverses_on_the_wire() {
        let (mut spi, echo) = spi_with_echo();
        spi.write(REG_CR1, 4, SPE_MASTER).unwrap();
        spi.write(REG_DR, 4, 0x01).unwrap();
        assert_eq!(echo.borrow().seen, vec![0x80]);
        // !0x80 = 0x7F on the wire, reversed back.
        assert_eq!(spi.read(REG_DR, 4).unwrap(), 0xFE);

        spi.write(REG_CR1, 4, SPE_MASTER | (1 << 7)).unwrap();
        spi.write(REG_DR, 4, 0x01).unwrap();
        assert_eq!(echo.borrow().seen[1], 0x01);
        assert_eq!(spi.read(REG_DR, 4).unwrap(), 0xFE);
    }

    #[test]
    fn sixteen_bit_frames() {
        let (mut spi, _echo) = spi_with_echo();
        spi.write(REG_CR1, 4, SPE_MASTER | (1 << 11)).unwrap();
        spi.write(REG_DR, 4, 0x1234).unwrap();
        assert_eq!(spi.read(REG_DR, 4).unwrap(), 0xEDCB);
    }

    #[test]
    fn disabled_or_deselected_transfers() {
        let (mut spi, echo) = spi_with_echo();
        spi.write(REG_DR, 4, 0x11).unwrap();
        assert!(echo.borrow().seen.is_empty());

        spi.write(REG_CR1, 4, SPE_MASTER).unwrap();
        spi.set_irq(0, true);
        spi.write(REG_DR, 4, 0x11).unwrap();
        assert!(echo.borrow().seen.is_empty());
        assert_eq!(spi.read(REG_DR, 4).unwrap(), 0);
    }

    #[test]
    fn overrun_and_interrupt_level() {
        let rec = IrqRecorder::new_shared();
        let (mut spi, _echo) = spi_with_echo();
        spi.connect_irq(IrqLine::new(rec.clone(), 35));
        spi.write(REG_CR1, 4, SPE_MASTER).unwrap();
        spi.write(REG_CR2, 4, 1 << 6).unwrap();

        spi.write(REG_DR, 4, 1).unwrap();
        assert!(rec.borrow().is_asserted(35));
        spi.write(REG_DR, 4, 2).unwrap();
        assert_eq!(spi.read(REG_SR, 4).unwrap() & (1 << 6), 1 << 6);

        spi.read(REG_DR, 4).unwrap();
        assert!(!rec.borrow().is_asserted(35));
        assert_eq!(spi.read(REG_SR, 4).unwrap() & (1 << 6), 0);
    }

    #[test]
    fn snapshot_round_trip() {
        let (mut spi, _echo) = spi_with_echo();
        spi.write(REG_CR1, 4, SPE_MASTER).unwrap();
        spi.write(REG_DR, 4, 0x3C).unwrap();
        let saved = spi.save_state();

        let mut restored = Stm32Spi::new("SPI1");
        restored.load_state(&saved).unwrap();
        assert_eq!(restored.save_state(), saved);
        assert_eq!(restored.read(REG_DR, 4).unwrap(), 0xC3);
    }
}
