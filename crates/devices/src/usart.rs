use bitflags::bitflags;
use mcusim_interrupts::IrqLine;
use mcusim_io_snapshot::codec::{Decoder, Encoder};
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{
    check_access, MmioDevice, MmioError, RegisterFile, RegisterSpec, GUEST_ERROR, UNIMP,
};

pub const USART_MMIO_SIZE: u64 = 0x400;

const REG_SR: u64 = 0x00;
const REG_DR: u64 = 0x04;
const REG_BRR: u64 = 0x08;
const REG_CR1: u64 = 0x0C;
const REG_CR2: u64 = 0x10;
const REG_CR3: u64 = 0x14;
const REG_GTPR: u64 = 0x18;

const IDX_SR: usize = 0;
const IDX_DR: usize = 1;
const IDX_CR1: usize = 3;
const IDX_CR3: usize = 5;

static USART_REGS: &[RegisterSpec] = &[
    RegisterSpec::rw("SR", REG_SR, 0x0000_00C0, RC_W0),
    RegisterSpec::rw("DR", REG_DR, 0, 0x0000_01FF),
    RegisterSpec::rw("BRR", REG_BRR, 0, 0x0000_FFFF),
    RegisterSpec::rw("CR1", REG_CR1, 0, 0x0000_BFFF),
    RegisterSpec::rw("CR2", REG_CR2, 0, 0x0000_7F6F),
    RegisterSpec::rw("CR3", REG_CR3, 0, 0x0000_0FFF),
    RegisterSpec::rw("GTPR", REG_GTPR, 0, 0x0000_FFFF),
];

/// SR bits software may clear by writing zero (RXNE, TC, LBD, CTS).
const RC_W0: u32 = (1 << 5) | (1 << 6) | (1 << 8) | (1 << 9);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Sr: u32 {
        const PE = 1 << 0;
        const FE = 1 << 1;
        const NF = 1 << 2;
        const ORE = 1 << 3;
        const RXNE = 1 << 5;
        const TC = 1 << 6;
        const TXE = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Cr1: u32 {
        const RE = 1 << 2;
        const TE = 1 << 3;
        const RXNEIE = 1 << 5;
        const TCIE = 1 << 6;
        const TXEIE = 1 << 7;
        const M = 1 << 12;
        const UE = 1 << 13;
    }
}

/// STM32F4 USART without baud-rate timing: transmission completes as soon as DR is written.
///
/// The host side is a byte pipe: [`Usart::take_tx`] drains what the guest sent and
/// [`Usart::receive`] delivers one byte into DR.
#[derive(Debug)]
pub struct Usart {
    name: &'static str,
    regs: RegisterFile,
    tx: Vec<u8>,
    /// Set by an SR read; the next DR read clears the error flags.
    sr_read: bool,
    irq: IrqLine,
}

impl Usart {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            regs: RegisterFile::new(name, USART_REGS),
            tx: Vec::new(),
            sr_read: false,
            irq: IrqLine::disconnected(),
        }
    }

    pub fn connect_irq(&mut self, irq: IrqLine) {
        self.irq = irq;
        self.update_irq();
    }

    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Delivers one byte from the line. Returns `false` if it was not latched.
    pub fn receive(&mut self, byte: u8) -> bool {
        let cr1 = self.cr1();
        if !cr1.contains(Cr1::UE | Cr1::RE) {
            tracing::debug!(usart = self.name, byte, "receiver disabled, byte dropped");
            return false;
        }
        let sr = self.sr();
        if sr.contains(Sr::RXNE) {
            tracing::debug!(usart = self.name, byte, "receive overrun");
            self.set_sr(sr | Sr::ORE);
            self.update_irq();
            return false;
        }
        self.regs.set(IDX_DR, u32::from(byte));
        self.set_sr(sr | Sr::RXNE);
        self.update_irq();
        true
    }

    pub fn irq_level(&self) -> bool {
        let sr = self.sr();
        let cr1 = self.cr1();
        (sr.contains(Sr::RXNE) && cr1.contains(Cr1::RXNEIE))
            || (sr.contains(Sr::ORE) && cr1.contains(Cr1::RXNEIE))
            || (sr.contains(Sr::TXE) && cr1.contains(Cr1::TXEIE))
            || (sr.contains(Sr::TC) && cr1.contains(Cr1::TCIE))
    }

    fn update_irq(&self) {
        self.irq.set_level(self.irq_level());
    }

    fn sr(&self) -> Sr {
        Sr::from_bits_truncate(self.regs.get(IDX_SR))
    }

    fn set_sr(&mut self, sr: Sr) {
        let other = self.regs.get(IDX_SR) & !Sr::all().bits();
        self.regs.set(IDX_SR, other | sr.bits());
    }

    fn cr1(&self) -> Cr1 {
        Cr1::from_bits_truncate(self.regs.get(IDX_CR1))
    }

    fn transmit(&mut self, value: u32) {
        let cr1 = self.cr1();
        if !cr1.contains(Cr1::UE | Cr1::TE) {
            tracing::warn!(
                target: GUEST_ERROR,
                usart = self.name,
                "DR write {value:#x} with transmitter disabled"
            );
            return;
        }
        if cr1.contains(Cr1::M) && value & 0x100 != 0 {
            tracing::warn!(target: UNIMP, usart = self.name, "ninth data bit dropped on the host pipe");
        }
        self.tx.push(value as u8);
        // The shift register drains instantly.
        self.set_sr(self.sr() | Sr::TXE | Sr::TC);
    }

    fn write_reg(&mut self, offset: u64, size: usize, value: u32) {
        if self.regs.index_of(offset & !3) == Some(IDX_DR) {
            self.transmit(value & 0x1FF);
            self.update_irq();
            return;
        }

        let Some(w) = self.regs.write(offset, size, value) else {
            return;
        };
        match w.index {
            IDX_SR => {
                // rc_w0: writing one leaves a clear bit clear.
                self.regs.set(IDX_SR, w.old & (w.new | !RC_W0));
            }
            IDX_CR3 if w.new & (0b11 << 6) != 0 => {
                tracing::warn!(target: UNIMP, usart = self.name, "USART DMA not modeled");
            }
            _ => {}
        }
        self.update_irq();
    }

    fn read_reg(&mut self, offset: u64, size: usize) -> u32 {
        let Some(value) = self.regs.read(offset, size) else {
            tracing::warn!(
                target: GUEST_ERROR,
                usart = self.name,
                "read of reserved offset {offset:#x}"
            );
            return 0;
        };
        match self.regs.index_of(offset & !3) {
            Some(IDX_SR) => self.sr_read = true,
            Some(IDX_DR) => {
                let mut sr = self.sr() - Sr::RXNE;
                if std::mem::take(&mut self.sr_read) {
                    sr -= Sr::PE | Sr::FE | Sr::NF | Sr::ORE;
                }
                self.set_sr(sr);
                self.update_irq();
            }
            _ => {}
        }
        value
    }
}

impl MmioDevice for Usart {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        check_access(USART_MMIO_SIZE, offset, size)?;
        Ok(u64::from(self.read_reg(offset, size)))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        check_access(USART_MMIO_SIZE, offset, size)?;
        self.write_reg(offset, size, value as u32);
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.tx.clear();
        self.sr_read = false;
        self.update_irq();
    }
}

impl IoSnapshot for Usart {
    const DEVICE_ID: [u8; 4] = *b"USRT";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_REGS: u16 = 1;
        const TAG_TX: u16 = 2;
        const TAG_SR_READ: u16 = 3;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_REGS, self.regs.save());
        w.field_bytes(TAG_TX, Encoder::new().vec_u8(&self.tx).finish());
        w.field_bool(TAG_SR_READ, self.sr_read);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_REGS: u16 = 1;
        const TAG_TX: u16 = 2;
        const TAG_SR_READ: u16 = 3;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        self.reset();
        if let Some(buf) = r.bytes(TAG_REGS) {
            self.regs.load(buf)?;
        }
        if let Some(buf) = r.bytes(TAG_TX) {
            let mut d = Decoder::new(buf);
            self.tx = d.vec_u8(buf.len(), "usart tx backlog")?;
            d.finish()?;
        }
        self.sr_read = r.bool(TAG_SR_READ)?.unwrap_or(false);
        self.update_irq();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcusim_interrupts::IrqRecorder;

    const UE_TE_RE: u64 = (1 << 13) | (1 << 3) | (1 << 2);

    fn enabled() -> Usart {
        let mut usart = Usart::new("USART1");
        usart.write(REG_CR1, 4, UE_TE_RE).unwrap();
        usart
    }

    #[test]
    fn transmit_collects_bytes() {
        let mut usart = enabled();
        for &b in b"hi\n" {
            usart.write(REG_DR, 4, u64::from(b)).unwrap();
        }
        assert_eq!(usart.take_tx(), b"hi\n".to_vec());
        assert!(usart.take_tx().is_empty());
        assert_eq!(usart.read(REG_SR, 4).unwrap() & 0xC0, 0xC0);
    }

    #[test]
    fn transmitter_disabled_drops() {
        let mut usart = Usart::new("USART1");
        usart.write(REG_DR, 4, 0x41).unwrap();
        assert!(usart.take_tx().is_empty());
    }

    #[test]
    fn receive_latches_and_dr_read_clears() {
        let mut usart = enabled();
        assert!(usart.receive(0x42));
        assert_eq!(usart.read(REG_SR, 4).unwrap() & (1 << 5), 1 << 5);
        // SR reads clear nothing.
        assert_eq!(usart.read(REG_SR, 4).unwrap() & (1 << 5), 1 << 5);
        assert_eq!(usart.read(REG_DR, 4).unwrap(), 0x42);
        assert_eq!(usart.read(REG_SR, 4).unwrap() & (1 << 5), 0);
    }

    #[test]
    fn overrun_keeps_first_byte_until_sequence_clears() {
        let mut usart = enabled();
        usart.receive(1);
        assert!(!usart.receive(2));
        assert_eq!(usart.read(REG_SR, 4).unwrap() & (1 << 3), 1 << 3);
        assert_eq!(usart.read(REG_DR, 4).unwrap(), 1);
        assert_eq!(usart.read(REG_SR, 4).unwrap() & (1 << 3), 0);
    }

    #[test]
    fn receiver_disabled_drops() {
        let mut usart = Usart::new("USART1");
        assert!(!usart.receive(7));
        assert_eq!(usart.read(REG_SR, 4).unwrap(), 0xC0);
    }

    #[test]
    fn sr_bits_clear_only_by_writing_zero() {
        let mut usart = enabled();
        usart.write(REG_SR, 4, 0xFFFF_FFFF).unwrap();
        assert_eq!(usart.read(REG_SR, 4).unwrap(), 0xC0);
        usart.write(REG_SR, 4, 0x80).unwrap();
        // TC cleared, TXE is read-only.
        assert_eq!(usart.read(REG_SR, 4).unwrap(), 0x80);
    }

    #[test]
    fn interrupt_levels() {
        let rec = IrqRecorder::new_shared();
        let mut usart = enabled();
        usart.connect_irq(IrqLine::new(rec.clone(), 37));
        assert!(!rec.borrow().is_asserted(37));

        usart.write(REG_CR1, 4, UE_TE_RE | (1 << 5)).unwrap();
        usart.receive(0x55);
        assert!(rec.borrow().is_asserted(37));
        usart.read(REG_DR, 4).unwrap();
        assert!(!rec.borrow().is_asserted(37));

        usart.write(REG_CR1, 4, UE_TE_RE | (1 << 7)).unwrap();
        assert!(rec.borrow().is_asserted(37));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut usart = enabled();
        usart.write(REG_BRR, 4, 0x2D9).unwrap();
        usart.write(REG_DR, 4, u64::from(b'x')).unwrap();
        usart.receive(b'y');
        let saved = usart.save_state();

        let mut restored = Usart::new("USART1");
        restored.load_state(&saved).unwrap();
        assert_eq!(restored.save_state(), saved);
        assert_eq!(restored.take_tx(), vec![b'x']);
        assert_eq!(restored.read(REG_DR, 4).unwrap(), u64::from(b'y'));
    }
}
