//! STM32F4 ADC, regular group only.
//!
//! Conversions are instantaneous: SWSTART with ADON samples the first channel of the regular
//! sequence (SQR3[4:0]) through an [`AdcSampler`], so results are deterministic and scriptable.

use bitflags::bitflags;
use mcusim_interrupts::IrqLine;
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{
    check_access, MmioDevice, MmioError, RegisterFile, RegisterSpec, GUEST_ERROR, UNIMP,
};

pub const ADC_MMIO_SIZE: u64 = 0x100;

const REG_SR: u64 = 0x00;
const REG_CR1: u64 = 0x04;
const REG_CR2: u64 = 0x08;
const REG_HTR: u64 = 0x24;
const REG_LTR: u64 = 0x28;
const REG_SQR3: u64 = 0x34;
const REG_JSQR: u64 = 0x38;
const REG_DR: u64 = 0x4C;

const IDX_SR: usize = 0;
const IDX_CR1: usize = 1;
const IDX_CR2: usize = 2;
const IDX_JOFR1: usize = 5;
const IDX_JOFR4: usize = 8;
const IDX_HTR: usize = 9;
const IDX_LTR: usize = 10;
const IDX_SQR3: usize = 13;
const IDX_JSQR: usize = 14;
const IDX_DR: usize = 19;

static ADC_REGS: &[RegisterSpec] = &[
    RegisterSpec::rw("SR", REG_SR, 0, 0x0000_003F),
    RegisterSpec::rw("CR1", REG_CR1, 0, 0x07C0_FFFF),
    RegisterSpec::rw("CR2", REG_CR2, 0, 0x7F7F_0F03),
    RegisterSpec::rw("SMPR1", 0x0C, 0, 0x07FF_FFFF),
    RegisterSpec::rw("SMPR2", 0x10, 0, 0x3FFF_FFFF),
    RegisterSpec::rw("JOFR1", 0x14, 0, 0x0000_0FFF),
    RegisterSpec::rw("JOFR2", 0x18, 0, 0x0000_0FFF),
    RegisterSpec::rw("JOFR3", 0x1C, 0, 0x0000_0FFF),
    RegisterSpec::rw("JOFR4", 0x20, 0, 0x0000_0FFF),
    RegisterSpec::rw("HTR", REG_HTR, 0x0000_0FFF, 0x0000_0FFF),
    RegisterSpec::rw("LTR", REG_LTR, 0, 0x0000_0FFF),
    RegisterSpec::rw("SQR1", 0x2C, 0, 0x00FF_FFFF),
    RegisterSpec::rw("SQR2", 0x30, 0, 0x3FFF_FFFF),
    RegisterSpec::rw("SQR3", REG_SQR3, 0, 0x3FFF_FFFF),
    RegisterSpec::rw("JSQR", REG_JSQR, 0, 0x003F_FFFF),
    RegisterSpec::ro("JDR1", 0x3C, 0),
    RegisterSpec::ro("JDR2", 0x40, 0),
    RegisterSpec::ro("JDR3", 0x44, 0),
    RegisterSpec::ro("JDR4", 0x48, 0),
    RegisterSpec::ro("DR", REG_DR, 0),
];

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Sr: u32 {
        const AWD = 1 << 0;
        const EOC = 1 << 1;
        const STRT = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Cr1: u32 {
        const EOCIE = 1 << 5;
        const AWDIE = 1 << 6;
        const AWDEN = 1 << 23;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Cr2: u32 {
        const ADON = 1 << 0;
        const CONT = 1 << 1;
        const ALIGN = 1 << 11;
        const JSWSTART = 1 << 22;
        const SWSTART = 1 << 30;
    }
}

/// Analog front end: returns a 12-bit sample for `channel`.
pub trait AdcSampler {
    fn sample(&mut self, channel: u8) -> u16;
}

impl<F: FnMut(u8) -> u16> AdcSampler for F {
    fn sample(&mut self, channel: u8) -> u16 {
        self(channel)
    }
}

/// Every channel reads mid-scale.
#[derive(Debug, Clone, Copy, Default)]
pub struct MidScale;

impl AdcSampler for MidScale {
    fn sample(&mut self, _channel: u8) -> u16 {
        0x800
    }
}

pub struct Adc {
    name: &'static str,
    regs: RegisterFile,
    sampler: Box<dyn AdcSampler>,
    irq: IrqLine,
}

impl std::fmt::Debug for Adc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adc")
            .field("name", &self.name)
            .field("regs", &self.regs)
            .field("irq", &self.irq)
            .finish_non_exhaustive()
    }
}

impl Adc {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            regs: RegisterFile::new(name, ADC_REGS),
            sampler: Box::new(MidScale),
            irq: IrqLine::disconnected(),
        }
    }

    pub fn connect_irq(&mut self, irq: IrqLine) {
        self.irq = irq;
        self.update_irq();
    }

    pub fn set_sampler(&mut self, sampler: Box<dyn AdcSampler>) {
        self.sampler = sampler;
    }

    fn sr(&self) -> Sr {
        Sr::from_bits_truncate(self.regs.get(IDX_SR))
    }

    fn update_irq(&self) {
        let sr = self.sr();
        let cr1 = Cr1::from_bits_truncate(self.regs.get(IDX_CR1));
        let level = (sr.contains(Sr::EOC) && cr1.contains(Cr1::EOCIE))
            || (sr.contains(Sr::AWD) && cr1.contains(Cr1::AWDIE));
        self.irq.set_level(level);
    }

    fn convert(&mut self) {
        let channel = (self.regs.get(IDX_SQR3) & 0x1F) as u8;
        let raw = u32::from(self.sampler.sample(channel)) & 0xFFF;

        let cr1 = self.regs.get(IDX_CR1);
        let cr2 = Cr2::from_bits_truncate(self.regs.get(IDX_CR2));
        // RES: 12, 10, 8 or 6 bits.
        let bits = 12 - 2 * ((cr1 >> 24) & 0b11);
        let value = raw >> (12 - bits);
        let aligned = if cr2.contains(Cr2::ALIGN) {
            value << (16 - bits)
        } else {
            value
        };

        let mut sr = self.sr() | Sr::EOC | Sr::STRT;
        let cr1 = Cr1::from_bits_truncate(cr1);
        if cr1.contains(Cr1::AWDEN)
            && (raw > self.regs.get(IDX_HTR) || raw < self.regs.get(IDX_LTR))
        {
            sr |= Sr::AWD;
        }
        tracing::trace!(adc = self.name, channel, raw, "conversion");
        self.regs.set(IDX_DR, aligned);
        self.regs.set(IDX_SR, sr.bits() | (self.regs.get(IDX_SR) & !Sr::all().bits()));
        self.update_irq();
    }

    fn write_reg(&mut self, offset: u64, size: usize, value: u32) {
        let Some(w) = self.regs.write(offset, size, value) else {
            return;
        };
        match w.index {
            IDX_SR => {
                // rc_w0
                self.regs.set(IDX_SR, w.old & w.new);
            }
            IDX_CR2 => {
                let cr2 = Cr2::from_bits_truncate(w.new);
                if cr2.contains(Cr2::JSWSTART) {
                    tracing::warn!(target: UNIMP, adc = self.name, "injected conversions not modeled");
                }
                if cr2.contains(Cr2::SWSTART) {
                    if cr2.contains(Cr2::ADON) {
                        self.convert();
                    } else {
                        tracing::warn!(target: GUEST_ERROR, adc = self.name, "SWSTART with ADON clear");
                    }
                }
                // Start bits self-clear.
                self.regs
                    .set(IDX_CR2, w.new & !(Cr2::SWSTART | Cr2::JSWSTART).bits());
            }
            IDX_JOFR1..=IDX_JOFR4 | IDX_JSQR => {
                tracing::warn!(target: UNIMP, adc = self.name, "injected channel setup stored but unused");
            }
            _ => {}
        }
        self.update_irq();
    }

    fn read_reg(&mut self, offset: u64, size: usize) -> u32 {
        let Some(value) = self.regs.read(offset, size) else {
            tracing::warn!(
                target: GUEST_ERROR,
                adc = self.name,
                "read of reserved offset {offset:#x}"
            );
            return 0;
        };
        if self.regs.index_of(offset & !3) == Some(IDX_DR) {
            self.regs.set(IDX_SR, self.regs.get(IDX_SR) & !Sr::EOC.bits());
            let cr2 = Cr2::from_bits_truncate(self.regs.get(IDX_CR2));
            if cr2.contains(Cr2::ADON | Cr2::CONT) {
                self.convert();
            }
            self.update_irq();
        }
        value
    }
}

impl MmioDevice for Adc {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        check_access(ADC_MMIO_SIZE, offset, size)?;
        Ok(u64::from(self.read_reg(offset, size)))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        check_access(ADC_MMIO_SIZE, offset, size)?;
        self.write_reg(offset, size, value as u32);
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.update_irq();
    }
}

impl IoSnapshot for Adc {
    const DEVICE_ID: [u8; 4] = *b"ADCR";
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
    use mcusim_interrupts::IrqRecorder;

    const ADON: u64 = 1;
    const CONT: u64 = 1 << 1;
    const SWSTART: u64 = 1 << 30;

    #[test]
    fn reset_values() {
        let mut adc = Adc::new("ADC1");
        assert_eq!(adc.read(REG_HTR, 4).unwrap(), 0xFFF);
        assert_eq!(adc.read(REG_DR, 4).unwrap(), 0);
    }

    #[test]
    fn software_start_converts_first_regular_channel() {
        let mut adc = Adc::new("ADC1");
        adc.set_sampler(Box::new(|ch: u8| 100 + u16::from(ch)));
        adc.write(REG_SQR3, 4, 7).unwrap();
        adc.write(REG_CR2, 4, ADON | SWSTART).unwrap();

        assert_eq!(adc.read(REG_CR2, 4).unwrap(), ADON);
        assert_eq!(adc.read(REG_SR, 4).unwrap() & 0b10, 0b10);
        assert_eq!(adc.read(REG_DR, 4).unwrap(), 107);
        assert_eq!(adc.read(REG_SR, 4).unwrap() & 0b10, 0);
    }

    #[test]
    fn default_sampler_reads_mid_scale() {
        let mut adc = Adc::new("ADC1");
        adc.write(REG_CR2, 4, ADON | SWSTART).unwrap();
        assert_eq!(adc.read(REG_DR, 4).unwrap(), 0x800);
    }

    #[test]
    fn start_without_adon_does_nothing() {
        let mut adc = Adc::new("ADC1");
        adc.write(REG_CR2, 4, SWSTART).unwrap();
        assert_eq!(adc.read(REG_SR, 4).unwrap(), 0);
    }

    #[test]
    fn resolution_and_alignment() {
        let mut adc = Adc::new("ADC1");
        adc.set_sampler(Box::new(|_: u8| -> u16 { 0xABC }));
        // 8-bit, left aligned.
        adc.write(REG_CR1, 4, 2 << 24).unwrap();
        adc.write(REG_CR2, 4, ADON | (1 << 11) | SWSTART).unwrap();
        assert_eq!(adc.read(REG_DR, 4).unwrap(), 0xAB00);
    }

    #[test]
    fn continuous_mode_reconverts_on_dr_read() {
        let mut adc = Adc::new("ADC1");
        let mut next = 0u16;
        adc.set_sampler(Box::new(move |_: u8| {
            next += 1;
            next
        }));
        adc.write(REG_CR2, 4, ADON | CONT | SWSTART).unwrap();
        assert_eq!(adc.read(REG_DR, 4).unwrap(), 1);
        assert_eq!(adc.read(REG_DR, 4).unwrap(), 2);
        assert_eq!(adc.read(REG_SR, 4).unwrap() & 0b10, 0b10);
    }

    #[test]
    fn eoc_interrupt_and_watchdog() {
        let rec = IrqRecorder::new_shared();
        let mut adc = Adc::new("ADC1");
        adc.connect_irq(IrqLine::new(rec.clone(), 18));
        adc.write(REG_CR1, 4, 1 << 5).unwrap();
        adc.write(REG_CR2, 4, ADON | SWSTART).unwrap();
        assert!(rec.borrow().is_asserted(18));
        adc.read(REG_DR, 4).unwrap();
        assert!(!rec.borrow().is_asserted(18));

        adc.write(REG_HTR, 4, 0x100).unwrap();
        adc.write(REG_CR1, 4, 1 << 23).unwrap();
        adc.write(REG_CR2, 4, ADON | SWSTART).unwrap();
        assert_eq!(adc.read(REG_SR, 4).unwrap() & 1, 1);
        // rc_w0
        adc.write(REG_SR, 4, !1u64 & 0x3F).unwrap();
        assert_eq!(adc.read(REG_SR, 4).unwrap() & 1, 0);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut adc = Adc::new("ADC1");
        adc.write(REG_LTR, 4, 0x10).unwrap();
        adc.write(REG_CR2, 4, ADON | SWSTART).unwrap();
        let saved = adc.save_state();

        let mut restored = Adc::new("ADC1");
        restored.load_state(&saved).unwrap();
        assert_eq!(restored.save_state(), saved);
        assert_eq!(restored.read(REG_DR, 4).unwrap(), 0x800);
    }
}
