//! FIFO-based serial controller (SiFive SPI register layout).
//!
//! TXDATA writes queue a frame and run transfers immediately; there is no modeled bit clock.
//! Every transfer pushes its reply onto the RX FIFO, whatever the FMT direction bit says, so a
//! frame only moves while the RX FIFO has room. After every transfer, RXDATA pop and register
//! write the watermark conditions and every chip-select output are recomputed.

use std::collections::VecDeque;

use mcusim_interrupts::IrqLine;
use mcusim_io_snapshot::codec::{Decoder, Encoder};
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{
    check_access, MmioDevice, MmioError, RegisterFile, RegisterSpec, GUEST_ERROR, UNIMP,
};

use super::{reverse_bits, SsiBus, SsiPeripheral};

pub const FIFO_SPI_MMIO_SIZE: u64 = 0x1000;

const REG_SCKDIV: u64 = 0x00;
const REG_SCKMODE: u64 = 0x04;
const REG_CSID: u64 = 0x10;
const REG_CSDEF: u64 = 0x14;
const REG_CSMODE: u64 = 0x18;
const REG_DELAY0: u64 = 0x28;
const REG_DELAY1: u64 = 0x2C;
const REG_FMT: u64 = 0x40;
const REG_TXDATA: u64 = 0x48;
const REG_RXDATA: u64 = 0x4C;
const REG_TXMARK: u64 = 0x50;
const REG_RXMARK: u64 = 0x54;
const REG_FCTRL: u64 = 0x60;
const REG_FFMT: u64 = 0x64;
const REG_IE: u64 = 0x70;
const REG_IP: u64 = 0x74;

const IDX_CSID: usize = 2;
const IDX_CSDEF: usize = 3;
const IDX_CSMODE: usize = 4;
const IDX_FMT: usize = 7;
const IDX_TXDATA: usize = 8;
const IDX_RXDATA: usize = 9;
const IDX_TXMARK: usize = 10;
const IDX_RXMARK: usize = 11;
const IDX_FCTRL: usize = 12;
const IDX_FFMT: usize = 13;
const IDX_IE: usize = 14;
const IDX_IP: usize = 15;

static FIFO_SPI_REGS: &[RegisterSpec] = &[
    RegisterSpec::rw("SCKDIV", REG_SCKDIV, 0x3, 0x0000_0FFF),
    RegisterSpec::rw("SCKMODE", REG_SCKMODE, 0, 0x0000_0003),
    RegisterSpec::rw("CSID", REG_CSID, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("CSDEF", REG_CSDEF, 0x1, 0xFFFF_FFFF),
    RegisterSpec::rw("CSMODE", REG_CSMODE, 0, 0x0000_0003),
    RegisterSpec::rw("DELAY0", REG_DELAY0, 0x0001_0001, 0x00FF_00FF),
    RegisterSpec::rw("DELAY1", REG_DELAY1, 0x1, 0x00FF_00FF),
    RegisterSpec::rw("FMT", REG_FMT, (1 << 3) | (8 << 16), 0x000F_000F),
    RegisterSpec::wo("TXDATA", REG_TXDATA, 0xFF),
    RegisterSpec::ro("RXDATA", REG_RXDATA, 0),
    RegisterSpec::rw("TXMARK", REG_TXMARK, 0x1, 0xFF),
    RegisterSpec::rw("RXMARK", REG_RXMARK, 0, 0xFF),
    RegisterSpec::rw("FCTRL", REG_FCTRL, 0x1, 0x1),
    RegisterSpec::rw("FFMT", REG_FFMT, 0x1 | (0x3 << 1) | (0x3 << 16), 0xFFFF_FFFF),
    RegisterSpec::rw("IE", REG_IE, 0, 0x3),
    RegisterSpec::ro("IP", REG_IP, 0),
];

const FMT_PROTO: u32 = 0b11;
const FMT_LSB_FIRST: u32 = 1 << 2;

const IP_TXWM: u32 = 1 << 0;
const IP_RXWM: u32 = 1 << 1;

const DATA_FLAG: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsMode {
    Auto,
    Hold,
    Off,
}

impl CsMode {
    fn from_bits(bits: u32) -> Option<Self> {
        match bits & 0b11 {
            0 => Some(Self::Auto),
            2 => Some(Self::Hold),
            3 => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoSpiConfig {
    /// Number of chip-select outputs.
    pub cs_width: usize,
    /// Capacity of each of the TX and RX FIFOs, in frames.
    pub fifo_depth: usize,
}

impl Default for FifoSpiConfig {
    fn default() -> Self {
        Self {
            cs_width: 1,
            fifo_depth: 8,
        }
    }
}

pub struct FifoSpi {
    config: FifoSpiConfig,
    regs: RegisterFile,
    tx: VecDeque<u8>,
    rx: VecDeque<u8>,
    cs_asserted: Vec<bool>,
    bus: SsiBus,
    slot_cs: Vec<usize>,
    cs_lines: Vec<IrqLine>,
    irq: IrqLine,
}

impl std::fmt::Debug for FifoSpi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoSpi")
            .field("config", &self.config)
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .field("cs_asserted", &self.cs_asserted)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl FifoSpi {
    pub fn new(config: FifoSpiConfig) -> Self {
        let mut spi = Self {
            config,
            regs: RegisterFile::new("FIFO-SPI", FIFO_SPI_REGS),
            tx: VecDeque::with_capacity(config.fifo_depth),
            rx: VecDeque::with_capacity(config.fifo_depth),
            cs_asserted: vec![false; config.cs_width],
            bus: SsiBus::new(),
            slot_cs: Vec::new(),
            cs_lines: vec![IrqLine::disconnected(); config.cs_width],
            irq: IrqLine::disconnected(),
        };
        spi.update();
        spi
    }

    pub fn config(&self) -> FifoSpiConfig {
        self.config
    }

    pub fn connect_irq(&mut self, irq: IrqLine) {
        self.irq = irq;
        self.update();
    }

    pub fn connect_cs(&mut self, cs: usize, line: IrqLine) {
        let Some(slot) = self.cs_lines.get_mut(cs) else {
            tracing::warn!(
                "chip select {cs} beyond {} lines, not connected",
                self.config.cs_width
            );
            return;
        };
        *slot = line;
        self.update();
    }

    /// Attaches a peripheral behind chip-select `cs`.
    pub fn attach(&mut self, cs: usize, device: Box<dyn SsiPeripheral>) -> usize {
        let slot = self.bus.attach(device);
        self.slot_cs.push(cs);
        self.bus.set_selected(slot, self.cs_asserted.get(cs).copied().unwrap_or(false));
        slot
    }

    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    pub fn cs_asserted(&self, cs: usize) -> bool {
        self.cs_asserted.get(cs).copied().unwrap_or(false)
    }

    fn push_tx(&mut self, frame: u8) {
        if self.tx.len() >= self.config.fifo_depth {
            tracing::warn!(target: GUEST_ERROR, frame, "TX FIFO full, frame dropped");
            return;
        }
        self.tx.push_back(frame);
    }

    fn run_transfers(&mut self) {
        let fmt = self.regs.get(IDX_FMT);
        let len = ((fmt >> 16) & 0xF).min(8);
        let mask = (1u32 << len) - 1;
        let msb_first = fmt & FMT_LSB_FIRST == 0;

        while !self.tx.is_empty() {
            if self.rx.len() >= self.config.fifo_depth {
                tracing::trace!("RX FIFO full, transfer stalled");
                break;
            }
            let Some(frame) = self.tx.pop_front() else {
                break;
            };

            let mut out = u32::from(frame) & mask;
            if msb_first {
                out = reverse_bits(out, len);
            }
            let mut reply = self.bus.transfer(out) & mask;
            if msb_first {
                reply = reverse_bits(reply, len);
            }
            tracing::trace!(out, reply, rx = self.rx.len(), "fifo spi frame");

            self.rx.push_back(reply as u8);
            self.update();
        }
        self.update();
    }

    fn pop_rx(&mut self) -> u32 {
        let value = match self.rx.pop_front() {
            Some(frame) => u32::from(frame),
            None => DATA_FLAG,
        };
        // Room in RX may unblock queued frames.
        self.run_transfers();
        value
    }

    fn update(&mut self) {
        let mut ip = 0;
        if self.tx.len() < self.regs.get(IDX_TXMARK) as usize {
            ip |= IP_TXWM;
        }
        if self.rx.len() > self.regs.get(IDX_RXMARK) as usize {
            ip |= IP_RXWM;
        }
        self.regs.set(IDX_IP, ip);
        self.irq.set_level(ip & self.regs.get(IDX_IE) != 0);

        self.drive_chip_selects();
    }

    fn drive_chip_selects(&mut self) {
        let csid = self.regs.get(IDX_CSID) as usize;
        let csdef = self.regs.get(IDX_CSDEF);
        let mode = CsMode::from_bits(self.regs.get(IDX_CSMODE)).unwrap_or(CsMode::Auto);

        for cs in 0..self.config.cs_width {
            let asserted = match mode {
                CsMode::Auto => cs == csid,
                CsMode::Hold => self.cs_asserted[cs],
                CsMode::Off => false,
            };
            self.cs_asserted[cs] = asserted;
            let idle_high = csdef & (1 << cs) != 0;
            self.cs_lines[cs].set_level(asserted != idle_high);
        }
        for (slot, &cs) in self.slot_cs.iter().enumerate() {
            let asserted = self.cs_asserted.get(cs).copied().unwrap_or(false);
            self.bus.set_selected(slot, asserted);
        }
    }

    fn write_reg(&mut self, offset: u64, size: usize, value: u32) {
        if self.regs.index_of(offset & !3) == Some(IDX_TXDATA) && offset & 3 != 0 {
            tracing::warn!(target: GUEST_ERROR, "TXDATA write at {offset:#x} misses the data byte");
            return;
        }
        let Some(w) = self.regs.write(offset, size, value) else {
            return;
        };
        match w.index {
            IDX_TXDATA => {
                self.push_tx(w.new as u8);
                self.regs.set(IDX_TXDATA, 0);
                self.run_transfers();
            }
            IDX_FMT if w.new & FMT_PROTO != 0 => {
                tracing::warn!(target: UNIMP, "dual/quad SPI protocols not modeled");
            }
            IDX_CSID if w.new as usize >= self.config.cs_width => {
                tracing::warn!(
                    target: GUEST_ERROR,
                    "CSID {} beyond {} chip selects",
                    w.new,
                    self.config.cs_width
                );
            }
            IDX_CSMODE if CsMode::from_bits(w.new).is_none() => {
                tracing::warn!(target: GUEST_ERROR, "reserved CSMODE {}, treated as AUTO", w.new);
            }
            IDX_FCTRL | IDX_FFMT => {
                tracing::warn!(target: UNIMP, "direct memory-mapped flash mode not modeled");
            }
            _ => {}
        }
        self.update();
    }

    fn read_reg(&mut self, offset: u64, size: usize) -> u32 {
        match self.regs.index_of(offset & !3) {
            Some(IDX_RXDATA) if offset & 3 == 0 && size == 4 => return self.pop_rx(),
            Some(IDX_TXDATA) if offset & 3 == 0 && size == 4 => {
                return if self.tx.len() >= self.config.fifo_depth {
                    DATA_FLAG
                } else {
                    0
                };
            }
            Some(IDX_RXDATA | IDX_TXDATA) => {
                tracing::warn!(target: GUEST_ERROR, "sub-word FIFO data read at {offset:#x}");
                return 0;
            }
            Some(IDX_FCTRL | IDX_FFMT) => {
                tracing::warn!(target: UNIMP, "direct memory-mapped flash mode not modeled");
            }
            _ => {}
        }
        self.regs.read(offset, size).unwrap_or_else(|| {
            tracing::warn!(target: GUEST_ERROR, "FIFO SPI read of reserved offset {offset:#x}");
            0
        })
    }
}

impl MmioDevice for FifoSpi {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        check_access(FIFO_SPI_MMIO_SIZE, offset, size)?;
        Ok(u64::from(self.read_reg(offset, size)))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        check_access(FIFO_SPI_MMIO_SIZE, offset, size)?;
        self.write_reg(offset, size, value as u32);
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.tx.clear();
        self.rx.clear();
        self.cs_asserted.fill(false);
        self.update();
    }
}

impl IoSnapshot for FifoSpi {
    const DEVICE_ID: [u8; 4] = *b"SPIF";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_REGS: u16 = 1;
        const TAG_TX: u16 = 2;
        const TAG_RX: u16 = 3;
        const TAG_CS: u16 = 4;

        let tx: Vec<u8> = self.tx.iter().copied().collect();
        let rx: Vec<u8> = self.rx.iter().copied().collect();
        let cs: Vec<u8> = self.cs_asserted.iter().map(|&a| u8::from(a)).collect();

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_REGS, self.regs.save());
        w.field_bytes(TAG_TX, Encoder::new().vec_u8(&tx).finish());
        w.field_bytes(TAG_RX, Encoder::new().vec_u8(&rx).finish());
        w.field_bytes(TAG_CS, Encoder::new().vec_u8(&cs).finish());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_REGS: u16 = 1;
        const TAG_TX: u16 = 2;
        const TAG_RX: u16 = 3;
        const TAG_CS: u16 = 4;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let depth = self.config.fifo_depth;
        let fifo = |tag: u16| -> SnapshotResult<VecDeque<u8>> {
            let Some(buf) = r.bytes(tag) else {
                return Ok(VecDeque::new());
            };
            let mut d = Decoder::new(buf);
            let frames = d.vec_u8(depth, "fifo exceeds configured depth")?;
            d.finish()?;
            Ok(frames.into())
        };
        let tx = fifo(TAG_TX)?;
        let rx = fifo(TAG_RX)?;

        self.regs.reset();
        if let Some(buf) = r.bytes(TAG_REGS) {
            self.regs.load(buf)?;
        }
        self.tx = tx;
        self.rx = rx;

        self.cs_asserted.fill(false);
        if let Some(buf) = r.bytes(TAG_CS) {
            let mut d = Decoder::new(buf);
            let cs = d.vec_u8(self.config.cs_width, "too many chip selects")?;
            d.finish()?;
            for (slot, v) in self.cs_asserted.iter_mut().zip(cs) {
                *slot = match v {
                    0 => false,
                    1 => true,
                    _ => return Err(SnapshotError::InvalidFieldEncoding("chip-select state")),
                };
            }
        }
        self.update();
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

    /// Full duplex, MSB first, 8-bit frames.
    const FMT_DUPLEX: u64 = 8 << 16;

    fn with_echo() -> (FifoSpi, Rc<RefCell<InvertingEcho>>) {
        let echo = Rc::new(RefCell::new(InvertingEcho::new(8)));
        let mut spi = FifoSpi::new(FifoSpiConfig::default());
        spi.attach(0, Box::new(echo.clone()));
        spi.write(REG_FMT, 4, FMT_DUPLEX).unwrap();
        (spi, echo)
    }

    #[test]
    fn reset_values() {
        let mut spi = FifoSpi::new(FifoSpiConfig::default());
        for (offset, value) in [
            (REG_SCKDIV, 3),
            (REG_CSDEF, 1),
            (REG_DELAY0, 0x1_0001),
            (REG_DELAY1, 1),
            (REG_FMT, (1 << 3) | (8 << 16)),
            (REG_TXMARK, 1),
            (REG_FCTRL, 1),
            (REG_FFMT, 1 | (3 << 1) | (3 << 16)),
        ] {
            assert_eq!(spi.read(offset, 4).unwrap(), value, "offset {offset:#x}");
        }
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), u64::from(DATA_FLAG));
    }

    #[test]
    fn loopback_through_inverting_slave() {
        let (mut spi, echo) = with_echo();
        spi.write(REG_TXDATA, 4, 0xA5).unwrap();
        assert_eq!(echo.borrow().seen, vec![0xA5]);
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), 0x5A);
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), u64::from(DATA_FLAG));
    }

    #[test]
    fn power_on_format_loops_back() {
        let echo = Rc::new(RefCell::new(InvertingEcho::new(8)));
        let mut spi = FifoSpi::new(FifoSpiConfig::default());
        spi.attach(0, Box::new(echo.clone()));
        spi.write(REG_TXDATA, 4, 0xA5).unwrap();
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), 0x5A);
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), u64::from(DATA_FLAG));
    }

    #[test]
    fn transmit_direction_still_fills_rx() {
        let echo = Rc::new(RefCell::new(InvertingEcho::new(8)));
        let mut spi = FifoSpi::new(FifoSpiConfig::default());
        spi.attach(0, Box::new(echo.clone()));
        spi.write(REG_FMT, 4, FMT_DUPLEX | (1 << 3)).unwrap();
        for n in 0..12 {
            spi.write(REG_TXDATA, 4, n).unwrap();
        }
        assert_eq!(echo.borrow().seen.len(), 8);
        assert_eq!(spi.rx_len(), 8);
        assert_eq!(spi.tx_len(), 4);
    }

    #[test]
    fn txdata_writes_off_the_data_byte_are_ignored() {
        let (mut spi, echo) = with_echo();
        spi.write(REG_TXDATA + 1, 1, 0x7F).unwrap();
        spi.write(REG_TXDATA + 2, 2, 0x7F7F).unwrap();
        assert!(echo.borrow().seen.is_empty());
        assert_eq!(spi.tx_len(), 0);
        assert_eq!(spi.rx_len(), 0);

        spi.write(REG_TXDATA, 1, 0x3C).unwrap();
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), 0xC3);
    }

    #[test]
    fn out_of_range_chip_select_is_ignored() {
        let rec = IrqRecorder::new_shared();
        let mut spi = FifoSpi::new(FifoSpiConfig::default());
        spi.connect_cs(5, IrqLine::new(rec.clone(), 0));
        spi.write(REG_CSMODE, 4, 3).unwrap();
        assert!(rec.borrow().events().is_empty());
    }

    #[test]
    fn msb_first_reverses_on_the_wire() {
        let (mut spi, echo) = with_echo();
        spi.write(REG_TXDATA, 4, 0x01).unwrap();
        assert_eq!(echo.borrow().seen, vec![0x80]);
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), 0xFE);

        spi.write(REG_FMT, 4, FMT_DUPLEX | u64::from(FMT_LSB_FIRST)).unwrap();
        spi.write(REG_TXDATA, 4, 0x01).unwrap();
        assert_eq!(echo.borrow().seen[1], 0x01);
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), 0xFE);
    }

    #[test]
    fn rx_watermark_sets_at_the_crossing_push() {
        let (mut spi, _echo) = with_echo();
        spi.write(REG_RXMARK, 4, 3).unwrap();
        for n in 1..=3 {
            spi.write(REG_TXDATA, 4, n).unwrap();
            assert_eq!(spi.read(REG_IP, 4).unwrap() & u64::from(IP_RXWM), 0, "push {n}");
        }
        spi.write(REG_TXDATA, 4, 4).unwrap();
        assert_eq!(spi.read(REG_IP, 4).unwrap() & u64::from(IP_RXWM), u64::from(IP_RXWM));

        spi.read(REG_RXDATA, 4).unwrap();
        assert_eq!(spi.read(REG_IP, 4).unwrap() & u64::from(IP_RXWM), 0);
    }

    #[test]
    fn tx_watermark_and_interrupt_enable() {
        let rec = IrqRecorder::new_shared();
        let (mut spi, _echo) = with_echo();
        spi.connect_irq(IrqLine::new(rec.clone(), 52));

        // TX FIFO is empty, below the reset watermark of 1.
        assert_eq!(spi.read(REG_IP, 4).unwrap() & u64::from(IP_TXWM), u64::from(IP_TXWM));
        assert!(!rec.borrow().is_asserted(52));
        spi.write(REG_IE, 4, u64::from(IP_TXWM)).unwrap();
        assert!(rec.borrow().is_asserted(52));
        spi.write(REG_TXMARK, 4, 0).unwrap();
        assert!(!rec.borrow().is_asserted(52));
    }

    #[test]
    fn full_rx_stalls_transfers_until_popped() {
        let (mut spi, echo) = with_echo();
        for n in 0..10 {
            spi.write(REG_TXDATA, 4, n).unwrap();
        }
        assert_eq!(spi.rx_len(), 8);
        assert_eq!(spi.tx_len(), 2);
        assert_eq!(echo.borrow().seen.len(), 8);

        spi.read(REG_RXDATA, 4).unwrap();
        assert_eq!(spi.rx_len(), 8);
        assert_eq!(spi.tx_len(), 1);
    }

    #[test]
    fn full_tx_rejects_and_reports_full() {
        let (mut spi, _echo) = with_echo();
        for n in 0..20 {
            spi.write(REG_TXDATA, 4, n).unwrap();
        }
        assert_eq!(spi.tx_len(), 8);
        assert_eq!(spi.read(REG_TXDATA, 4).unwrap(), u64::from(DATA_FLAG));
        // The queued frames are intact: the first stalled frame is 8.
        for _ in 0..8 {
            spi.read(REG_RXDATA, 4).unwrap();
        }
        let next = spi.read(REG_RXDATA, 4).unwrap();
        assert_eq!(next, u64::from(!8u8));
    }

    #[test]
    fn chip_select_modes() {
        let rec = IrqRecorder::new_shared();
        let mut spi = FifoSpi::new(FifoSpiConfig {
            cs_width: 2,
            fifo_depth: 8,
        });
        spi.connect_cs(0, IrqLine::new(rec.clone(), 0));
        spi.connect_cs(1, IrqLine::new(rec.clone(), 1));
        spi.write(REG_CSDEF, 4, 0b11).unwrap();

        // AUTO, CSID 0: line 0 asserted (driven low against an idle-high default).
        assert!(!rec.borrow().is_asserted(0));
        assert!(rec.borrow().is_asserted(1));

        spi.write(REG_CSID, 4, 1).unwrap();
        assert!(rec.borrow().is_asserted(0));
        assert!(!rec.borrow().is_asserted(1));

        // HOLD latches line 1 even if CSID moves.
        spi.write(REG_CSMODE, 4, 2).unwrap();
        spi.write(REG_CSID, 4, 0).unwrap();
        assert!(spi.cs_asserted(1));
        assert!(!spi.cs_asserted(0));

        spi.write(REG_CSMODE, 4, 3).unwrap();
        assert!(!spi.cs_asserted(0) && !spi.cs_asserted(1));
        assert!(rec.borrow().is_asserted(0) && rec.borrow().is_asserted(1));
    }

    #[test]
    fn deselected_slave_sees_nothing() {
        let (mut spi, echo) = with_echo();
        spi.write(REG_CSMODE, 4, 3).unwrap();
        spi.write(REG_TXDATA, 4, 0x42).unwrap();
        assert!(echo.borrow().seen.is_empty());
        assert_eq!(spi.read(REG_RXDATA, 4).unwrap(), 0);
    }

    #[test]
    fn snapshot_keeps_fifo_contents() {
        let (mut spi, _echo) = with_echo();
        spi.write(REG_RXMARK, 4, 1).unwrap();
        spi.write(REG_TXDATA, 4, 0x0F).unwrap();
        spi.write(REG_TXDATA, 4, 0xF0).unwrap();
        let saved = spi.save_state();

        let mut restored = FifoSpi::new(FifoSpiConfig::default());
        restored.load_state(&saved).unwrap();
        assert_eq!(restored.save_state(), saved);
        assert_eq!(restored.read(REG_IP, 4).unwrap() & u64::from(IP_RXWM), u64::from(IP_RXWM));
        assert_eq!(restored.read(REG_RXDATA, 4).unwrap(), 0xF0);
        assert_eq!(restored.read(REG_RXDATA, 4).unwrap(), 0x0F);
    }

    #[test]
    fn snapshot_rejects_oversized_fifo() {
        let (mut spi, _echo) = with_echo();
        spi.write(REG_TXDATA, 4, 1).unwrap();
        spi.write(REG_TXDATA, 4, 2).unwrap();
        let saved = spi.save_state();

        let mut small = FifoSpi::new(FifoSpiConfig {
            cs_width: 1,
            fifo_depth: 1,
        });
        assert!(small.load_state(&saved).is_err());
    }
}
