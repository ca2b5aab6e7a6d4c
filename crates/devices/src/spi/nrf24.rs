//! nRF24L01+ 2.4 GHz transceiver, register and payload-FIFO view only.
//!
//! There is no RF model. The host injects received packets with [`Nrf24l01Plus::receive`] and
//! collects transmitted ones with [`Nrf24l01Plus::take_transmitted`]. Every chip-select assertion
//! starts a new command; the first byte of a command always shifts out STATUS. The radio shifts
//! MSB first, so bytes are decoded from shift-order frames by bit reversal.

use std::collections::VecDeque;

use mcusim_interrupts::IrqLine;
use mcusim_io_snapshot::codec::{Decoder, Encoder};
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{GUEST_ERROR, UNIMP};

use super::{reverse_bits, SsiPeripheral};

pub const NRF24_PAYLOAD_MAX: usize = 32;
pub const NRF24_FIFO_DEPTH: usize = 3;

const CMD_R_REGISTER: u8 = 0x00;
const CMD_W_REGISTER: u8 = 0x20;
const CMD_R_RX_PL_WID: u8 = 0x60;
const CMD_R_RX_PAYLOAD: u8 = 0x61;
const CMD_W_TX_PAYLOAD: u8 = 0xA0;
const CMD_FLUSH_TX: u8 = 0xE1;
const CMD_FLUSH_RX: u8 = 0xE2;
const CMD_REUSE_TX_PL: u8 = 0xE3;
const CMD_NOP: u8 = 0xFF;

const REG_CONFIG: usize = 0x00;
const REG_SETUP_AW: usize = 0x03;
const REG_STATUS: usize = 0x07;
const REG_OBSERVE_TX: usize = 0x08;
const REG_RPD: usize = 0x09;
const REG_RX_ADDR_P0: usize = 0x0A;
const REG_RX_ADDR_P1: usize = 0x0B;
const REG_TX_ADDR: usize = 0x10;
const REG_FIFO_STATUS: usize = 0x17;
const REG_COUNT: usize = 0x1E;

const STATUS_IRQS: u8 = 0x70;
const STATUS_RX_DR: u8 = 1 << 6;
const STATUS_TX_DS: u8 = 1 << 5;

/// Power-on value and writable mask for each single-byte register.
const REGISTERS: [(u8, u8); REG_COUNT] = [
    (0x08, 0x7F), // CONFIG
    (0x3F, 0x3F), // EN_AA
    (0x03, 0x3F), // EN_RXADDR
    (0x03, 0x03), // SETUP_AW
    (0x03, 0xFF), // SETUP_RETR
    (0x02, 0x7F), // RF_CH
    (0x0E, 0xBE), // RF_SETUP
    (0x0E, 0x70), // STATUS
    (0x00, 0x00), // OBSERVE_TX
    (0x00, 0x00), // RPD
    (0x00, 0x00), // RX_ADDR_P0 (multi-byte)
    (0x00, 0x00), // RX_ADDR_P1 (multi-byte)
    (0xC3, 0xFF), // RX_ADDR_P2
    (0xC4, 0xFF), // RX_ADDR_P3
    (0xC5, 0xFF), // RX_ADDR_P4
    (0xC6, 0xFF), // RX_ADDR_P5
    (0x00, 0x00), // TX_ADDR (multi-byte)
    (0x00, 0x3F), // RX_PW_P0
    (0x00, 0x3F), // RX_PW_P1
    (0x00, 0x3F), // RX_PW_P2
    (0x00, 0x3F), // RX_PW_P3
    (0x00, 0x3F), // RX_PW_P4
    (0x00, 0x3F), // RX_PW_P5
    (0x11, 0x00), // FIFO_STATUS
    (0x00, 0x00),
    (0x00, 0x00),
    (0x00, 0x00),
    (0x00, 0x00),
    (0x00, 0x3F), // DYNPD
    (0x00, 0x07), // FEATURE
];

const RESET_ADDR_P0: [u8; 5] = [0xE7; 5];
const RESET_ADDR_P1: [u8; 5] = [0xC2; 5];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Idle,
    ReadRegister { reg: usize, pos: usize },
    WriteRegister { reg: usize, pos: usize },
    ReadPayloadWidth,
    ReadPayload { pos: usize },
    WritePayload { data: Vec<u8> },
    /// Command fully handled on its first byte; trailing bytes are clocked out as zero.
    Done,
}

pub struct Nrf24l01Plus {
    regs: [u8; REG_COUNT],
    rx_addr_p0: [u8; 5],
    rx_addr_p1: [u8; 5],
    tx_addr: [u8; 5],
    rx_fifo: VecDeque<Vec<u8>>,
    tx_fifo: VecDeque<Vec<u8>>,
    command: Command,
    irq: IrqLine,
}

impl std::fmt::Debug for Nrf24l01Plus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nrf24l01Plus")
            .field("status", &self.status())
            .field("rx_fifo", &self.rx_fifo.len())
            .field("tx_fifo", &self.tx_fifo.len())
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl Default for Nrf24l01Plus {
    fn default() -> Self {
        Self::new()
    }
}

impl Nrf24l01Plus {
    pub fn new() -> Self {
        Self {
            regs: REGISTERS.map(|(reset, _)| reset),
            rx_addr_p0: RESET_ADDR_P0,
            rx_addr_p1: RESET_ADDR_P1,
            tx_addr: RESET_ADDR_P0,
            rx_fifo: VecDeque::new(),
            tx_fifo: VecDeque::new(),
            command: Command::Idle,
            irq: IrqLine::disconnected(),
        }
    }

    /// IRQ pin, modeled active-high: asserted while an unmasked STATUS interrupt is latched.
    pub fn connect_irq(&mut self, irq: IrqLine) {
        self.irq = irq;
        self.update_irq();
    }

    pub fn reset(&mut self) {
        let irq = std::mem::take(&mut self.irq);
        *self = Self::new();
        self.irq = irq;
        self.update_irq();
    }

    fn address_width(&self) -> usize {
        match self.regs[REG_SETUP_AW] & 0b11 {
            0b01 => 3,
            0b10 => 4,
            _ => 5,
        }
    }

    pub fn status(&self) -> u8 {
        let latched = self.regs[REG_STATUS] & STATUS_IRQS;
        let rx_pipe = if self.rx_fifo.is_empty() { 0b111 } else { 0 };
        let tx_full = u8::from(self.tx_fifo.len() >= NRF24_FIFO_DEPTH);
        latched | (rx_pipe << 1) | tx_full
    }

    fn fifo_status(&self) -> u8 {
        let mut v = 0;
        if self.rx_fifo.is_empty() {
            v |= 1 << 0;
        }
        if self.rx_fifo.len() >= NRF24_FIFO_DEPTH {
            v |= 1 << 1;
        }
        if self.tx_fifo.is_empty() {
            v |= 1 << 4;
        }
        if self.tx_fifo.len() >= NRF24_FIFO_DEPTH {
            v |= 1 << 5;
        }
        v
    }

    /// Current value of register `reg`, multi-byte registers LSByte first.
    pub fn register(&self, reg: usize) -> Vec<u8> {
        let aw = self.address_width();
        match reg {
            REG_RX_ADDR_P0 => self.rx_addr_p0[..aw].to_vec(),
            REG_RX_ADDR_P1 => self.rx_addr_p1[..aw].to_vec(),
            REG_TX_ADDR => self.tx_addr[..aw].to_vec(),
            REG_STATUS => vec![self.status()],
            REG_FIFO_STATUS => vec![self.fifo_status()],
            r if r < REG_COUNT => vec![self.regs[r]],
            _ => vec![0],
        }
    }

    fn write_register_byte(&mut self, reg: usize, pos: usize, value: u8) {
        match reg {
            REG_RX_ADDR_P0 | REG_RX_ADDR_P1 | REG_TX_ADDR => {
                if pos >= self.address_width() {
                    return;
                }
                let addr = match reg {
                    REG_RX_ADDR_P0 => &mut self.rx_addr_p0,
                    REG_RX_ADDR_P1 => &mut self.rx_addr_p1,
                    _ => &mut self.tx_addr,
                };
                addr[pos] = value;
            }
            _ if pos > 0 => {}
            REG_STATUS => {
                self.regs[REG_STATUS] &= !(value & STATUS_IRQS);
                self.update_irq();
            }
            REG_OBSERVE_TX | REG_RPD | REG_FIFO_STATUS => {
                tracing::warn!(target: GUEST_ERROR, reg, "nRF24 write to read-only register");
            }
            r if r < REG_COUNT => {
                let mask = REGISTERS[r].1;
                self.regs[r] = (self.regs[r] & !mask) | (value & mask);
                if r == REG_CONFIG {
                    self.update_irq();
                }
            }
            _ => {
                tracing::warn!(target: GUEST_ERROR, reg, "nRF24 write to reserved register");
            }
        }
    }

    fn update_irq(&self) {
        // CONFIG bits 6..4 mask the matching STATUS sources.
        let unmasked = self.regs[REG_STATUS] & !self.regs[REG_CONFIG] & STATUS_IRQS;
        self.irq.set_level(unmasked != 0);
    }

    /// Over-the-air packet arriving. Returns `false` if the RX FIFO is full.
    pub fn receive(&mut self, payload: &[u8]) -> bool {
        if self.rx_fifo.len() >= NRF24_FIFO_DEPTH {
            tracing::debug!("nRF24 RX FIFO full, packet lost");
            return false;
        }
        let len = payload.len().min(NRF24_PAYLOAD_MAX);
        self.rx_fifo.push_back(payload[..len].to_vec());
        self.regs[REG_STATUS] |= STATUS_RX_DR;
        self.update_irq();
        true
    }

    /// Pops the oldest queued TX payload, as if it had been sent and acknowledged.
    pub fn take_transmitted(&mut self) -> Option<Vec<u8>> {
        let payload = self.tx_fifo.pop_front()?;
        self.regs[REG_STATUS] |= STATUS_TX_DS;
        self.update_irq();
        Some(payload)
    }

    fn start_command(&mut self, cmd: u8) -> Command {
        match cmd {
            c if c & 0xE0 == CMD_R_REGISTER => Command::ReadRegister {
                reg: usize::from(c & 0x1F),
                pos: 0,
            },
            c if c & 0xE0 == CMD_W_REGISTER => Command::WriteRegister {
                reg: usize::from(c & 0x1F),
                pos: 0,
            },
            CMD_R_RX_PL_WID => Command::ReadPayloadWidth,
            CMD_R_RX_PAYLOAD => Command::ReadPayload { pos: 0 },
            CMD_W_TX_PAYLOAD => Command::WritePayload { data: Vec::new() },
            CMD_FLUSH_TX => {
                self.tx_fifo.clear();
                Command::Done
            }
            CMD_FLUSH_RX => {
                self.rx_fifo.clear();
                Command::Done
            }
            CMD_NOP => Command::Done,
            CMD_REUSE_TX_PL => {
                tracing::warn!(target: UNIMP, "nRF24 REUSE_TX_PL not modeled");
                Command::Done
            }
            other => {
                tracing::warn!(target: UNIMP, cmd = other, "nRF24 command not modeled");
                Command::Done
            }
        }
    }

    fn finish_command(&mut self) {
        match std::mem::replace(&mut self.command, Command::Idle) {
            Command::WritePayload { data } if !data.is_empty() => {
                if self.tx_fifo.len() >= NRF24_FIFO_DEPTH {
                    tracing::warn!(target: GUEST_ERROR, "nRF24 TX FIFO full, payload dropped");
                } else {
                    self.tx_fifo.push_back(data);
                }
            }
            Command::ReadPayload { pos } if pos > 0 => {
                self.rx_fifo.pop_front();
                self.update_irq();
            }
            _ => {}
        }
    }

    fn exchange(&mut self, byte: u8) -> u8 {
        match &mut self.command {
            Command::Idle => {
                let status = self.status();
                self.command = self.start_command(byte);
                status
            }
            Command::ReadRegister { reg, pos } => {
                let (reg, at) = (*reg, *pos);
                *pos += 1;
                self.register(reg).get(at).copied().unwrap_or(0)
            }
            Command::WriteRegister { reg, pos } => {
                let (reg, at) = (*reg, *pos);
                *pos += 1;
                self.write_register_byte(reg, at, byte);
                0
            }
            Command::ReadPayloadWidth => {
                self.command = Command::Done;
                self.rx_fifo.front().map_or(0, |p| p.len() as u8)
            }
            Command::ReadPayload { pos } => {
                let at = *pos;
                *pos += 1;
                self.rx_fifo
                    .front()
                    .and_then(|p| p.get(at))
                    .copied()
                    .unwrap_or(0)
            }
            Command::WritePayload { data } => {
                if data.len() < NRF24_PAYLOAD_MAX {
                    data.push(byte);
                }
                0
            }
            Command::Done => 0,
        }
    }
}

impl SsiPeripheral for Nrf24l01Plus {
    fn transfer(&mut self, tx: u32) -> u32 {
        let byte = reverse_bits(tx, 8) as u8;
        reverse_bits(u32::from(self.exchange(byte)), 8)
    }

    fn set_selected(&mut self, selected: bool) {
        // Either edge ends the previous command; assertion starts decoding afresh.
        self.finish_command();
        tracing::trace!(selected, "nRF24 chip select");
    }
}

impl IoSnapshot for Nrf24l01Plus {
    const DEVICE_ID: [u8; 4] = *b"NRF2";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_REGS: u16 = 1;
        const TAG_ADDRS: u16 = 2;
        const TAG_RX_FIFO: u16 = 3;
        const TAG_TX_FIFO: u16 = 4;

        let fifo = |q: &VecDeque<Vec<u8>>| {
            q.iter()
                .fold(Encoder::new().u32(q.len() as u32), |e, p| e.vec_u8(p))
                .finish()
        };

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_REGS, Encoder::new().vec_u8(&self.regs).finish());
        w.field_bytes(
            TAG_ADDRS,
            Encoder::new()
                .bytes(&self.rx_addr_p0)
                .bytes(&self.rx_addr_p1)
                .bytes(&self.tx_addr)
                .finish(),
        );
        w.field_bytes(TAG_RX_FIFO, fifo(&self.rx_fifo));
        w.field_bytes(TAG_TX_FIFO, fifo(&self.tx_fifo));
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_REGS: u16 = 1;
        const TAG_ADDRS: u16 = 2;
        const TAG_RX_FIFO: u16 = 3;
        const TAG_TX_FIFO: u16 = 4;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let fifo = |tag: u16| -> SnapshotResult<VecDeque<Vec<u8>>> {
            let mut q = VecDeque::new();
            let Some(buf) = r.bytes(tag) else {
                return Ok(q);
            };
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > NRF24_FIFO_DEPTH {
                return Err(SnapshotError::InvalidFieldEncoding("nRF24 fifo too deep"));
            }
            for _ in 0..count {
                q.push_back(d.vec_u8(NRF24_PAYLOAD_MAX, "nRF24 payload too long")?);
            }
            d.finish()?;
            Ok(q)
        };
        let rx_fifo = fifo(TAG_RX_FIFO)?;
        let tx_fifo = fifo(TAG_TX_FIFO)?;

        self.reset();
        if let Some(buf) = r.bytes(TAG_REGS) {
            let mut d = Decoder::new(buf);
            let regs = d.vec_u8(REG_COUNT, "too many nRF24 registers")?;
            d.finish()?;
            if regs.len() != REG_COUNT {
                return Err(SnapshotError::InvalidFieldEncoding("nRF24 register count"));
            }
            self.regs.copy_from_slice(&regs);
        }
        if let Some(buf) = r.bytes(TAG_ADDRS) {
            let mut d = Decoder::new(buf);
            self.rx_addr_p0.copy_from_slice(d.bytes(5)?);
            self.rx_addr_p1.copy_from_slice(d.bytes(5)?);
            self.tx_addr.copy_from_slice(d.bytes(5)?);
            d.finish()?;
        }
        self.rx_fifo = rx_fifo;
        self.tx_fifo = tx_fifo;
        self.update_irq();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcusim_interrupts::IrqRecorder;

    /// Shifts one byte MSB first, the way an SPI master would.
    fn shift(radio: &mut Nrf24l01Plus, byte: u8) -> u8 {
        (radio.transfer(u32::from(byte.reverse_bits())) as u8).reverse_bits()
    }

    /// Runs one chip-select framed command and returns every byte shifted out.
    fn command(radio: &mut Nrf24l01Plus, bytes: &[u8]) -> Vec<u8> {
        radio.set_selected(true);
        let out = bytes
            .iter()
            .map(|&b| shift(radio, b))
            .collect();
        radio.set_selected(false);
        out
    }

    #[test]
    fn command_byte_returns_status() {
        let mut radio = Nrf24l01Plus::new();
        assert_eq!(command(&mut radio, &[CMD_NOP]), vec![0x0E]);
    }

    #[test]
    fn register_read_and_write() {
        let mut radio = Nrf24l01Plus::new();
        assert_eq!(command(&mut radio, &[0x05, CMD_NOP]), vec![0x0E, 0x02]);

        command(&mut radio, &[0x20 | 0x05, 0x4C]);
        assert_eq!(radio.register(0x05), vec![0x4C]);

        // RF_CH bit 7 is reserved.
        command(&mut radio, &[0x20 | 0x05, 0xFF]);
        assert_eq!(radio.register(0x05), vec![0x7F]);
    }

    #[test]
    fn address_registers_are_multi_byte() {
        let mut radio = Nrf24l01Plus::new();
        assert_eq!(
            command(&mut radio, &[0x0A, 0, 0, 0, 0, 0]),
            vec![0x0E, 0xE7, 0xE7, 0xE7, 0xE7, 0xE7]
        );
        command(&mut radio, &[0x20 | 0x10, 1, 2, 3, 4, 5]);
        assert_eq!(radio.register(0x10), vec![1, 2, 3, 4, 5]);

        // Three-byte addresses.
        command(&mut radio, &[0x20 | 0x03, 0x01]);
        assert_eq!(radio.register(0x10), vec![1, 2, 3]);
    }

    #[test]
    fn chip_select_restarts_decoding() {
        let mut radio = Nrf24l01Plus::new();
        radio.set_selected(true);
        shift(&mut radio, 0x20 | 0x05);
        // Deselect before the data byte: the next byte is a fresh command.
        radio.set_selected(false);
        radio.set_selected(true);
        assert_eq!(shift(&mut radio, 0x05), 0x0E);
        assert_eq!(shift(&mut radio, CMD_NOP), 0x02);
    }

    #[test]
    fn tx_payload_round_trip() {
        let mut radio = Nrf24l01Plus::new();
        command(&mut radio, &[CMD_W_TX_PAYLOAD, 0xDE, 0xAD]);
        assert_eq!(radio.register(REG_FIFO_STATUS), vec![0x01]);

        assert_eq!(radio.take_transmitted(), Some(vec![0xDE, 0xAD]));
        assert_eq!(radio.status() & STATUS_TX_DS, STATUS_TX_DS);
        assert_eq!(radio.take_transmitted(), None);

        // STATUS interrupt bits are write-one-to-clear.
        command(&mut radio, &[0x20 | 0x07, STATUS_TX_DS]);
        assert_eq!(radio.status(), 0x0E);
    }

    #[test]
    fn rx_payload_read_pops_on_deselect() {
        let rec = IrqRecorder::new_shared();
        let mut radio = Nrf24l01Plus::new();
        radio.connect_irq(IrqLine::new(rec.clone(), 0));

        assert!(radio.receive(&[1, 2, 3]));
        assert!(rec.borrow().is_asserted(0));
        assert_eq!(radio.status() & 0x0E, 0);

        assert_eq!(command(&mut radio, &[CMD_R_RX_PL_WID, 0]), vec![0x40, 3]);
        assert_eq!(
            command(&mut radio, &[CMD_R_RX_PAYLOAD, 0, 0, 0]),
            vec![0x40, 1, 2, 3]
        );
        assert_eq!(radio.status() & 0x0E, 0x0E);

        command(&mut radio, &[0x20 | 0x07, STATUS_RX_DR]);
        assert!(!rec.borrow().is_asserted(0));
    }

    #[test]
    fn masked_sources_keep_irq_low() {
        let rec = IrqRecorder::new_shared();
        let mut radio = Nrf24l01Plus::new();
        radio.connect_irq(IrqLine::new(rec.clone(), 0));
        command(&mut radio, &[0x20, 0x08 | 0x40]);
        radio.receive(&[9]);
        assert!(!rec.borrow().is_asserted(0));
    }

    #[test]
    fn fifo_limits_and_flush() {
        let mut radio = Nrf24l01Plus::new();
        for n in 0..4 {
            assert_eq!(radio.receive(&[n]), n < 3);
        }
        assert_eq!(radio.register(REG_FIFO_STATUS), vec![0x12]);
        command(&mut radio, &[CMD_FLUSH_RX]);
        assert_eq!(radio.register(REG_FIFO_STATUS), vec![0x11]);

        for _ in 0..4 {
            command(&mut radio, &[CMD_W_TX_PAYLOAD, 1]);
        }
        assert_eq!(radio.status() & 1, 1);
        command(&mut radio, &[CMD_FLUSH_TX]);
        assert_eq!(radio.status() & 1, 0);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut radio = Nrf24l01Plus::new();
        command(&mut radio, &[0x20 | 0x05, 0x10]);
        command(&mut radio, &[CMD_W_TX_PAYLOAD, 7, 8]);
        radio.receive(&[4, 5, 6]);
        let saved = radio.save_state();

        let mut restored = Nrf24l01Plus::new();
        restored.load_state(&saved).unwrap();
        assert_eq!(restored.save_state(), saved);
        assert_eq!(restored.take_transmitted(), Some(vec![7, 8]));
    }
}
