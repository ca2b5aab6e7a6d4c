//! STM32F4-style GPIO port.
//!
//! Pin direction is derived from MODER and recomputed on every MODER write. Each pin drives one
//! [`IrqLine`] whenever its externally observable level changes; the machine wires these into
//! the interrupt-source multiplexer. External stimuli drive input levels through
//! [`GpioPort::set_input_level`] or the port's [`IrqSink`] impl (line number = pin index).

use std::fmt;

use mcusim_interrupts::{IrqLine, IrqSink};
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{
    check_access, MmioDevice, MmioError, RegisterFile, RegisterSpec, GUEST_ERROR,
};

pub const GPIO_MMIO_SIZE: u64 = 0x400;
pub const GPIO_PINS: usize = 16;

const REG_MODER: u64 = 0x00;
const REG_OTYPER: u64 = 0x04;
const REG_OSPEEDR: u64 = 0x08;
const REG_PUPDR: u64 = 0x0C;
const REG_IDR: u64 = 0x10;
const REG_ODR: u64 = 0x14;
const REG_BSRR: u64 = 0x18;
const REG_LCKR: u64 = 0x1C;
const REG_AFRL: u64 = 0x20;
const REG_AFRH: u64 = 0x24;

const IDX_MODER: usize = 0;
const IDX_OTYPER: usize = 1;
const IDX_OSPEEDR: usize = 2;
const IDX_PUPDR: usize = 3;
const IDX_IDR: usize = 4;
const IDX_ODR: usize = 5;
const IDX_BSRR: usize = 6;
const IDX_LCKR: usize = 7;
const IDX_AFRL: usize = 8;
const IDX_AFRH: usize = 9;

const LCKR_LCKK: u32 = 1 << 16;

static GPIO_REGS: &[RegisterSpec] = &[
    RegisterSpec::rw("MODER", REG_MODER, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("OTYPER", REG_OTYPER, 0, 0x0000_FFFF),
    RegisterSpec::rw("OSPEEDR", REG_OSPEEDR, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("PUPDR", REG_PUPDR, 0, 0xFFFF_FFFF),
    RegisterSpec::ro("IDR", REG_IDR, 0),
    RegisterSpec::rw("ODR", REG_ODR, 0, 0x0000_FFFF),
    RegisterSpec::wo("BSRR", REG_BSRR, 0xFFFF_FFFF),
    RegisterSpec::rw("LCKR", REG_LCKR, 0, 0x0001_FFFF),
    RegisterSpec::rw("AFRL", REG_AFRL, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("AFRH", REG_AFRH, 0, 0xFFFF_FFFF),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortId {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
}

impl PortId {
    pub const ALL: [PortId; 9] = [
        PortId::A,
        PortId::B,
        PortId::C,
        PortId::D,
        PortId::E,
        PortId::F,
        PortId::G,
        PortId::H,
        PortId::I,
    ];

    /// Selector value used by the interrupt-source multiplexer (A = 0).
    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    fn name(self) -> &'static str {
        ["GPIOA", "GPIOB", "GPIOC", "GPIOD", "GPIOE", "GPIOF", "GPIOG", "GPIOH", "GPIOI"]
            [self as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
    Alternate,
    Analog,
}

impl PinDirection {
    fn from_mode(bits: u32) -> Self {
        match bits & 0b11 {
            0 => PinDirection::Input,
            1 => PinDirection::Output,
            2 => PinDirection::Alternate,
            _ => PinDirection::Analog,
        }
    }
}

/// Snapshot of one pin as seen from outside the chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pin {
    pub port: PortId,
    pub index: u8,
    pub direction: PinDirection,
    pub level: bool,
}

pub type PinObserver = Box<dyn FnMut(Pin)>;

pub struct GpioPort {
    port: PortId,
    regs: RegisterFile,
    /// Levels driven onto the pins from outside the chip.
    input_levels: u16,
    output_mask: u16,
    input_mask: u16,
    /// Last level reported on each pin line.
    observable: u16,
    lock_seq: u8,
    lock_key: u16,
    lines: [IrqLine; GPIO_PINS],
    observer: Option<PinObserver>,
}

impl fmt::Debug for GpioPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioPort")
            .field("port", &self.port)
            .field("moder", &self.regs.get(IDX_MODER))
            .field("odr", &self.regs.get(IDX_ODR))
            .field("input_levels", &self.input_levels)
            .field("observable", &self.observable)
            .finish_non_exhaustive()
    }
}

impl GpioPort {
    pub fn new(port: PortId) -> Self {
        // Ports A and B come out of reset with the debug pins in alternate-function mode.
        let regs = match port {
            PortId::A => RegisterFile::new(port.name(), GPIO_REGS)
                .with_reset_value(REG_MODER, 0xA800_0000)
                .with_reset_value(REG_PUPDR, 0x6400_0000),
            PortId::B => RegisterFile::new(port.name(), GPIO_REGS)
                .with_reset_value(REG_MODER, 0x0000_0280)
                .with_reset_value(REG_OSPEEDR, 0x0000_00C0)
                .with_reset_value(REG_PUPDR, 0x0000_0100),
            _ => RegisterFile::new(port.name(), GPIO_REGS),
        };
        let mut gpio = Self {
            port,
            regs,
            input_levels: 0,
            output_mask: 0,
            input_mask: 0,
            observable: 0,
            lock_seq: 0,
            lock_key: 0,
            lines: std::array::from_fn(|_| IrqLine::disconnected()),
            observer: None,
        };
        gpio.update_direction();
        gpio.observable = gpio.compute_observable();
        gpio
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn connect_pin(&mut self, pin: usize, line: IrqLine) {
        let Some(slot) = self.lines.get_mut(pin) else {
            tracing::warn!(port = ?self.port, "pin {pin} out of range, not connected");
            return;
        };
        *slot = line;
    }

    pub fn set_observer(&mut self, observer: PinObserver) {
        self.observer = Some(observer);
    }

    pub fn pin(&self, index: usize) -> Pin {
        Pin {
            port: self.port,
            index: index as u8,
            direction: self.direction(index),
            level: self.observable & (1 << index) != 0,
        }
    }

    pub fn direction(&self, index: usize) -> PinDirection {
        PinDirection::from_mode(self.regs.get(IDX_MODER) >> (index * 2))
    }

    /// Externally observable pin levels, one bit per pin.
    pub fn levels(&self) -> u16 {
        self.observable
    }

    pub fn odr(&self) -> u16 {
        self.regs.get(IDX_ODR) as u16
    }

    pub fn is_locked(&self) -> bool {
        self.regs.get(IDX_LCKR) & LCKR_LCKK != 0
    }

    /// Drives pin `index` from outside the chip.
    pub fn set_input_level(&mut self, index: usize, level: bool) {
        if index >= GPIO_PINS {
            tracing::warn!(target: GUEST_ERROR, port = ?self.port, "input level for pin {index} ignored");
            return;
        }
        let bit = 1u16 << index;
        if level {
            self.input_levels |= bit;
        } else {
            self.input_levels &= !bit;
        }
        self.refresh();
    }

    fn update_direction(&mut self) {
        let moder = self.regs.get(IDX_MODER);
        let mut output = 0u16;
        let mut input = 0u16;
        for pin in 0..GPIO_PINS {
            match PinDirection::from_mode(moder >> (pin * 2)) {
                PinDirection::Output => output |= 1 << pin,
                PinDirection::Input => input |= 1 << pin,
                _ => {}
            }
        }
        self.output_mask = output;
        self.input_mask = input;
    }

    fn compute_observable(&self) -> u16 {
        let odr = self.odr();
        (odr & self.output_mask) | (self.input_levels & !self.output_mask)
    }

    /// Recomputes IDR and the observable levels, reporting every pin whose level changed.
    fn refresh(&mut self) {
        self.regs
            .set(IDX_IDR, u32::from(self.input_levels & self.input_mask));

        let now = self.compute_observable();
        let changed = now ^ self.observable;
        self.observable = now;
        if changed == 0 {
            return;
        }
        for index in 0..GPIO_PINS {
            if changed & (1 << index) == 0 {
                continue;
            }
            let pin = self.pin(index);
            tracing::trace!(port = ?self.port, pin = index, level = pin.level, "pin changed");
            self.lines[index].set_level(pin.level);
            if let Some(observer) = self.observer.as_mut() {
                observer(pin);
            }
        }
    }

    /// Drops bits of an output-register update that target non-output pins.
    fn mask_output_write(&self, what: &str, requested: u16, current: u16) -> u16 {
        let rejected = (requested ^ current) & !self.output_mask;
        if rejected != 0 {
            tracing::warn!(
                target: GUEST_ERROR,
                port = ?self.port,
                "{what} write to non-output pins {rejected:#06x} ignored"
            );
        }
        (current & !self.output_mask) | (requested & self.output_mask)
    }

    fn write_lckr(&mut self, old: u32, new: u32) {
        if old & LCKR_LCKK != 0 {
            // Locked until reset.
            self.regs.set(IDX_LCKR, old);
            tracing::warn!(target: GUEST_ERROR, port = ?self.port, "LCKR write while locked ignored");
            return;
        }
        let key = new as u16;
        let lckk = new & LCKR_LCKK != 0;
        self.lock_seq = match (self.lock_seq, lckk) {
            (1, false) if key == self.lock_key => 2,
            (2, true) if key == self.lock_key => 3,
            (_, true) => {
                self.lock_key = key;
                1
            }
            _ => 0,
        };
        if self.lock_seq == 3 {
            tracing::debug!(port = ?self.port, pins = key, "configuration locked");
            self.regs.set(IDX_LCKR, u32::from(key) | LCKR_LCKK);
            self.lock_seq = 0;
        } else {
            // LCKK only reads back as set once the lock is active.
            self.regs.set(IDX_LCKR, new & !LCKR_LCKK);
        }
    }

    /// Restores the configuration fields of locked pins after a write to a lockable register.
    fn restore_locked_fields(&mut self, index: usize, old: u32) {
        let locked = if self.is_locked() {
            self.regs.get(IDX_LCKR) as u16
        } else {
            return;
        };
        let (width, first_pin) = match index {
            IDX_MODER | IDX_OSPEEDR | IDX_PUPDR => (2, 0),
            IDX_OTYPER => (1, 0),
            IDX_AFRL => (4, 0),
            IDX_AFRH => (4, 8),
            _ => return,
        };
        let mut mask = 0u32;
        let field = (1u32 << width) - 1;
        for slot in 0..(32 / width) {
            let pin = first_pin + slot;
            if pin < GPIO_PINS && locked & (1 << pin) != 0 {
                mask |= field << (slot * width);
            }
        }
        let new = self.regs.get(index);
        if (new ^ old) & mask != 0 {
            tracing::warn!(
                target: GUEST_ERROR,
                port = ?self.port,
                "write to locked configuration bits {:#010x} ignored",
                (new ^ old) & mask
            );
        }
        self.regs.set(index, (new & !mask) | (old & mask));
    }

    fn write_reg(&mut self, offset: u64, size: usize, value: u32) {
        let Some(w) = self.regs.write(offset, size, value) else {
            return;
        };
        match w.index {
            IDX_MODER => {
                self.restore_locked_fields(w.index, w.old);
                self.update_direction();
            }
            IDX_OTYPER | IDX_OSPEEDR | IDX_PUPDR | IDX_AFRL | IDX_AFRH => {
                self.restore_locked_fields(w.index, w.old);
            }
            IDX_ODR => {
                let applied = self.mask_output_write("ODR", w.new as u16, w.old as u16);
                self.regs.set(IDX_ODR, u32::from(applied));
            }
            IDX_BSRR => {
                let odr = self.odr();
                let set = (w.data & 0xFFFF) as u16;
                let clear = (w.data >> 16) as u16;
                // Clear first, then set: set wins on a simultaneous request.
                let requested = (odr & !clear) | set;
                let applied = self.mask_output_write("BSRR", requested, odr);
                self.regs.set(IDX_ODR, u32::from(applied));
                self.regs.set(IDX_BSRR, 0);
            }
            IDX_LCKR => self.write_lckr(w.old, w.new),
            _ => {}
        }
        self.refresh();
    }

    fn read_reg(&self, offset: u64, size: usize) -> u32 {
        self.regs.read(offset, size).unwrap_or_else(|| {
            tracing::warn!(
                target: GUEST_ERROR,
                port = ?self.port,
                "read of reserved offset {offset:#x} (size {size})"
            );
            0
        })
    }
}

impl MmioDevice for GpioPort {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        check_access(GPIO_MMIO_SIZE, offset, size)?;
        Ok(u64::from(self.read_reg(offset, size)))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        check_access(GPIO_MMIO_SIZE, offset, size)?;
        self.write_reg(offset, size, value as u32);
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
        self.lock_seq = 0;
        self.lock_key = 0;
        self.update_direction();
        self.refresh();
    }
}

impl IrqSink for GpioPort {
    fn set_irq(&mut self, line: u32, level: bool) {
        self.set_input_level(line as usize, level);
    }
}

impl IoSnapshot for GpioPort {
    const DEVICE_ID: [u8; 4] = *b"GPIO";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_PORT: u16 = 1;
        const TAG_REGS: u16 = 2;
        const TAG_INPUT_LEVELS: u16 = 3;
        const TAG_LOCK_SEQ: u16 = 4;
        const TAG_LOCK_KEY: u16 = 5;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u8(TAG_PORT, self.port.index() as u8);
        w.field_bytes(TAG_REGS, self.regs.save());
        w.field_u16(TAG_INPUT_LEVELS, self.input_levels);
        w.field_u8(TAG_LOCK_SEQ, self.lock_seq);
        w.field_u16(TAG_LOCK_KEY, self.lock_key);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_PORT: u16 = 1;
        const TAG_REGS: u16 = 2;
        const TAG_INPUT_LEVELS: u16 = 3;
        const TAG_LOCK_SEQ: u16 = 4;
        const TAG_LOCK_KEY: u16 = 5;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        if let Some(port) = r.u8(TAG_PORT)? {
            if u32::from(port) != self.port.index() {
                return Err(SnapshotError::InvalidFieldEncoding("gpio port mismatch"));
            }
        }

        self.regs.reset();
        if let Some(buf) = r.bytes(TAG_REGS) {
            self.regs.load(buf)?;
        }
        self.input_levels = r.u16(TAG_INPUT_LEVELS)?.unwrap_or(0);
        self.lock_seq = r.u8(TAG_LOCK_SEQ)?.unwrap_or(0).min(2);
        self.lock_key = r.u16(TAG_LOCK_KEY)?.unwrap_or(0);

        self.update_direction();
        self.regs
            .set(IDX_IDR, u32::from(self.input_levels & self.input_mask));
        // Downstream latches restore their own state; do not replay edges.
        self.observable = self.compute_observable();
        Ok(())
    }
}
