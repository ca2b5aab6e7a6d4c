//! General-purpose timer (TIM2..TIM5 style).
//!
//! The counter is never stepped. It is derived from the virtual clock on demand:
//!
//! `counter = (base + floor(ticks(now - origin) / (PSC + 1))) mod (ARR + 1)`
//!
//! Writes to CNT, PSC or ARR re-base `(origin, base)` at the current counter value and re-arm a
//! one-shot alarm at the next wrap. Stopping the counter folds the elapsed ticks into `base`, so
//! a later start resumes where it left off. When the alarm fires the counter is recomputed and
//! an update event is raised only if it is exactly zero.

use bitflags::bitflags;
use mcusim_interrupts::IrqLine;
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{
    check_access, MmioDevice, MmioError, RegisterFile, RegisterSpec, GUEST_ERROR, UNIMP,
};
use mcusim_time::{ns_from_ticks_ceil, ticks_from_ns, Alarm};

use crate::DeviceTimer;

pub const TIMER_MMIO_SIZE: u64 = 0x400;

const REG_CR1: u64 = 0x00;
const REG_CR2: u64 = 0x04;
const REG_SMCR: u64 = 0x08;
const REG_DIER: u64 = 0x0C;
const REG_SR: u64 = 0x10;
const REG_EGR: u64 = 0x14;
const REG_CCMR1: u64 = 0x18;
const REG_CCMR2: u64 = 0x1C;
const REG_CCER: u64 = 0x20;
const REG_CNT: u64 = 0x24;
const REG_PSC: u64 = 0x28;
const REG_ARR: u64 = 0x2C;
const REG_CCR1: u64 = 0x34;
const REG_DCR: u64 = 0x48;
const REG_DMAR: u64 = 0x4C;
const REG_OR: u64 = 0x50;

const IDX_CR1: usize = 0;
const IDX_SMCR: usize = 2;
const IDX_DIER: usize = 3;
const IDX_SR: usize = 4;
const IDX_EGR: usize = 5;
const IDX_CCMR1: usize = 6;
const IDX_CCER: usize = 8;
const IDX_CNT: usize = 9;
const IDX_PSC: usize = 10;
const IDX_ARR: usize = 11;
const IDX_CCR1: usize = 12;
const IDX_CCR4: usize = 15;
const IDX_DCR: usize = 16;
const IDX_DMAR: usize = 17;

static TIMER_REGS: &[RegisterSpec] = &[
    RegisterSpec::rw("CR1", REG_CR1, 0, 0x0000_03FF),
    RegisterSpec::rw("CR2", REG_CR2, 0, 0x0000_00F8),
    RegisterSpec::rw("SMCR", REG_SMCR, 0, 0x0000_FFF7),
    RegisterSpec::rw("DIER", REG_DIER, 0, 0x0000_5F5F),
    RegisterSpec::w1c("SR", REG_SR, 0, 0x0000_1E5F),
    RegisterSpec::wo("EGR", REG_EGR, 0x0000_005F),
    RegisterSpec::rw("CCMR1", REG_CCMR1, 0, 0x0000_FFFF),
    RegisterSpec::rw("CCMR2", REG_CCMR2, 0, 0x0000_FFFF),
    RegisterSpec::rw("CCER", REG_CCER, 0, 0x0000_BBBB),
    RegisterSpec::rw("CNT", REG_CNT, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("PSC", REG_PSC, 0, 0x0000_FFFF),
    RegisterSpec::rw("ARR", REG_ARR, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("CCR1", REG_CCR1, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("CCR2", 0x38, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("CCR3", 0x3C, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("CCR4", 0x40, 0, 0xFFFF_FFFF),
    RegisterSpec::rw("DCR", REG_DCR, 0, 0x0000_1F1F),
    RegisterSpec::rw("DMAR", REG_DMAR, 0, 0x0000_FFFF),
    RegisterSpec::rw("OR", REG_OR, 0, 0x0000_0CC0),
];

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Cr1: u32 {
        const CEN = 1 << 0;
        const UDIS = 1 << 1;
        const URS = 1 << 2;
        const OPM = 1 << 3;
        const DIR = 1 << 4;
        const CMS = 0b11 << 5;
        const ARPE = 1 << 7;
    }
}

bitflags! {
    /// Shared layout of SR, DIER (interrupt half) and EGR.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct Status: u32 {
        const UIF = 1 << 0;
        const CC1IF = 1 << 1;
        const CC2IF = 1 << 2;
        const CC3IF = 1 << 3;
        const CC4IF = 1 << 4;
        const TIF = 1 << 6;
    }
}

const SMCR_SMS: u32 = 0b111;
const OCM_PWM1: u32 = 0b110;
const OCM_PWM2: u32 = 0b111;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    /// Counter input clock, before the prescaler.
    pub clock_hz: u64,
    /// 16 (TIM3/TIM4) or 32 (TIM2/TIM5).
    pub counter_bits: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            clock_hz: 1_000_000_000,
            counter_bits: 16,
        }
    }
}

impl TimerConfig {
    pub fn counter_mask(&self) -> u32 {
        if self.counter_bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.counter_bits) - 1
        }
    }
}

/// Output-compare observation taken at a period boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmSample {
    pub channel: u8,
    pub compare: u32,
    /// Counter period in prescaled ticks (ARR + 1).
    pub period: u64,
    pub duty_permille: u32,
    /// Output level at the start of the period.
    pub level: bool,
}

pub type CompareObserver = Box<dyn FnMut(PwmSample)>;

#[derive(Debug, Clone, Copy, Default)]
struct Timebase {
    clock_hz: u64,
    origin_ns: u64,
    /// Prescaled ticks already counted at `origin_ns`.
    base: u64,
    running: bool,
    psc: u32,
    arr: u32,
}

impl Timebase {
    fn period(&self) -> u64 {
        u64::from(self.arr) + 1
    }

    fn elapsed(&self, now_ns: u64) -> u64 {
        if !self.running {
            return self.base;
        }
        let raw = ticks_from_ns(now_ns.saturating_sub(self.origin_ns), self.clock_hz);
        self.base + raw / (u64::from(self.psc) + 1)
    }

    fn counter(&self, now_ns: u64) -> u32 {
        if self.arr == 0 {
            // The counter is blocked while ARR is zero.
            return 0;
        }
        (self.elapsed(now_ns) % self.period()) as u32
    }

    fn set_counter(&mut self, now_ns: u64, value: u64) {
        self.base = value;
        self.origin_ns = now_ns;
    }

    fn rebase(&mut self, now_ns: u64) {
        let counter = u64::from(self.counter(now_ns));
        self.set_counter(now_ns, counter);
    }

    fn start(&mut self, now_ns: u64) {
        if !self.running {
            self.origin_ns = now_ns;
            self.running = true;
        }
    }

    fn stop(&mut self, now_ns: u64) {
        if self.running {
            self.base = self.elapsed(now_ns);
            self.running = false;
        }
    }

    fn next_wrap_ns(&self, now_ns: u64) -> Option<u64> {
        if !self.running || self.arr == 0 || self.clock_hz == 0 {
            return None;
        }
        let period = self.period();
        let wrap = (self.elapsed(now_ns) / period + 1) * period;
        let raw = (wrap - self.base).checked_mul(u64::from(self.psc) + 1)?;
        self.origin_ns
            .checked_add(ns_from_ticks_ceil(raw, self.clock_hz))
    }
}

pub struct Stm32Timer {
    name: &'static str,
    config: TimerConfig,
    regs: RegisterFile,
    timebase: Timebase,
    alarm: Alarm<DeviceTimer>,
    irq: IrqLine,
    observer: Option<CompareObserver>,
}

impl std::fmt::Debug for Stm32Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm32Timer")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("timebase", &self.timebase)
            .field("irq", &self.irq)
            .finish_non_exhaustive()
    }
}

impl Stm32Timer {
    pub fn new(name: &'static str, config: TimerConfig, alarm: Alarm<DeviceTimer>) -> Self {
        let regs = RegisterFile::new(name, TIMER_REGS)
            .with_reset_value(REG_ARR, config.counter_mask());
        let mut timer = Self {
            name,
            config,
            regs,
            timebase: Timebase::default(),
            alarm,
            irq: IrqLine::disconnected(),
            observer: None,
        };
        timer.reset_timebase();
        timer
    }

    pub fn connect_irq(&mut self, irq: IrqLine) {
        self.irq = irq;
    }

    pub fn set_compare_observer(&mut self, observer: CompareObserver) {
        self.observer = Some(observer);
    }

    pub fn is_running(&self) -> bool {
        self.timebase.running
    }

    pub fn counter(&self) -> u32 {
        self.timebase.counter(self.alarm.now_ns())
    }

    /// Virtual time of the next scheduled wrap, if the alarm is armed.
    pub fn next_deadline_ns(&self) -> Option<u64> {
        self.alarm.deadline_ns()
    }

    fn cr1(&self) -> Cr1 {
        Cr1::from_bits_truncate(self.regs.get(IDX_CR1))
    }

    fn reset_timebase(&mut self) {
        self.timebase = Timebase {
            clock_hz: self.config.clock_hz,
            origin_ns: self.alarm.now_ns(),
            base: 0,
            running: false,
            psc: self.regs.get(IDX_PSC),
            arr: self.regs.get(IDX_ARR),
        };
    }

    fn rearm(&mut self, now_ns: u64) {
        self.alarm.cancel();
        let Some(deadline_ns) = self.timebase.next_wrap_ns(now_ns) else {
            return;
        };
        if let Err(err) = self.alarm.arm_at(deadline_ns.max(now_ns)) {
            tracing::warn!(timer = self.name, "failed to arm update alarm: {err}");
        }
    }

    /// Re-arms the update alarm from the counter state, for use after the owning scheduler
    /// dropped its pending events.
    pub fn resync(&mut self) {
        let now_ns = self.alarm.now_ns();
        self.rearm(now_ns);
    }

    /// Scheduler callback for this timer's alarm.
    pub fn on_alarm(&mut self, now_ns: u64) {
        if !self.timebase.running {
            return;
        }
        if self.timebase.arr != 0 && self.timebase.counter(now_ns) == 0 {
            self.update_event(now_ns);
        } else {
            tracing::trace!(timer = self.name, "alarm before wrap, re-arming");
        }
        self.rearm(now_ns);
    }

    fn update_event(&mut self, now_ns: u64) {
        let cr1 = self.cr1();
        if cr1.contains(Cr1::UDIS) {
            return;
        }
        self.raise_status(Status::UIF);
        self.sample_compare_outputs();

        if cr1.contains(Cr1::OPM) {
            self.regs.set(IDX_CR1, self.regs.get(IDX_CR1) & !Cr1::CEN.bits());
            self.timebase.stop(now_ns);
            self.timebase.set_counter(now_ns, 0);
        }
    }

    fn raise_status(&mut self, flags: Status) {
        self.regs.set(IDX_SR, self.regs.get(IDX_SR) | flags.bits());
        let dier = Status::from_bits_truncate(self.regs.get(IDX_DIER));
        let mut fire = dier & flags;
        if !self.cr1().contains(Cr1::CEN) {
            fire.remove(Status::UIF);
        }
        if !fire.is_empty() {
            tracing::trace!(timer = self.name, flags = ?fire, "timer interrupt");
            self.irq.pulse();
        }
    }

    fn sample_compare_outputs(&mut self) {
        let Some(observer) = self.observer.as_mut() else {
            return;
        };
        let ccer = self.regs.get(IDX_CCER);
        let period = self.timebase.period();
        for channel in 1..=4u8 {
            let ch = usize::from(channel - 1);
            let ccmr = self.regs.get(IDX_CCMR1 + ch / 2) >> ((ch % 2) * 8);
            let output = ccmr & 0b11 == 0;
            let preload = ccmr & (1 << 3) != 0;
            let mode = (ccmr >> 4) & 0b111;
            let enabled = ccer & (1 << (4 * ch)) != 0;
            if !(output && preload && enabled && matches!(mode, OCM_PWM1 | OCM_PWM2)) {
                continue;
            }

            let compare = self.regs.get(IDX_CCR1 + ch);
            let active = u64::from(compare).min(period);
            let mut duty_permille = (active * 1000 / period) as u32;
            let mut level = compare > 0;
            if mode == OCM_PWM2 {
                duty_permille = 1000 - duty_permille;
                level = !level;
            }
            observer(PwmSample {
                channel,
                compare,
                period,
                duty_permille,
                level,
            });
        }
    }

    fn write_cr1(&mut self, now_ns: u64, old: u32, new: u32) {
        let old = Cr1::from_bits_truncate(old);
        let new = Cr1::from_bits_truncate(new);
        if new.intersects(Cr1::DIR | Cr1::CMS) && new != old {
            tracing::warn!(
                target: UNIMP,
                timer = self.name,
                "down-counting and center-aligned modes not modeled; counting up"
            );
        }
        match (old.contains(Cr1::CEN), new.contains(Cr1::CEN)) {
            (false, true) => {
                tracing::debug!(timer = self.name, "counter enabled");
                self.timebase.start(now_ns);
                self.rearm(now_ns);
            }
            (true, false) => {
                tracing::debug!(timer = self.name, "counter disabled");
                self.timebase.stop(now_ns);
                self.alarm.cancel();
            }
            _ => {}
        }
    }

    fn write_egr(&mut self, now_ns: u64, value: u32) {
        let egr = Status::from_bits_truncate(value);
        if egr.contains(Status::UIF) {
            // Reinitialise the counter; the prescaler reload is immediate in this model.
            self.timebase.set_counter(now_ns, 0);
            self.rearm(now_ns);
            if !self.cr1().contains(Cr1::URS) {
                self.raise_status(Status::UIF);
                self.sample_compare_outputs();
            }
        }
        let rest = egr - Status::UIF;
        if !rest.is_empty() {
            self.raise_status(rest);
        }
        self.regs.set(IDX_EGR, 0);
    }

    fn write_reg(&mut self, offset: u64, size: usize, value: u32) {
        let now_ns = self.alarm.now_ns();
        // Partial-width CNT writes merge into the live value.
        self.regs.set(IDX_CNT, self.timebase.counter(now_ns));
        let Some(w) = self.regs.write(offset, size, value) else {
            return;
        };
        let mask = self.config.counter_mask();
        match w.index {
            IDX_CR1 => self.write_cr1(now_ns, w.old, w.new),
            IDX_SMCR if w.new & SMCR_SMS != 0 => {
                tracing::warn!(target: UNIMP, timer = self.name, "slave mode controller not modeled");
            }
            IDX_EGR => self.write_egr(now_ns, w.new),
            IDX_CNT => {
                let v = w.new & mask;
                self.regs.set(IDX_CNT, v);
                self.timebase.set_counter(now_ns, u64::from(v));
                self.rearm(now_ns);
            }
            IDX_PSC => {
                self.timebase.rebase(now_ns);
                self.timebase.psc = w.new;
                self.rearm(now_ns);
            }
            IDX_ARR => {
                let v = w.new & mask;
                self.regs.set(IDX_ARR, v);
                self.timebase.rebase(now_ns);
                self.timebase.arr = v;
                self.rearm(now_ns);
            }
            IDX_CCR1..=IDX_CCR4 => self.regs.set(w.index, w.new & mask),
            IDX_DCR | IDX_DMAR if w.new != w.old => {
                tracing::warn!(target: UNIMP, timer = self.name, "timer DMA bursts not modeled");
            }
            _ => {}
        }
    }
}

impl MmioDevice for Stm32Timer {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        check_access(TIMER_MMIO_SIZE, offset, size)?;
        self.regs.set(IDX_CNT, self.counter());
        let value = self.regs.read(offset, size).unwrap_or_else(|| {
            tracing::warn!(
                target: GUEST_ERROR,
                timer = self.name,
                "read of reserved offset {offset:#x}"
            );
            0
        });
        Ok(u64::from(value))
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        check_access(TIMER_MMIO_SIZE, offset, size)?;
        self.write_reg(offset, size, value as u32);
        Ok(())
    }

    fn reset(&mut self) {
        self.alarm.cancel();
        self.regs.reset();
        self.reset_timebase();
    }
}

impl IoSnapshot for Stm32Timer {
    const DEVICE_ID: [u8; 4] = *b"TIMR";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_REGS: u16 = 1;
        const TAG_COUNTER: u16 = 2;
        const TAG_RUNNING: u16 = 3;

        let now_ns = self.alarm.now_ns();
        let mut regs = self.regs.clone();
        regs.set(IDX_CNT, self.timebase.counter(now_ns));

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_bytes(TAG_REGS, regs.save());
        // Elapsed ticks, never an absolute timestamp.
        w.field_u32(TAG_COUNTER, self.timebase.counter(now_ns));
        w.field_bool(TAG_RUNNING, self.timebase.running);
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_REGS: u16 = 1;
        const TAG_COUNTER: u16 = 2;
        const TAG_RUNNING: u16 = 3;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        self.reset();
        if let Some(buf) = r.bytes(TAG_REGS) {
            self.regs.load(buf)?;
        }
        let mask = self.config.counter_mask();
        let arr = self.regs.get(IDX_ARR) & mask;
        self.regs.set(IDX_ARR, arr);

        let now_ns = self.alarm.now_ns();
        self.timebase.psc = self.regs.get(IDX_PSC) & 0xFFFF;
        self.timebase.arr = arr;
        let counter = r.u32(TAG_COUNTER)?.unwrap_or(0) & mask;
        self.timebase.set_counter(now_ns, u64::from(counter));
        if r.bool(TAG_RUNNING)?.unwrap_or(false) {
            self.timebase.start(now_ns);
            self.rearm(now_ns);
        }
        Ok(())
    }
}
