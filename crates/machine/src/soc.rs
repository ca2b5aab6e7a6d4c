use std::cell::RefCell;
use std::rc::Rc;

use mcusim_devices::{
    Adc, DeviceTimer, Exti, FifoSpi, GpioPort, PortId, Stm32Spi, Stm32Timer, Syscfg, Usart,
    ADC_MMIO_SIZE, EXTI_LINES, EXTI_MMIO_SIZE, FIFO_SPI_MMIO_SIZE, GPIO_MMIO_SIZE, GPIO_PINS,
    STM32_SPI_MMIO_SIZE, SYSCFG_MMIO_SIZE, TIMER_MMIO_SIZE, USART_MMIO_SIZE,
};
use mcusim_interrupts::{IrqLine, IrqRecorder};
use mcusim_io_snapshot::{
    IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use mcusim_platform::{MmioBus, GUEST_ERROR};
use mcusim_time::Scheduler;

use crate::{MachineError, SocConfig};

pub const GPIO_BASE: u64 = 0x4002_0000;
pub const GPIO_STRIDE: u64 = 0x400;
pub const SYSCFG_BASE: u64 = 0x4001_3800;
pub const EXTI_BASE: u64 = 0x4001_3C00;
pub const ADC1_BASE: u64 = 0x4001_2000;
pub const ADC_IRQ: u32 = 18;

/// Unused APB2 slot on the F405 (SPI5 on larger parts), wide enough for the 4 KiB window.
pub const FIFO_SPI_BASE: u64 = 0x4001_5000;
pub const FIFO_SPI_IRQ: u32 = 85;

struct TimerSlot {
    name: &'static str,
    base: u64,
    irq: u32,
    counter_bits: u32,
}

const TIMERS: [TimerSlot; 4] = [
    TimerSlot {
        name: "TIM2",
        base: 0x4000_0000,
        irq: 28,
        counter_bits: 32,
    },
    TimerSlot {
        name: "TIM3",
        base: 0x4000_0400,
        irq: 29,
        counter_bits: 16,
    },
    TimerSlot {
        name: "TIM4",
        base: 0x4000_0800,
        irq: 30,
        counter_bits: 16,
    },
    TimerSlot {
        name: "TIM5",
        base: 0x4000_0C00,
        irq: 50,
        counter_bits: 32,
    },
];

const USARTS: [(&str, u64, u32); 3] = [
    ("USART1", 0x4001_1000, 37),
    ("USART2", 0x4000_4400, 38),
    ("USART3", 0x4000_4800, 39),
];

const SPIS: [(&str, u64, u32); 3] = [
    ("SPI1", 0x4001_3000, 35),
    ("SPI2", 0x4000_3800, 36),
    ("SPI3", 0x4000_3C00, 51),
];

const GPIO_NAMES: [&str; 9] = [
    "GPIOA", "GPIOB", "GPIOC", "GPIOD", "GPIOE", "GPIOF", "GPIOG", "GPIOH", "GPIOI",
];

/// Interrupt-controller input fed by EXTI line `line`.
///
/// Lines 5..9 and 10..15 share one vector each; lines 16..22 are the internal wake-up sources.
pub fn exti_irq(line: usize) -> Option<u32> {
    match line {
        0..=4 => Some(6 + line as u32),
        5..=9 => Some(23),
        10..=15 => Some(40),
        16 => Some(1),
        17 => Some(41),
        18 => Some(42),
        19 => Some(62),
        20 => Some(76),
        21 => Some(2),
        22 => Some(3),
        _ => None,
    }
}

pub fn timer_irq(index: usize) -> Option<u32> {
    TIMERS.get(index).map(|t| t.irq)
}

pub fn usart_irq(index: usize) -> Option<u32> {
    USARTS.get(index).map(|u| u.2)
}

pub fn spi_irq(index: usize) -> Option<u32> {
    SPIS.get(index).map(|s| s.2)
}

pub fn timer_base(index: usize) -> Option<u64> {
    TIMERS.get(index).map(|t| t.base)
}

pub fn usart_base(index: usize) -> Option<u64> {
    USARTS.get(index).map(|u| u.1)
}

pub fn spi_base(index: usize) -> Option<u64> {
    SPIS.get(index).map(|s| s.1)
}

pub fn gpio_base(port: PortId) -> u64 {
    GPIO_BASE + u64::from(port.index()) * GPIO_STRIDE
}

// Snapshot field tags, one per device instance.
const TAG_GPIO: u16 = 0x10;
const TAG_SYSCFG: u16 = 0x20;
const TAG_EXTI: u16 = 0x21;
const TAG_TIMER: u16 = 0x30;
const TAG_USART: u16 = 0x40;
const TAG_SPI: u16 = 0x50;
const TAG_FIFO_SPI: u16 = 0x58;
const TAG_ADC: u16 = 0x60;

/// STM32F405-style SoC: the peripheral set, its address map, and the wiring between them.
///
/// The CPU is an external collaborator: it drives [`Stm32f405Soc::read`]/[`Stm32f405Soc::write`]
/// and moves virtual time with [`Stm32f405Soc::advance_ns`]. Interrupt delivery is recorded by
/// an [`IrqRecorder`] standing in for the NVIC.
pub struct Stm32f405Soc {
    config: SocConfig,
    scheduler: Scheduler<DeviceTimer>,
    bus: MmioBus,
    nvic: Rc<RefCell<IrqRecorder>>,
    gpio: Vec<Rc<RefCell<GpioPort>>>,
    syscfg: Rc<RefCell<Syscfg>>,
    exti: Rc<RefCell<Exti>>,
    timers: Vec<Rc<RefCell<Stm32Timer>>>,
    usarts: Vec<Rc<RefCell<Usart>>>,
    spis: Vec<Rc<RefCell<Stm32Spi>>>,
    fifo_spi: Option<Rc<RefCell<FifoSpi>>>,
    adc: Option<Rc<RefCell<Adc>>>,
}

impl Stm32f405Soc {
    pub fn new(config: SocConfig) -> Result<Self, MachineError> {
        config.validate()?;

        let scheduler = Scheduler::default();
        let nvic = IrqRecorder::new_shared();
        let mut bus = MmioBus::new();

        let exti = Rc::new(RefCell::new(Exti::new()));
        for line in 0..EXTI_LINES {
            if let Some(irq) = exti_irq(line) {
                exti.borrow_mut()
                    .connect_output(line, IrqLine::new(nvic.clone(), irq));
            }
        }

        let syscfg = Rc::new(RefCell::new(Syscfg::new()));
        for pin in 0..GPIO_PINS {
            syscfg
                .borrow_mut()
                .connect_output(pin, IrqLine::new(exti.clone(), pin as u32));
        }

        let mut gpio = Vec::with_capacity(PortId::ALL.len());
        for (port, name) in PortId::ALL.into_iter().zip(GPIO_NAMES) {
            let dev = Rc::new(RefCell::new(GpioPort::new(port)));
            for pin in 0..GPIO_PINS {
                dev.borrow_mut().connect_pin(
                    pin,
                    IrqLine::new(syscfg.clone(), Syscfg::input_line(port, pin)),
                );
            }
            bus.map(gpio_base(port), GPIO_MMIO_SIZE, name, Box::new(dev.clone()))?;
            gpio.push(dev);
        }

        bus.map(
            SYSCFG_BASE,
            SYSCFG_MMIO_SIZE,
            "SYSCFG",
            Box::new(syscfg.clone()),
        )?;
        bus.map(EXTI_BASE, EXTI_MMIO_SIZE, "EXTI", Box::new(exti.clone()))?;

        let mut timers = Vec::with_capacity(TIMERS.len());
        for (idx, slot) in TIMERS.iter().enumerate() {
            let mut timer = Stm32Timer::new(
                slot.name,
                config.timer_config(slot.counter_bits),
                scheduler.alarm(DeviceTimer::Timer(idx)),
            );
            timer.connect_irq(IrqLine::new(nvic.clone(), slot.irq));
            let timer = Rc::new(RefCell::new(timer));
            bus.map(slot.base, TIMER_MMIO_SIZE, slot.name, Box::new(timer.clone()))?;
            timers.push(timer);
        }

        let mut usarts = Vec::with_capacity(USARTS.len());
        for (name, base, irq) in USARTS {
            let mut usart = Usart::new(name);
            usart.connect_irq(IrqLine::new(nvic.clone(), irq));
            let usart = Rc::new(RefCell::new(usart));
            bus.map(base, USART_MMIO_SIZE, name, Box::new(usart.clone()))?;
            usarts.push(usart);
        }

        let mut spis = Vec::with_capacity(SPIS.len());
        for (name, base, irq) in SPIS {
            let mut spi = Stm32Spi::new(name);
            spi.connect_irq(IrqLine::new(nvic.clone(), irq));
            let spi = Rc::new(RefCell::new(spi));
            bus.map(base, STM32_SPI_MMIO_SIZE, name, Box::new(spi.clone()))?;
            spis.push(spi);
        }

        let fifo_spi = if config.enable_fifo_spi {
            let mut spi = FifoSpi::new(config.fifo_spi_config());
            spi.connect_irq(IrqLine::new(nvic.clone(), FIFO_SPI_IRQ));
            let spi = Rc::new(RefCell::new(spi));
            bus.map(
                FIFO_SPI_BASE,
                FIFO_SPI_MMIO_SIZE,
                "FIFO-SPI",
                Box::new(spi.clone()),
            )?;
            Some(spi)
        } else {
            None
        };

        let adc = if config.enable_adc {
            let mut adc = Adc::new("ADC1");
            adc.connect_irq(IrqLine::new(nvic.clone(), ADC_IRQ));
            let adc = Rc::new(RefCell::new(adc));
            bus.map(ADC1_BASE, ADC_MMIO_SIZE, "ADC1", Box::new(adc.clone()))?;
            Some(adc)
        } else {
            None
        };

        tracing::debug!(?config, "stm32f405 soc built");

        Ok(Self {
            config,
            scheduler,
            bus,
            nvic,
            gpio,
            syscfg,
            exti,
            timers,
            usarts,
            spis,
            fifo_spi,
            adc,
        })
    }

    pub fn config(&self) -> &SocConfig {
        &self.config
    }

    pub fn now_ns(&self) -> u64 {
        self.scheduler.now_ns()
    }

    /// Absolute virtual time of the earliest pending timer event.
    pub fn next_deadline_ns(&self) -> Option<u64> {
        self.scheduler.next_deadline()
    }

    pub fn nvic(&self) -> &Rc<RefCell<IrqRecorder>> {
        &self.nvic
    }

    pub fn gpio(&self, port: PortId) -> &Rc<RefCell<GpioPort>> {
        &self.gpio[port.index() as usize]
    }

    pub fn syscfg(&self) -> &Rc<RefCell<Syscfg>> {
        &self.syscfg
    }

    pub fn exti(&self) -> &Rc<RefCell<Exti>> {
        &self.exti
    }

    /// TIM2..TIM5 by index (0 is TIM2).
    pub fn timer(&self, index: usize) -> Option<&Rc<RefCell<Stm32Timer>>> {
        self.timers.get(index)
    }

    /// USART1..USART3 by index (0 is USART1).
    pub fn usart(&self, index: usize) -> Option<&Rc<RefCell<Usart>>> {
        self.usarts.get(index)
    }

    /// SPI1..SPI3 by index (0 is SPI1).
    pub fn spi(&self, index: usize) -> Option<&Rc<RefCell<Stm32Spi>>> {
        self.spis.get(index)
    }

    pub fn fifo_spi(&self) -> Option<&Rc<RefCell<FifoSpi>>> {
        self.fifo_spi.as_ref()
    }

    pub fn adc(&self) -> Option<&Rc<RefCell<Adc>>> {
        self.adc.as_ref()
    }

    /// Name of the peripheral decoding `addr`.
    pub fn device_at(&self, addr: u64) -> Option<&'static str> {
        self.bus.device_at(addr)
    }

    pub fn read(&mut self, addr: u64, size: usize) -> u64 {
        self.bus.read(addr, size)
    }

    pub fn write(&mut self, addr: u64, size: usize, value: u64) {
        self.bus.write(addr, size, value);
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        self.bus.read_u32(addr)
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.bus.write_u32(addr, value);
    }

    /// Moves virtual time forward by `delta_ns`, firing every timer event that falls due.
    pub fn advance_ns(&mut self, delta_ns: u64) -> usize {
        let timers = &self.timers;
        self.scheduler
            .advance_ns(delta_ns, |owner, now_ns| dispatch(timers, owner, now_ns))
    }

    pub fn advance_to(&mut self, target_ns: u64) -> Result<usize, MachineError> {
        let timers = &self.timers;
        let fired = self
            .scheduler
            .advance_to(target_ns, |owner, now_ns| dispatch(timers, owner, now_ns))?;
        Ok(fired)
    }

    /// Power-on reset of every peripheral. Virtual time keeps running.
    pub fn reset(&mut self) {
        self.bus.reset();
        self.nvic.borrow_mut().clear();
    }
}

fn dispatch(timers: &[Rc<RefCell<Stm32Timer>>], owner: DeviceTimer, now_ns: u64) {
    match owner {
        DeviceTimer::Timer(idx) => match timers.get(idx) {
            Some(timer) => timer.borrow_mut().on_alarm(now_ns),
            None => tracing::warn!(idx, "alarm for unknown timer dropped"),
        },
    }
}

impl Stm32f405Soc {
    /// Loads every device field present in `r`. Pending events are dropped first and every
    /// timer re-arms afterwards, so a timer whose field is absent keeps counting.
    fn restore_devices(&mut self, r: &SnapshotReader<'_>) -> SnapshotResult<()> {
        self.scheduler.clear();

        for (i, port) in self.gpio.iter().enumerate() {
            load_device(r, TAG_GPIO + i as u16, port)?;
        }
        load_device(r, TAG_SYSCFG, &self.syscfg)?;
        load_device(r, TAG_EXTI, &self.exti)?;
        for (i, timer) in self.timers.iter().enumerate() {
            load_device(r, TAG_TIMER + i as u16, timer)?;
        }
        for (i, usart) in self.usarts.iter().enumerate() {
            load_device(r, TAG_USART + i as u16, usart)?;
        }
        for (i, spi) in self.spis.iter().enumerate() {
            load_device(r, TAG_SPI + i as u16, spi)?;
        }

        match &self.fifo_spi {
            Some(spi) => load_device(r, TAG_FIFO_SPI, spi)?,
            None if r.bytes(TAG_FIFO_SPI).is_some() => {
                tracing::warn!(
                    target: GUEST_ERROR,
                    "snapshot carries FIFO-SPI state but the controller is disabled"
                );
            }
            None => {}
        }
        match &self.adc {
            Some(adc) => load_device(r, TAG_ADC, adc)?,
            None if r.bytes(TAG_ADC).is_some() => {
                tracing::warn!(
                    target: GUEST_ERROR,
                    "snapshot carries ADC1 state but the ADC is disabled"
                );
            }
            None => {}
        }

        for timer in &self.timers {
            timer.borrow_mut().resync();
        }
        Ok(())
    }
}

fn load_device<T: IoSnapshot>(
    r: &SnapshotReader<'_>,
    tag: u16,
    dev: &Rc<RefCell<T>>,
) -> SnapshotResult<()> {
    if let Some(buf) = r.bytes(tag) {
        dev.borrow_mut().load_state(buf)?;
    }
    Ok(())
}

impl IoSnapshot for Stm32f405Soc {
    const DEVICE_ID: [u8; 4] = *b"F405";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        for (i, port) in self.gpio.iter().enumerate() {
            w.field_bytes(TAG_GPIO + i as u16, port.borrow().save_state());
        }
        w.field_bytes(TAG_SYSCFG, self.syscfg.borrow().save_state());
        w.field_bytes(TAG_EXTI, self.exti.borrow().save_state());
        for (i, timer) in self.timers.iter().enumerate() {
            w.field_bytes(TAG_TIMER + i as u16, timer.borrow().save_state());
        }
        for (i, usart) in self.usarts.iter().enumerate() {
            w.field_bytes(TAG_USART + i as u16, usart.borrow().save_state());
        }
        for (i, spi) in self.spis.iter().enumerate() {
            w.field_bytes(TAG_SPI + i as u16, spi.borrow().save_state());
        }
        if let Some(spi) = &self.fifo_spi {
            w.field_bytes(TAG_FIFO_SPI, spi.borrow().save_state());
        }
        if let Some(adc) = &self.adc {
            w.field_bytes(TAG_ADC, adc.borrow().save_state());
        }
        w.finish()
    }

    /// Restores every peripheral against the current virtual time.
    ///
    /// Pending timer events are discarded and re-armed by the timers themselves. Devices attached
    /// behind the serial controllers belong to the host and are not part of this snapshot.
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let backup = self.save_state();
        let Err(err) = self.restore_devices(&r) else {
            return Ok(());
        };
        tracing::warn!("snapshot rejected part-way, rolling back: {err}");
        let rollback =
            SnapshotReader::parse(&backup, Self::DEVICE_ID).and_then(|r| self.restore_devices(&r));
        if let Err(rollback_err) = rollback {
            tracing::error!("rollback to the pre-restore state failed: {rollback_err}");
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soc() -> Stm32f405Soc {
        Stm32f405Soc::new(SocConfig::default()).unwrap()
    }

    #[test]
    fn address_map_matches_the_reference_manual() {
        let soc = soc();
        assert_eq!(soc.device_at(0x4000_0000), Some("TIM2"));
        assert_eq!(soc.device_at(0x4000_0C10), Some("TIM5"));
        assert_eq!(soc.device_at(0x4000_4400), Some("USART2"));
        assert_eq!(soc.device_at(0x4001_3000), Some("SPI1"));
        assert_eq!(soc.device_at(0x4001_3800), Some("SYSCFG"));
        assert_eq!(soc.device_at(0x4001_3C14), Some("EXTI"));
        assert_eq!(soc.device_at(0x4002_0000), Some("GPIOA"));
        assert_eq!(soc.device_at(0x4002_2000), Some("GPIOI"));
        assert_eq!(soc.device_at(0x4001_2000), Some("ADC1"));
        assert_eq!(soc.device_at(FIFO_SPI_BASE), None);
    }

    #[test]
    fn optional_peripherals_follow_the_config() {
        let soc = Stm32f405Soc::new(SocConfig {
            enable_adc: false,
            enable_fifo_spi: true,
            ..SocConfig::default()
        })
        .unwrap();
        assert!(soc.adc().is_none());
        assert!(soc.fifo_spi().is_some());
        assert_eq!(soc.device_at(FIFO_SPI_BASE), Some("FIFO-SPI"));
        assert_eq!(soc.device_at(ADC1_BASE), None);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let err = Stm32f405Soc::new(SocConfig {
            timer_clock_hz: 0,
            ..SocConfig::default()
        })
        .err();
        assert_eq!(err, Some(MachineError::ZeroTimerClock));
    }

    #[test]
    fn exti_vectors_are_shared_above_line_four() {
        assert_eq!(exti_irq(0), Some(6));
        assert_eq!(exti_irq(4), Some(10));
        assert_eq!(exti_irq(7), Some(23));
        assert_eq!(exti_irq(15), Some(40));
        assert_eq!(exti_irq(23), None);
    }

    #[test]
    fn gpio_edges_reach_the_shared_exti_vector() {
        let mut soc = soc();
        // EXTICR3: line 9 from port B.
        soc.write_u32(SYSCFG_BASE + 0x10, PortId::B.index() << 4);
        soc.write_u32(EXTI_BASE, 1 << 9);
        soc.write_u32(EXTI_BASE + 0x08, 1 << 9);

        soc.gpio(PortId::B).borrow_mut().set_input_level(9, true);
        assert_eq!(soc.nvic().borrow().pulse_count(23), 1);
        assert_eq!(soc.read_u32(EXTI_BASE + 0x14), 1 << 9);
    }

    #[test]
    fn timer_alarms_are_routed_to_their_owner() {
        let mut soc = soc();
        let tim3 = timer_base(1).unwrap();
        soc.write_u32(tim3 + 0x2C, 99);
        soc.write_u32(tim3 + 0x0C, 1);
        soc.write_u32(tim3, 1);

        assert_eq!(soc.advance_ns(1_000), 10);
        assert_eq!(soc.nvic().borrow().pulse_count(29), 10);
        assert_eq!(soc.nvic().borrow().pulse_count(28), 0);
    }

    #[test]
    fn advance_to_rejects_the_past() {
        let mut soc = soc();
        soc.advance_ns(500);
        assert!(matches!(
            soc.advance_to(100),
            Err(MachineError::Timer(_))
        ));
        assert_eq!(soc.advance_to(800).unwrap(), 0);
        assert_eq!(soc.now_ns(), 800);
    }

    #[test]
    fn reset_restores_power_on_values() {
        let mut soc = soc();
        let moder = gpio_base(PortId::C);
        soc.write_u32(moder, 0x5555);
        soc.write_u32(EXTI_BASE, 0xFF);
        soc.reset();
        assert_eq!(soc.read_u32(moder), 0);
        assert_eq!(soc.read_u32(EXTI_BASE), 0);
        // GPIOA keeps its debug-port alternate functions.
        assert_eq!(soc.read_u32(GPIO_BASE), 0xA800_0000);
    }
}
