#![forbid(unsafe_code)]

pub mod adc;
pub mod exti;
pub mod gpio;
pub mod spi;
pub mod syscfg;
pub mod timer;
pub mod usart;

pub use adc::{Adc, AdcSampler, MidScale, ADC_MMIO_SIZE};
pub use exti::{Exti, EXTI_LINES, EXTI_MMIO_SIZE};
pub use gpio::{GpioPort, Pin, PinDirection, PinObserver, PortId, GPIO_MMIO_SIZE, GPIO_PINS};
pub use spi::{
    FifoSpi, FifoSpiConfig, Nrf24l01Plus, SsiBus, SsiPeripheral, Stm32Spi, FIFO_SPI_MMIO_SIZE,
    STM32_SPI_MMIO_SIZE,
};
pub use syscfg::{Syscfg, SYSCFG_MMIO_SIZE};
pub use timer::{CompareObserver, PwmSample, Stm32Timer, TimerConfig, TIMER_MMIO_SIZE};
pub use usart::{Usart, USART_MMIO_SIZE};

/// Owner token carried by scheduler events, routed back to the device that armed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceTimer {
    /// General-purpose timer, by index into the machine's timer list.
    Timer(usize),
}
