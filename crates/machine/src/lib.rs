//! SoC composition: instantiates the peripheral models, wires their interrupt lines together and
//! exposes them behind one MMIO address map and one virtual timeline.
//!
//! Devices never discover each other at runtime; every connection (GPIO pin to SYSCFG input,
//! SYSCFG output to EXTI line, EXTI line to interrupt controller) is made once in
//! [`Stm32f405Soc::new`].

#![forbid(unsafe_code)]

mod config;
mod error;
mod soc;

pub use config::{SocConfig, MAX_CS_WIDTH};
pub use error::MachineError;
pub use soc::{
    exti_irq, gpio_base, spi_base, spi_irq, timer_base, timer_irq, usart_base, usart_irq,
    Stm32f405Soc, ADC1_BASE, ADC_IRQ, EXTI_BASE, FIFO_SPI_BASE, FIFO_SPI_IRQ, GPIO_BASE,
    GPIO_STRIDE, SYSCFG_BASE,
};
