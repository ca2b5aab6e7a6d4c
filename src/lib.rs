//! Deterministic STM32-style microcontroller peripheral models.
//!
//! This crate re-exports the workspace members under short names:
//! - [`platform`]: the MMIO device contract, address decoder and register-file helper
//! - [`interrupts`]: interrupt lines and the recording interrupt controller
//! - [`time`]: the virtual clock and alarm scheduler
//! - [`snapshot`]: versioned TLV save/restore
//! - [`devices`]: the peripheral models
//! - [`machine`]: the composed STM32F405-style SoC

#![forbid(unsafe_code)]

pub use mcusim_devices as devices;
pub use mcusim_interrupts as interrupts;
pub use mcusim_io_snapshot as snapshot;
pub use mcusim_machine as machine;
pub use mcusim_platform as platform;
pub use mcusim_time as time;

pub use mcusim_machine::{MachineError, SocConfig, Stm32f405Soc};
