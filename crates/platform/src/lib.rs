//! Memory-mapped peripheral contract shared by every device model.

#![forbid(unsafe_code)]

pub mod mmio;
pub mod regs;

pub use mmio::{check_access, MmioBus, MmioDevice, MmioError, GUEST_ERROR, UNIMP};
pub use regs::{Access, RegWrite, RegisterFile, RegisterSpec};
