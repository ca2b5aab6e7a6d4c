//! Synchronous serial controllers and the peripherals hanging off them.
//!
//! A transfer is a single synchronous call: the controller hands one frame to every selected
//! peripheral on its [`SsiBus`] and ORs the replies together, as an open-drain MISO would.

pub mod fifo;
pub mod nrf24;
pub mod stm32;

use std::cell::RefCell;
use std::rc::Rc;

pub use fifo::{FifoSpi, FifoSpiConfig, FIFO_SPI_MMIO_SIZE};
pub use nrf24::Nrf24l01Plus;
pub use stm32::{Stm32Spi, STM32_SPI_MMIO_SIZE};

/// A device on the far side of a serial controller.
///
/// Frames travel in shift order: bit 0 of `tx` is the first bit on MOSI and bit 0 of the reply is
/// the first bit sampled from MISO. Controllers configured for MSB-first frames bit-reverse within
/// the frame width before and after the exchange; LSB-first frames pass through unchanged.
pub trait SsiPeripheral {
    /// Exchanges one frame. Only called while the peripheral is selected.
    fn transfer(&mut self, tx: u32) -> u32;

    /// Chip-select transition (`true` = asserted, independent of wire polarity).
    fn set_selected(&mut self, _selected: bool) {}
}

impl<T: SsiPeripheral + ?Sized> SsiPeripheral for Box<T> {
    fn transfer(&mut self, tx: u32) -> u32 {
        (**self).transfer(tx)
    }

    fn set_selected(&mut self, selected: bool) {
        (**self).set_selected(selected)
    }
}

impl<T: SsiPeripheral + ?Sized> SsiPeripheral for Rc<RefCell<T>> {
    fn transfer(&mut self, tx: u32) -> u32 {
        self.borrow_mut().transfer(tx)
    }

    fn set_selected(&mut self, selected: bool) {
        self.borrow_mut().set_selected(selected)
    }
}

struct Slot {
    device: Box<dyn SsiPeripheral>,
    selected: bool,
}

/// Peripherals attached to one controller, each with its own select state.
#[derive(Default)]
pub struct SsiBus {
    slots: Vec<Slot>,
}

impl std::fmt::Debug for SsiBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let selected: Vec<bool> = self.slots.iter().map(|s| s.selected).collect();
        f.debug_struct("SsiBus").field("selected", &selected).finish()
    }
}

impl SsiBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a peripheral (initially deselected) and returns its slot index.
    pub fn attach(&mut self, device: Box<dyn SsiPeripheral>) -> usize {
        self.slots.push(Slot {
            device,
            selected: false,
        });
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_selected(&self, slot: usize) -> bool {
        self.slots.get(slot).is_some_and(|s| s.selected)
    }

    /// Updates a slot's select state, notifying the peripheral only on a change.
    pub fn set_selected(&mut self, slot: usize, selected: bool) {
        let Some(s) = self.slots.get_mut(slot) else {
            return;
        };
        if s.selected != selected {
            s.selected = selected;
            s.device.set_selected(selected);
        }
    }

    /// Exchanges `tx` with every selected peripheral. Reads as zero when nothing is selected.
    pub fn transfer(&mut self, tx: u32) -> u32 {
        self.slots
            .iter_mut()
            .filter(|s| s.selected)
            .fold(0, |rx, s| rx | s.device.transfer(tx))
    }
}

/// Reverses the low `bits` bits of `value`; higher bits are dropped.
pub(crate) fn reverse_bits(value: u32, bits: u32) -> u32 {
    match bits {
        0 => 0,
        1..=31 => value.reverse_bits() >> (32 - bits),
        _ => value.reverse_bits(),
    }
}
