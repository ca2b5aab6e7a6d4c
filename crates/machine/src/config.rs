use mcusim_devices::{FifoSpiConfig, TimerConfig};
use serde::{Deserialize, Serialize};

use crate::MachineError;

/// Upper bound on FIFO serial controller chip-select outputs (CSID is a 32-bit register).
pub const MAX_CS_WIDTH: usize = 32;

/// Machine-level configuration for [`crate::Stm32f405Soc`].
///
/// Every field has a default, so a partial JSON/TOML document only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocConfig {
    /// Input clock of the general-purpose timers, in Hz, before the prescaler.
    ///
    /// Real parts run TIM2..TIM5 from APB1 x2 (84 MHz on a 168 MHz F405); the default of 1 GHz
    /// makes one timer tick equal one nanosecond of virtual time.
    pub timer_clock_hz: u64,

    /// Instantiate ADC1.
    pub enable_adc: bool,

    /// Instantiate the FIFO-based serial controller at [`crate::FIFO_SPI_BASE`].
    ///
    /// The STM32F405 has no such block; it is provided for firmware ported from FIFO-style
    /// controllers and for exercising watermark interrupts.
    pub enable_fifo_spi: bool,

    /// Depth, in frames, of each FIFO of the FIFO serial controller.
    pub fifo_spi_depth: usize,

    /// Number of chip-select outputs of the FIFO serial controller.
    pub fifo_spi_cs_width: usize,
}

impl Default for SocConfig {
    fn default() -> Self {
        let fifo = FifoSpiConfig::default();
        Self {
            timer_clock_hz: TimerConfig::default().clock_hz,
            enable_adc: true,
            enable_fifo_spi: false,
            fifo_spi_depth: fifo.fifo_depth,
            fifo_spi_cs_width: fifo.cs_width,
        }
    }
}

impl SocConfig {
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.timer_clock_hz == 0 {
            return Err(MachineError::ZeroTimerClock);
        }
        if self.enable_fifo_spi {
            if self.fifo_spi_depth == 0 {
                return Err(MachineError::InvalidFifoDepth(self.fifo_spi_depth));
            }
            if !(1..=MAX_CS_WIDTH).contains(&self.fifo_spi_cs_width) {
                return Err(MachineError::InvalidCsWidth(self.fifo_spi_cs_width));
            }
        }
        Ok(())
    }

    pub(crate) fn timer_config(&self, counter_bits: u32) -> TimerConfig {
        TimerConfig {
            clock_hz: self.timer_clock_hz,
            counter_bits,
        }
    }

    pub(crate) fn fifo_spi_config(&self) -> FifoSpiConfig {
        FifoSpiConfig {
            cs_width: self.fifo_spi_cs_width,
            fifo_depth: self.fifo_spi_depth,
        }
    }
}
