use mcusim_platform::MmioError;
use mcusim_time::TimerError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("timer_clock_hz must be non-zero")]
    ZeroTimerClock,

    #[error("invalid fifo_spi_depth={0}; must be >= 1")]
    InvalidFifoDepth(usize),

    #[error("invalid fifo_spi_cs_width={0}; must be between 1 and 32")]
    InvalidCsWidth(usize),

    #[error("failed to build the peripheral address map: {0}")]
    Mmio(#[from] MmioError),

    #[error(transparent)]
    Timer(#[from] TimerError),
}
