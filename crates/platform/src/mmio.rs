use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

pub const GUEST_ERROR: &str = "mcusim::guest_error";
pub const UNIMP: &str = "mcusim::unimp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmioError {
    #[error("access at offset {offset:#x} (size {size}) is outside the device window")]
    Unmapped { offset: u64, size: usize },

    #[error("invalid MMIO access size {size}")]
    InvalidSize { size: usize },

    #[error("MMIO range {base:#x}+{size:#x} overlaps an existing mapping")]
    Overlap { base: u64, size: u64 },
}

/// Memory-mapped register block.
///
/// `offset` is relative to the device's base. Implementations only return `Err` for accesses
/// that fall outside their window or use a width other than 1, 2 or 4 bytes; reserved offsets
/// inside the window are logged and read as zero.
pub trait MmioDevice {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError>;
    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError>;

    /// Restores power-on register values.
    fn reset(&mut self);
}

impl<T: MmioDevice + ?Sized> MmioDevice for Rc<RefCell<T>> {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        self.borrow_mut().read(offset, size)
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        self.borrow_mut().write(offset, size, value)
    }

    fn reset(&mut self) {
        self.borrow_mut().reset();
    }
}

impl<T: MmioDevice + ?Sized> MmioDevice for Box<T> {
    fn read(&mut self, offset: u64, size: usize) -> Result<u64, MmioError> {
        (**self).read(offset, size)
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) -> Result<(), MmioError> {
        (**self).write(offset, size, value)
    }

    fn reset(&mut self) {
        (**self).reset();
    }
}

/// Validates an access against a device window of `window` bytes.
pub fn check_access(window: u64, offset: u64, size: usize) -> Result<(), MmioError> {
    if !matches!(size, 1 | 2 | 4) {
        return Err(MmioError::InvalidSize { size });
    }
    match offset.checked_add(size as u64) {
        Some(end) if end <= window => Ok(()),
        _ => Err(MmioError::Unmapped { offset, size }),
    }
}

struct MmioRange {
    base: u64,
    size: u64,
    name: &'static str,
    dev: Box<dyn MmioDevice>,
}

impl MmioRange {
    fn end_exclusive(&self) -> u64 {
        self.base + self.size
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end_exclusive()
    }
}

/// Physical address decoder for a set of non-overlapping device windows.
///
/// Unmapped addresses and device-rejected accesses float to zero on read and are dropped on
/// write; both are logged as guest errors rather than surfaced to the caller.
#[derive(Default)]
pub struct MmioBus {
    ranges: Vec<MmioRange>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(
        &mut self,
        base: u64,
        size: u64,
        name: &'static str,
        dev: Box<dyn MmioDevice>,
    ) -> Result<(), MmioError> {
        let end_exclusive = base
            .checked_add(size)
            .filter(|_| size != 0)
            .ok_or(MmioError::Overlap { base, size })?;

        let idx = self.ranges.partition_point(|r| r.base < base);
        let overlaps_prev = idx
            .checked_sub(1)
            .and_then(|i| self.ranges.get(i))
            .is_some_and(|prev| base < prev.end_exclusive());
        let overlaps_next = self
            .ranges
            .get(idx)
            .is_some_and(|next| end_exclusive > next.base);
        if overlaps_prev || overlaps_next {
            return Err(MmioError::Overlap { base, size });
        }

        tracing::debug!(name, base, size, "mmio map");
        self.ranges.insert(
            idx,
            MmioRange {
                base,
                size,
                name,
                dev,
            },
        );
        Ok(())
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.find_range_index(addr).is_some()
    }

    /// Name of the device covering `addr`.
    pub fn device_at(&self, addr: u64) -> Option<&'static str> {
        self.find_range_index(addr).map(|i| self.ranges[i].name)
    }

    fn find_range_index(&self, addr: u64) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.base <= addr);
        let cand = idx.checked_sub(1)?;
        self.ranges[cand].contains(addr).then_some(cand)
    }

    pub fn read(&mut self, addr: u64, size: usize) -> u64 {
        let Some(idx) = self.find_range_index(addr) else {
            tracing::warn!(
                target: GUEST_ERROR,
                "read of unmapped address {addr:#x} (size {size})"
            );
            return 0;
        };
        let range = &mut self.ranges[idx];
        match range.dev.read(addr - range.base, size) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(target: GUEST_ERROR, device = range.name, "read {addr:#x}: {err}");
                0
            }
        }
    }

    pub fn write(&mut self, addr: u64, size: usize, value: u64) {
        let Some(idx) = self.find_range_index(addr) else {
            tracing::warn!(
                target: GUEST_ERROR,
                "write of unmapped address {addr:#x} (size {size}) value {value:#x}"
            );
            return;
        };
        let range = &mut self.ranges[idx];
        if let Err(err) = range.dev.write(addr - range.base, size, value) {
            tracing::warn!(target: GUEST_ERROR, device = range.name, "write {addr:#x}: {err}");
        }
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        self.read(addr, 4) as u32
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, 4, u64::from(value));
    }

    pub fn reset(&mut self) {
        for range in &mut self.ranges {
            range.dev.reset();
        }
    }
}
