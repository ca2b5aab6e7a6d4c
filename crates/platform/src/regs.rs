//! Table-driven 32-bit register storage with byte/halfword lane decoding.

use mcusim_io_snapshot::codec::{Decoder, Encoder};
use mcusim_io_snapshot::{SnapshotError, SnapshotResult};

use crate::mmio::GUEST_ERROR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
    /// Stored, but reads as zero.
    WriteOnly,
    /// Writing a one clears the bit; writing zero has no effect.
    WriteOneToClear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSpec {
    pub name: &'static str,
    pub offset: u64,
    pub reset: u32,
    pub writable: u32,
    pub access: Access,
}

impl RegisterSpec {
    pub const fn rw(name: &'static str, offset: u64, reset: u32, writable: u32) -> Self {
        Self {
            name,
            offset,
            reset,
            writable,
            access: Access::ReadWrite,
        }
    }

    pub const fn ro(name: &'static str, offset: u64, reset: u32) -> Self {
        Self {
            name,
            offset,
            reset,
            writable: 0,
            access: Access::ReadOnly,
        }
    }

    pub const fn wo(name: &'static str, offset: u64, writable: u32) -> Self {
        Self {
            name,
            offset,
            reset: 0,
            writable,
            access: Access::WriteOnly,
        }
    }

    pub const fn w1c(name: &'static str, offset: u64, reset: u32, writable: u32) -> Self {
        Self {
            name,
            offset,
            reset,
            writable,
            access: Access::WriteOneToClear,
        }
    }
}

/// Result of a register write, handed to the device's post-write hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub index: usize,
    pub offset: u64,
    pub old: u32,
    pub new: u32,
    /// Written data shifted into its lane, before masking by `writable`.
    pub data: u32,
    pub lane_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lane {
    index: usize,
    shift: u32,
    mask: u32,
}

/// Register values for one device, backed by a static, offset-sorted [`RegisterSpec`] table.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    device: &'static str,
    specs: &'static [RegisterSpec],
    resets: Vec<u32>,
    values: Vec<u32>,
}

impl RegisterFile {
    pub fn new(device: &'static str, specs: &'static [RegisterSpec]) -> Self {
        debug_assert!(specs.windows(2).all(|w| w[0].offset < w[1].offset));
        let resets: Vec<u32> = specs.iter().map(|s| s.reset).collect();
        Self {
            device,
            specs,
            values: resets.clone(),
            resets,
        }
    }

    /// Overrides the power-on value of the register at `offset` (for per-instance defaults).
    pub fn with_reset_value(mut self, offset: u64, value: u32) -> Self {
        if let Some(index) = self.index_of(offset) {
            self.resets[index] = value;
            self.values[index] = value;
        }
        self
    }

    pub fn device(&self) -> &'static str {
        self.device
    }

    pub fn specs(&self) -> &'static [RegisterSpec] {
        self.specs
    }

    pub fn index_of(&self, offset: u64) -> Option<usize> {
        self.specs.binary_search_by_key(&offset, |s| s.offset).ok()
    }

    pub fn get(&self, index: usize) -> u32 {
        self.values[index]
    }

    /// Raw store that bypasses access rules, for device-side state changes.
    pub fn set(&mut self, index: usize, value: u32) {
        self.values[index] = value;
    }

    pub fn values(&self) -> &[u32] {
        &self.values
    }

    pub fn reset(&mut self) {
        self.values.copy_from_slice(&self.resets);
    }

    fn lane(&self, offset: u64, size: usize) -> Option<Lane> {
        let aligned = offset & !3;
        let byte = (offset & 3) as usize;
        if byte + size > 4 {
            return None;
        }
        let index = self.index_of(aligned)?;
        let shift = (byte * 8) as u32;
        let width_mask = match size {
            1 => 0xff,
            2 => 0xffff,
            4 => 0xffff_ffff,
            _ => return None,
        };
        Some(Lane {
            index,
            shift,
            mask: width_mask << shift,
        })
    }

    /// Reads the lane at `offset`; `None` for reserved or misaligned accesses.
    pub fn read(&self, offset: u64, size: usize) -> Option<u32> {
        let lane = self.lane(offset, size)?;
        let value = match self.specs[lane.index].access {
            Access::WriteOnly => 0,
            _ => self.values[lane.index],
        };
        Some((value & lane.mask) >> lane.shift)
    }

    /// Applies the masked merge for a write at `offset`.
    ///
    /// Returns `None` (after logging) for reserved or misaligned offsets. Writes to read-only
    /// registers are logged and return a [`RegWrite`] with `old == new`.
    pub fn write(&mut self, offset: u64, size: usize, value: u32) -> Option<RegWrite> {
        let Some(lane) = self.lane(offset, size) else {
            tracing::warn!(
                target: GUEST_ERROR,
                device = self.device,
                "write to reserved offset {offset:#x} (size {size}) value {value:#x} ignored"
            );
            return None;
        };
        let spec = &self.specs[lane.index];
        let old = self.values[lane.index];
        let data = (value << lane.shift) & lane.mask;
        let effective = lane.mask & spec.writable;

        let new = match spec.access {
            Access::ReadOnly => {
                tracing::warn!(
                    target: GUEST_ERROR,
                    device = self.device,
                    "write to read-only register {} ignored",
                    spec.name
                );
                old
            }
            Access::ReadWrite | Access::WriteOnly => (old & !effective) | (data & effective),
            Access::WriteOneToClear => old & !(data & effective),
        };
        self.values[lane.index] = new;

        tracing::trace!(device = self.device, reg = spec.name, old, new, "register write");
        Some(RegWrite {
            index: lane.index,
            offset: spec.offset,
            old,
            new,
            data,
            lane_mask: lane.mask,
        })
    }

    pub fn save(&self) -> Vec<u8> {
        Encoder::new().vec_u32(&self.values).finish()
    }

    pub fn load(&mut self, buf: &[u8]) -> SnapshotResult<()> {
        let mut d = Decoder::new(buf);
        let values = d.vec_u32(self.values.len(), "too many registers")?;
        d.finish()?;
        if values.len() != self.values.len() {
            return Err(SnapshotError::InvalidFieldEncoding("register count"));
        }
        self.values = values;
        Ok(())
    }
}
