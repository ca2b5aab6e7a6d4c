//! Little-endian field codec for composite snapshot fields.
//!
//! Devices use [`Encoder`] to pack a structured value (a register list, a FIFO) into a single
//! TLV field and [`Decoder`] to unpack it again. Decoding never panics on hostile input.

use crate::{SnapshotError, SnapshotResult};

#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bool(self, v: bool) -> Self {
        self.u8(u8::from(v))
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed (`u32`) list of `u32` values.
    pub fn vec_u32(self, v: &[u32]) -> Self {
        v.iter().fold(self.u32(v.len() as u32), |e, &x| e.u32(x))
    }

    /// Length-prefixed (`u32`) byte string.
    pub fn vec_u8(self, v: &[u8]) -> Self {
        self.u32(v.len() as u32).bytes(v)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn bytes(&mut self, len: usize) -> SnapshotResult<&'a [u8]> {
        if self.buf.len() < len {
            return Err(SnapshotError::UnexpectedEof);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> SnapshotResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> SnapshotResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> SnapshotResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> SnapshotResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> SnapshotResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn bool(&mut self) -> SnapshotResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }

    /// Reads a length-prefixed `u32` list, rejecting counts above `max`.
    pub fn vec_u32(&mut self, max: usize, what: &'static str) -> SnapshotResult<Vec<u32>> {
        let count = self.u32()? as usize;
        if count > max {
            return Err(SnapshotError::InvalidFieldEncoding(what));
        }
        (0..count).map(|_| self.u32()).collect()
    }

    /// Reads a length-prefixed byte string, rejecting lengths above `max`.
    pub fn vec_u8(&mut self, max: usize, what: &'static str) -> SnapshotResult<Vec<u8>> {
        let count = self.u32()? as usize;
        if count > max {
            return Err(SnapshotError::InvalidFieldEncoding(what));
        }
        Ok(self.bytes(count)?.to_vec())
    }

    pub fn finish(self) -> SnapshotResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(SnapshotError::Corrupt("trailing bytes in field"))
        }
    }
}
