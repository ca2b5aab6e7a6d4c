use std::collections::BTreeMap;

use thiserror::Error;

/// Magic bytes at the start of every device snapshot blob.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"MCUS";

/// Version of the container format itself (not of any device payload).
pub const SNAPSHOT_FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

const HEADER_LEN: usize = 16;
const FIELD_HEADER_LEN: usize = 6;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot format version {found} (supported major {supported})")]
    UnsupportedFormatVersion { found: u16, supported: u16 },

    #[error("snapshot device id mismatch (expected {expected:?}, found {found:?})")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported device major version {found} (supported {supported})")]
    UnsupportedDeviceMajorVersion { found: u16, supported: u16 },

    #[error("duplicate snapshot field tag {0}")]
    DuplicateFieldTag(u16),

    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: SnapshotVersion,
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

/// Builds a device snapshot blob.
///
/// Fields may be written in any order; [`SnapshotWriter::finish`] always emits them sorted by
/// tag so that two equal device states produce byte-identical snapshots.
#[derive(Debug)]
pub struct SnapshotWriter {
    header: SnapshotHeader,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            header: SnapshotHeader {
                format_version: SNAPSHOT_FORMAT_VERSION,
                device_id,
                device_version,
            },
            fields: BTreeMap::new(),
        }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        let prev = self.fields.insert(tag, bytes);
        debug_assert!(prev.is_none(), "snapshot field tag {tag} written twice");
    }

    pub fn field_u8(&mut self, tag: u16, value: u8) {
        self.field_bytes(tag, vec![value]);
    }

    pub fn field_u16(&mut self, tag: u16, value: u16) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, value: u32) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, value: u64) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_bool(&mut self, tag: u16, value: bool) {
        self.field_u8(tag, u8::from(value));
    }

    pub fn finish(self) -> Vec<u8> {
        let payload_len: usize = self
            .fields
            .values()
            .map(|v| FIELD_HEADER_LEN + v.len())
            .sum();
        let mut out = Vec::with_capacity(HEADER_LEN + payload_len);

        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&self.header.format_version.major.to_le_bytes());
        out.extend_from_slice(&self.header.format_version.minor.to_le_bytes());
        out.extend_from_slice(&self.header.device_id);
        out.extend_from_slice(&self.header.device_version.major.to_le_bytes());
        out.extend_from_slice(&self.header.device_version.minor.to_le_bytes());

        for (tag, value) in &self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(value);
        }
        out
    }
}

/// Parsed view over a device snapshot blob.
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], expected_device_id: [u8; 4]) -> SnapshotResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::UnexpectedEof);
        }
        if bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }

        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let format_version = SnapshotVersion::new(u16_at(4), u16_at(6));
        if format_version.major != SNAPSHOT_FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedFormatVersion {
                found: format_version.major,
                supported: SNAPSHOT_FORMAT_VERSION.major,
            });
        }

        let mut device_id = [0u8; 4];
        device_id.copy_from_slice(&bytes[8..12]);
        if device_id != expected_device_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: expected_device_id,
                found: device_id,
            });
        }
        let device_version = SnapshotVersion::new(u16_at(12), u16_at(14));

        let mut fields = BTreeMap::new();
        let mut rest = &bytes[HEADER_LEN..];
        while !rest.is_empty() {
            if rest.len() < FIELD_HEADER_LEN {
                return Err(SnapshotError::UnexpectedEof);
            }
            let tag = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            rest = &rest[FIELD_HEADER_LEN..];
            if rest.len() < len {
                return Err(SnapshotError::UnexpectedEof);
            }
            let (value, tail) = rest.split_at(len);
            if fields.insert(tag, value).is_some() {
                return Err(SnapshotError::DuplicateFieldTag(tag));
            }
            rest = tail;
        }

        Ok(Self {
            header: SnapshotHeader {
                format_version,
                device_id,
                device_version,
            },
            fields,
        })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        let found = self.header.device_version.major;
        if found != supported {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion { found, supported });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    fn fixed<const N: usize>(&self, tag: u16, what: &'static str) -> SnapshotResult<Option<[u8; N]>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(buf) => buf
                .try_into()
                .map(Some)
                .map_err(|_| SnapshotError::InvalidFieldEncoding(what)),
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag, "u8")?.map(|b| b[0]))
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed::<2>(tag, "u16")?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed::<4>(tag, "u32")?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed::<8>(tag, "u64")?.map(u64::from_le_bytes))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: [u8; 4] = *b"TEST";

    #[test]
    fn fields_are_emitted_in_tag_order() {
        let mut a = SnapshotWriter::new(ID, SnapshotVersion::new(1, 0));
        a.field_u32(2, 0xdead_beef);
        a.field_u8(1, 7);

        let mut b = SnapshotWriter::new(ID, SnapshotVersion::new(1, 0));
        b.field_u8(1, 7);
        b.field_u32(2, 0xdead_beef);

        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn unknown_tags_are_skipped_and_missing_tags_are_none() {
        let mut w = SnapshotWriter::new(ID, SnapshotVersion::new(1, 3));
        w.field_u16(9, 0x1234);
        w.field_bool(3, true);
        let bytes = w.finish();

        let r = SnapshotReader::parse(&bytes, ID).unwrap();
        r.ensure_device_major(1).unwrap();
        assert_eq!(r.header().device_version.minor, 3);
        assert_eq!(r.bool(3).unwrap(), Some(true));
        assert_eq!(r.u32(4).unwrap(), None);
    }

    #[test]
    fn wrong_width_is_an_encoding_error() {
        let mut w = SnapshotWriter::new(ID, SnapshotVersion::new(1, 0));
        w.field_u8(1, 1);
        let bytes = w.finish();

        let r = SnapshotReader::parse(&bytes, ID).unwrap();
        assert_eq!(r.u32(1), Err(SnapshotError::InvalidFieldEncoding("u32")));
    }

    #[test]
    fn truncated_field_is_rejected() {
        let mut w = SnapshotWriter::new(ID, SnapshotVersion::new(1, 0));
        w.field_u64(1, 1);
        let mut bytes = w.finish();
        bytes.pop();

        assert_eq!(
            SnapshotReader::parse(&bytes, ID).unwrap_err(),
            SnapshotError::UnexpectedEof
        );
    }

    #[test]
    fn header_mismatches_are_reported() {
        let bytes = SnapshotWriter::new(ID, SnapshotVersion::new(2, 0)).finish();

        let err = SnapshotReader::parse(&bytes, *b"NOPE").unwrap_err();
        assert!(matches!(err, SnapshotError::DeviceIdMismatch { .. }));

        let r = SnapshotReader::parse(&bytes, ID).unwrap();
        assert_eq!(
            r.ensure_device_major(1),
            Err(SnapshotError::UnsupportedDeviceMajorVersion {
                found: 2,
                supported: 1
            })
        );

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert_eq!(
            SnapshotReader::parse(&bad_magic, ID).unwrap_err(),
            SnapshotError::InvalidMagic
        );
    }
}
