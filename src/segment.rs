//! In-memory log segment: the source bytes being replicated, their
//! certificates, and the in-band log digest.
//!
//! The full segment layout (object formats, tombstones, the cleaner's
//! bookkeeping) lives with the log module; replication only needs an
//! append-only byte region whose certified prefix can be read out and a
//! typed entry stream recovery can filter by partition.

use std::sync::Arc;

use crate::ids::SegmentId;
use crate::utils::SeglineError;

use bytes::{BufMut, Bytes, BytesMut};

use crc32fast::Hasher;

use get_size::GetSize;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};

/// Attestation that the first `segment_len` bytes of a segment (or recovery
/// segment) form a structurally valid prefix. A backup treats replica bytes
/// as replayable only up to the length its latest certificate attests.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Certificate {
    pub segment_len: u32,
    pub checksum: u32,
}

impl Certificate {
    /// Computes the certificate attesting to the given byte prefix.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        Certificate {
            segment_len: data.len() as u32,
            checksum: hasher.finalize(),
        }
    }

    /// Checks the certificate against stored bytes. `data` may be longer
    /// than the certified prefix (e.g. a partially overwritten frame).
    pub fn verify(&self, data: &[u8]) -> bool {
        if self.segment_len as usize > data.len() {
            return false;
        }
        let mut hasher = Hasher::new();
        hasher.update(&data[..self.segment_len as usize]);
        hasher.finalize() == self.checksum
    }
}

/// Typed entries appended to a segment. Each entry is stored as a 4-byte
/// little-endian length followed by its MessagePack encoding.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum LogEntry {
    /// A live object belonging to some tablet.
    Object {
        table_id: u64,
        key_hash: u64,
        value: Vec<u8>,
    },

    /// The log digest: every segment id currently constituting the log.
    /// Appended as the first entry of a new log head, so it rides in-band
    /// on the opening write of that segment.
    Digest { segment_ids: Vec<SegmentId> },
}

/// Byte overhead of one encoded entry beyond its payload encoding.
const ENTRY_HEADER_LEN: usize = 4;

struct SegmentInner {
    data: BytesMut,
    hasher: Hasher,
}

/// An append-only in-memory segment of fixed capacity. Shared between the
/// log writer (appending) and the replication engine (reading appended
/// length and byte ranges), hence the interior lock.
pub struct Segment {
    capacity: u32,
    inner: RwLock<SegmentInner>,
}

impl Segment {
    /// Creates an empty segment of the given capacity.
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Segment {
            capacity,
            inner: RwLock::new(SegmentInner {
                data: BytesMut::with_capacity(capacity as usize),
                hasher: Hasher::new(),
            }),
        })
    }

    /// Segment capacity in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Appends one entry. Returns the appended length after the append.
    pub fn append(&self, entry: &LogEntry) -> Result<u32, SeglineError> {
        let encoded = rmp_serde::encode::to_vec(entry)?;
        let mut inner = self.inner.write();
        let new_len =
            inner.data.len() + ENTRY_HEADER_LEN + encoded.len();
        if new_len > self.capacity as usize {
            return Err(SeglineError(format!(
                "append of {} bytes overflows segment capacity {}",
                ENTRY_HEADER_LEN + encoded.len(),
                self.capacity
            )));
        }
        let mut header = [0u8; ENTRY_HEADER_LEN];
        header.copy_from_slice(&(encoded.len() as u32).to_le_bytes());
        inner.data.put_slice(&header);
        inner.data.put_slice(&encoded);
        inner.hasher.update(&header);
        inner.hasher.update(&encoded);
        Ok(new_len as u32)
    }

    /// Returns the current appended length and the certificate attesting to
    /// exactly that prefix.
    pub fn appended_len(&self) -> (u32, Certificate) {
        let inner = self.inner.read();
        let certificate = Certificate {
            segment_len: inner.data.len() as u32,
            checksum: inner.hasher.clone().finalize(),
        };
        (inner.data.len() as u32, certificate)
    }

    /// Copies out the byte range `[offset, offset + length)`.
    pub fn read_range(
        &self,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, SeglineError> {
        let inner = self.inner.read();
        let (offset, length) = (offset as usize, length as usize);
        if offset + length > inner.data.len() {
            return Err(SeglineError(format!(
                "read range [{}, {}) out of appended bound {}",
                offset,
                offset + length,
                inner.data.len()
            )));
        }
        Ok(Bytes::copy_from_slice(
            &inner.data[offset..offset + length],
        ))
    }
}

/// Iterator over the typed entries of an encoded entry stream (a certified
/// replica prefix or a recovery segment). Stops at the first byte that
/// cannot form a complete entry.
pub struct EntryIter<'a> {
    data: &'a [u8],
    offset: usize,
}

/// Iterates the entries of `data`, which must be a prefix attested by some
/// certificate (garbage tails are the caller's problem).
pub fn iter_entries(data: &[u8]) -> EntryIter<'_> {
    EntryIter { data, offset: 0 }
}

impl Iterator for EntryIter<'_> {
    type Item = Result<LogEntry, SeglineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + ENTRY_HEADER_LEN > self.data.len() {
            return None;
        }
        let mut header = [0u8; ENTRY_HEADER_LEN];
        header.copy_from_slice(
            &self.data[self.offset..self.offset + ENTRY_HEADER_LEN],
        );
        let len = u32::from_le_bytes(header) as usize;
        let start = self.offset + ENTRY_HEADER_LEN;
        if start + len > self.data.len() {
            return Some(Err(SeglineError(format!(
                "entry at offset {} runs past certified length {}",
                self.offset,
                self.data.len()
            ))));
        }
        self.offset = start + len;
        Some(
            rmp_serde::decode::from_slice(&self.data[start..start + len])
                .map_err(SeglineError::from),
        )
    }
}

/// Appends one already-encoded entry to a recovery-segment buffer.
pub fn push_encoded_entry(
    buf: &mut Vec<u8>,
    entry: &LogEntry,
) -> Result<(), SeglineError> {
    let encoded = rmp_serde::encode::to_vec(entry)?;
    buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    buf.extend_from_slice(&encoded);
    Ok(())
}

/// Scans an entry stream for the log digest. Returns the first digest found
/// (a log head carries it as its first entry).
pub fn find_digest(data: &[u8]) -> Option<Vec<SegmentId>> {
    for entry in iter_entries(data) {
        match entry {
            Ok(LogEntry::Digest { segment_ids }) => return Some(segment_ids),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod segment_tests {
    use super::*;

    #[test]
    fn append_and_certify() -> Result<(), SeglineError> {
        let segment = Segment::new(4096);
        let (len, cert) = segment.appended_len();
        assert_eq!(len, 0);
        assert_eq!(cert.segment_len, 0);

        segment.append(&LogEntry::Object {
            table_id: 1,
            key_hash: 77,
            value: b"hello".to_vec(),
        })?;
        let (len, cert) = segment.appended_len();
        assert!(len > 0);
        assert_eq!(cert.segment_len, len);

        let bytes = segment.read_range(0, len)?;
        assert!(cert.verify(&bytes));
        assert!(!Certificate { segment_len: len, checksum: 0 }.verify(&bytes));
        Ok(())
    }

    #[test]
    fn read_range_bounds() {
        let segment = Segment::new(128);
        assert!(segment.read_range(0, 1).is_err());
    }

    #[test]
    fn capacity_overflow() {
        let segment = Segment::new(16);
        let result = segment.append(&LogEntry::Object {
            table_id: 1,
            key_hash: 1,
            value: vec![0; 64],
        });
        assert!(result.is_err());
    }

    #[test]
    fn iterate_entries() -> Result<(), SeglineError> {
        let segment = Segment::new(4096);
        segment.append(&LogEntry::Digest {
            segment_ids: vec![88, 89],
        })?;
        segment.append(&LogEntry::Object {
            table_id: 123,
            key_hash: 5,
            value: b"v".to_vec(),
        })?;
        let (len, _) = segment.appended_len();
        let bytes = segment.read_range(0, len)?;

        let entries: Vec<_> = iter_entries(&bytes)
            .collect::<Result<Vec<_>, SeglineError>>()?;
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            LogEntry::Digest { segment_ids: vec![88, 89] }
        );
        Ok(())
    }

    #[test]
    fn digest_extraction() -> Result<(), SeglineError> {
        let segment = Segment::new(4096);
        segment.append(&LogEntry::Digest { segment_ids: vec![88] })?;
        let (len, _) = segment.appended_len();
        let bytes = segment.read_range(0, len)?;
        assert_eq!(find_digest(&bytes), Some(vec![88]));

        let plain = Segment::new(4096);
        plain.append(&LogEntry::Object {
            table_id: 1,
            key_hash: 1,
            value: vec![],
        })?;
        let (len, _) = plain.appended_len();
        let bytes = plain.read_range(0, len)?;
        assert_eq!(find_digest(&bytes), None);
        Ok(())
    }
}
