//! Backup frame storage: fixed-size replica frames plus their persisted
//! metadata, with in-memory and single-file backends.
//!
//! File layout: a superblock reserve at offset 0 recording which backup
//! incarnation owns the storage, then `num_frames` slots of
//! `frame_capacity + METADATA_RESERVE` bytes each. Replica bytes sit at the
//! head of a slot; the metadata block (length-prefixed MessagePack, crc32
//! guarded) sits in the reserve tail. A frame is valid iff its stored
//! metadata checksum matches and its capacity equals the store's.

use std::io::SeekFrom;
use std::path::Path;

use crate::ids::{Epoch, SegmentId, ServerId};
use crate::segment::Certificate;
use crate::utils::SeglineError;

use crc32fast::Hasher;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Storage frame index type.
pub type FrameId = usize;

/// Bytes reserved per frame for the metadata block.
pub const METADATA_RESERVE: u32 = 512;

/// Bytes reserved at the head of a backing file for the superblock.
pub const SUPERBLOCK_RESERVE: u64 = 512;

/// Persisted per-frame metadata. Everything a restarted backup needs to
/// re-index the replica without trusting the raw bytes.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct FrameMetadata {
    pub master_id: ServerId,
    pub segment_id: SegmentId,
    pub capacity: u32,
    pub certificate: Certificate,
    pub closed: bool,
    pub primary: bool,
    pub epoch: Epoch,
    pub cluster_name: String,
    pub checksum: u32,
}

impl FrameMetadata {
    /// Computes the checksum over the encoding with the checksum field
    /// zeroed.
    fn compute_checksum(&self) -> Result<u32, SeglineError> {
        let mut zeroed = self.clone();
        zeroed.checksum = 0;
        let encoded = rmp_serde::encode::to_vec(&zeroed)?;
        let mut hasher = Hasher::new();
        hasher.update(&encoded);
        Ok(hasher.finalize())
    }

    /// Stamps the checksum field.
    pub fn seal(mut self) -> Result<Self, SeglineError> {
        self.checksum = self.compute_checksum()?;
        Ok(self)
    }

    /// True iff the stored checksum matches the metadata contents.
    pub fn is_valid(&self) -> bool {
        self.compute_checksum()
            .map(|checksum| checksum == self.checksum)
            .unwrap_or(false)
    }
}

/// Persisted storage-ownership record: which backup incarnation of which
/// cluster last wrote this backing file.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct Superblock {
    pub cluster_name: String,
    pub server_id: ServerId,
    pub checksum: u32,
}

impl Superblock {
    fn compute_checksum(&self) -> Result<u32, SeglineError> {
        let mut zeroed = self.clone();
        zeroed.checksum = 0;
        let encoded = rmp_serde::encode::to_vec(&zeroed)?;
        let mut hasher = Hasher::new();
        hasher.update(&encoded);
        Ok(hasher.finalize())
    }

    pub fn seal(mut self) -> Result<Self, SeglineError> {
        self.checksum = self.compute_checksum()?;
        Ok(self)
    }

    pub fn is_valid(&self) -> bool {
        self.compute_checksum()
            .map(|checksum| checksum == self.checksum)
            .unwrap_or(false)
    }
}

struct MemoryFrame {
    data: Vec<u8>,
    metadata: Option<FrameMetadata>,
}

struct MemoryStore {
    frame_capacity: u32,
    frames: Vec<Option<MemoryFrame>>,
}

struct FileStore {
    frame_capacity: u32,
    backer: File,
    in_use: Vec<bool>,
}

enum StoreKind {
    Memory(MemoryStore),
    File(FileStore),
}

/// Replica frame store. One per backup process.
pub struct FrameStore {
    kind: StoreKind,
}

impl FrameStore {
    /// Creates a volatile in-memory store (testing and cache-only setups).
    pub fn new_memory(frame_capacity: u32, num_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(num_frames);
        frames.resize_with(num_frames, || None);
        FrameStore {
            kind: StoreKind::Memory(MemoryStore {
                frame_capacity,
                frames,
            }),
        }
    }

    /// Opens (creating if needed) a single-file store. Returns the store
    /// plus the previous owner's superblock if a valid one was found, so
    /// the service can decide whether to reuse or scribble what's there.
    pub async fn open_file(
        path: &Path,
        frame_capacity: u32,
        num_frames: usize,
    ) -> Result<(Self, Option<Superblock>), SeglineError> {
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("created backup storage file '{}'", path.display());
        }
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let slot = frame_capacity as u64 + METADATA_RESERVE as u64;
        let file_len = SUPERBLOCK_RESERVE + num_frames as u64 * slot;
        if backer.metadata().await?.len() < file_len {
            backer.set_len(file_len).await?;
        }

        // read out whatever superblock a prior incarnation left behind
        backer.seek(SeekFrom::Start(0)).await?;
        let mut reserve = vec![0u8; SUPERBLOCK_RESERVE as usize];
        backer.read_exact(&mut reserve).await?;
        let superblock = decode_block::<Superblock>(&reserve)
            .filter(|sb| sb.is_valid());

        Ok((
            FrameStore {
                kind: StoreKind::File(FileStore {
                    frame_capacity,
                    backer,
                    in_use: vec![false; num_frames],
                }),
            },
            superblock,
        ))
    }

    /// Frame capacity in bytes.
    pub fn frame_capacity(&self) -> u32 {
        match &self.kind {
            StoreKind::Memory(m) => m.frame_capacity,
            StoreKind::File(f) => f.frame_capacity,
        }
    }

    /// Total number of frames.
    pub fn num_frames(&self) -> usize {
        match &self.kind {
            StoreKind::Memory(m) => m.frames.len(),
            StoreKind::File(f) => f.in_use.len(),
        }
    }

    /// Number of frames currently free.
    pub fn num_free(&self) -> usize {
        match &self.kind {
            StoreKind::Memory(m) => {
                m.frames.iter().filter(|f| f.is_none()).count()
            }
            StoreKind::File(f) => {
                f.in_use.iter().filter(|used| !**used).count()
            }
        }
    }

    /// Claims a free frame, if any.
    pub fn allocate(&mut self) -> Option<FrameId> {
        match &mut self.kind {
            StoreKind::Memory(m) => {
                let frame = m.frames.iter().position(|f| f.is_none())?;
                m.frames[frame] = Some(MemoryFrame {
                    data: vec![0; m.frame_capacity as usize],
                    metadata: None,
                });
                Some(frame)
            }
            StoreKind::File(f) => {
                let frame = f.in_use.iter().position(|used| !*used)?;
                f.in_use[frame] = true;
                Some(frame)
            }
        }
    }

    /// Returns a frame to the free pool. The bytes stay on storage until
    /// reused; the restart-time garbage collector reclaims any replica a
    /// crash resurrects this way.
    pub fn free(&mut self, frame: FrameId) {
        match &mut self.kind {
            StoreKind::Memory(m) => m.frames[frame] = None,
            StoreKind::File(f) => f.in_use[frame] = false,
        }
    }

    /// Writes replica bytes into a frame at the given offset.
    pub async fn write_bytes(
        &mut self,
        frame: FrameId,
        offset: u32,
        data: &[u8],
    ) -> Result<(), SeglineError> {
        match &mut self.kind {
            StoreKind::Memory(m) => {
                let Some(mem) = m.frames[frame].as_mut() else {
                    return logged_err!("write to free frame {}", frame);
                };
                mem.data[offset as usize..offset as usize + data.len()]
                    .copy_from_slice(data);
                Ok(())
            }
            StoreKind::File(f) => {
                f.backer
                    .seek(SeekFrom::Start(
                        frame_start(f.frame_capacity, frame) + offset as u64,
                    ))
                    .await?;
                f.backer.write_all(data).await?;
                Ok(())
            }
        }
    }

    /// Durably records a frame's metadata block.
    pub async fn put_metadata(
        &mut self,
        frame: FrameId,
        metadata: &FrameMetadata,
    ) -> Result<(), SeglineError> {
        let block = encode_block(metadata)?;
        match &mut self.kind {
            StoreKind::Memory(m) => {
                let Some(mem) = m.frames[frame].as_mut() else {
                    return logged_err!("metadata on free frame {}", frame);
                };
                mem.metadata = Some(metadata.clone());
                Ok(())
            }
            StoreKind::File(f) => {
                f.backer
                    .seek(SeekFrom::Start(metadata_start(
                        f.frame_capacity,
                        frame,
                    )))
                    .await?;
                f.backer.write_all(&block).await?;
                f.backer.sync_data().await?;
                Ok(())
            }
        }
    }

    /// Reads a frame's metadata block back, if one decodes at all.
    pub async fn read_metadata(
        &mut self,
        frame: FrameId,
    ) -> Result<Option<FrameMetadata>, SeglineError> {
        match &mut self.kind {
            StoreKind::Memory(m) => Ok(m
                .frames
                .get(frame)
                .and_then(|f| f.as_ref())
                .and_then(|f| f.metadata.clone())),
            StoreKind::File(f) => {
                f.backer
                    .seek(SeekFrom::Start(metadata_start(
                        f.frame_capacity,
                        frame,
                    )))
                    .await?;
                let mut reserve = vec![0u8; METADATA_RESERVE as usize];
                f.backer.read_exact(&mut reserve).await?;
                Ok(decode_block::<FrameMetadata>(&reserve))
            }
        }
    }

    /// Loads a frame's full byte payload.
    pub async fn load_bytes(
        &mut self,
        frame: FrameId,
    ) -> Result<Vec<u8>, SeglineError> {
        match &mut self.kind {
            StoreKind::Memory(m) => match m.frames[frame].as_ref() {
                Some(mem) => Ok(mem.data.clone()),
                None => logged_err!("load of free frame {}", frame),
            },
            StoreKind::File(f) => {
                f.backer
                    .seek(SeekFrom::Start(frame_start(
                        f.frame_capacity,
                        frame,
                    )))
                    .await?;
                let mut data = vec![0u8; f.frame_capacity as usize];
                f.backer.read_exact(&mut data).await?;
                Ok(data)
            }
        }
    }

    /// Overwrites a frame's metadata block with garbage, so a replica left
    /// behind by a different deployment can never be reused.
    pub async fn scribble(
        &mut self,
        frame: FrameId,
    ) -> Result<(), SeglineError> {
        match &mut self.kind {
            StoreKind::Memory(m) => {
                if let Some(Some(mem)) = m.frames.get_mut(frame) {
                    mem.metadata = None;
                }
                Ok(())
            }
            StoreKind::File(f) => {
                f.backer
                    .seek(SeekFrom::Start(metadata_start(
                        f.frame_capacity,
                        frame,
                    )))
                    .await?;
                f.backer
                    .write_all(&vec![0u8; METADATA_RESERVE as usize])
                    .await?;
                f.backer.sync_data().await?;
                Ok(())
            }
        }
    }

    /// Durably records the current owner of this storage.
    pub async fn write_superblock(
        &mut self,
        cluster_name: &str,
        server_id: ServerId,
    ) -> Result<(), SeglineError> {
        let StoreKind::File(f) = &mut self.kind else {
            return Ok(());
        };
        let superblock = Superblock {
            cluster_name: cluster_name.into(),
            server_id,
            checksum: 0,
        }
        .seal()?;
        let block = encode_block(&superblock)?;
        f.backer.seek(SeekFrom::Start(0)).await?;
        f.backer.write_all(&block).await?;
        f.backer.sync_data().await?;
        Ok(())
    }

    /// Restart scan: decodes every slot's metadata and returns the frames
    /// whose checksum holds and whose capacity matches this store; those
    /// frames are marked in use. Everything else stays free.
    pub async fn scan(
        &mut self,
    ) -> Result<Vec<(FrameId, FrameMetadata)>, SeglineError> {
        let mut found = vec![];
        for frame in 0..self.num_frames() {
            let Some(metadata) = self.read_metadata(frame).await? else {
                continue;
            };
            if !metadata.is_valid() {
                pf_warn!(
                    "frame {} has corrupt metadata; leaving it free",
                    frame
                );
                continue;
            }
            if metadata.capacity != self.frame_capacity() {
                pf_warn!(
                    "frame {} was written with capacity {}, expected {}; \
                     leaving it free",
                    frame,
                    metadata.capacity,
                    self.frame_capacity()
                );
                continue;
            }
            if let StoreKind::File(f) = &mut self.kind {
                f.in_use[frame] = true;
            }
            found.push((frame, metadata));
        }
        Ok(found)
    }
}

fn frame_start(frame_capacity: u32, frame: FrameId) -> u64 {
    SUPERBLOCK_RESERVE
        + frame as u64 * (frame_capacity as u64 + METADATA_RESERVE as u64)
}

fn metadata_start(frame_capacity: u32, frame: FrameId) -> u64 {
    frame_start(frame_capacity, frame) + frame_capacity as u64
}

/// Encodes a block as a 4-byte little-endian length plus MessagePack,
/// padded into the metadata reserve.
fn encode_block<T: Serialize>(value: &T) -> Result<Vec<u8>, SeglineError> {
    let encoded = rmp_serde::encode::to_vec(value)?;
    if encoded.len() + 4 > METADATA_RESERVE as usize {
        return logged_err!(
            "metadata block of {} bytes exceeds reserve",
            encoded.len()
        );
    }
    let mut block = vec![0u8; METADATA_RESERVE as usize];
    block[..4].copy_from_slice(&(encoded.len() as u32).to_le_bytes());
    block[4..4 + encoded.len()].copy_from_slice(&encoded);
    Ok(block)
}

/// Decodes a block written by `encode_block`; `None` on any malformation.
fn decode_block<T: for<'de> Deserialize<'de>>(reserve: &[u8]) -> Option<T> {
    if reserve.len() < 4 {
        return None;
    }
    let mut header = [0u8; 4];
    header.copy_from_slice(&reserve[..4]);
    let len = u32::from_le_bytes(header) as usize;
    if len == 0 || 4 + len > reserve.len() {
        return None;
    }
    rmp_serde::decode::from_slice(&reserve[4..4 + len]).ok()
}
