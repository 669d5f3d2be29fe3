//! Checksummed regions in the sleep-retaining memory
//!
//! The sleep-retaining memory (RTC memory on most targets) is the only thing
//! that survives a deep-sleep cycle. Every region written there carries a
//! leading CRC32 over the rest of the region; a region whose checksum does
//! not match is reported as [`StoreError::Corrupt`] and the caller
//! reinitializes it.
//!
//! ## Layout
//!
//! ```text
//! offset 0                     28          (aligned)
//!        | crc | state record  | crc | user region ... |
//! ```

mod record;

pub use record::*;

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, warn};
use serde::{Serialize, de::DeserializeOwned};
use thiserror_no_std::Error;

use crate::crc::crc32;

/// Access granularity of the sleep-retaining memory, in bytes.
pub const WORD_SIZE: usize = 4;

/// Size of the leading checksum of every region.
pub const CHECKSUM_LEN: usize = 4;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("region at {offset} is not aligned to the 4-byte word size")]
    Misaligned { offset: usize },
    #[error("region {offset}..{end} exceeds memory capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        end: usize,
        capacity: usize,
    },
    #[error("region of {length} bytes cannot hold its checksum")]
    TooShort { length: usize },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Corrupt { stored: u32, computed: u32 },
    #[error("region content is not a valid record")]
    Invalid,
    #[error("user value does not fit its region")]
    Encoding,
    #[error("memory backend failure")]
    Backend,
}

/// Memory that keeps its content across deep sleep (but not across a full reset).
pub trait RtcMemory {
    /// Total size in bytes.
    fn capacity(&self) -> usize;

    /// Fill `buf` from `offset`. `offset` is word aligned and the range in bounds.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Store `data` at `offset`. `offset` is word aligned and the range in bounds.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError>;
}

/// Sleep-retaining memory mapped as a plain byte array.
///
/// On targets that expose RTC RAM through a linker section this wraps the
/// `static` buffer; on the host it backs the simulator and the tests.
#[derive(Debug, Clone)]
pub struct RamRegion<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> RamRegion<N> {
    /// Zero-filled memory, as after a cold power-on.
    pub const fn new() -> Self {
        Self { bytes: [0; N] }
    }

    pub const fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; N] {
        &mut self.bytes
    }
}

impl<const N: usize> Default for RamRegion<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RtcMemory for RamRegion<N> {
    fn capacity(&self) -> usize {
        N
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        let end = offset + buf.len();
        let source = self.bytes.get(offset..end).ok_or(StoreError::OutOfBounds {
            offset,
            end,
            capacity: N,
        })?;
        buf.copy_from_slice(source);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        let end = offset + data.len();
        let target = self
            .bytes
            .get_mut(offset..end)
            .ok_or(StoreError::OutOfBounds {
                offset,
                end,
                capacity: N,
            })?;
        target.copy_from_slice(data);
        Ok(())
    }
}

/// Round `length` up to the next word boundary.
pub const fn align_up(length: usize) -> usize {
    length.div_ceil(WORD_SIZE) * WORD_SIZE
}

/// CRC-validated reads and writes over an [`RtcMemory`].
pub struct ChecksummedStore<M: RtcMemory> {
    memory: M,
}

impl<M: RtcMemory> ChecksummedStore<M> {
    pub fn new(memory: M) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn into_inner(self) -> M {
        self.memory
    }

    fn check_bounds(&self, offset: usize, length: usize) -> Result<(), StoreError> {
        if offset % WORD_SIZE != 0 {
            return Err(StoreError::Misaligned { offset });
        }
        if length < CHECKSUM_LEN {
            return Err(StoreError::TooShort { length });
        }
        let capacity = self.memory.capacity();
        let end = offset + length;
        if end > capacity {
            return Err(StoreError::OutOfBounds {
                offset,
                end,
                capacity,
            });
        }
        Ok(())
    }

    /// Read `length` bytes at `offset` and validate the leading checksum.
    ///
    /// Returns the whole region, checksum included, so fixed-layout records
    /// can be decoded at their documented offsets.
    pub fn read(&self, offset: usize, length: usize) -> Result<Vec<u8>, StoreError> {
        self.check_bounds(offset, length)?;

        let mut region = vec![0u8; length];
        self.memory.read(offset, &mut region)?;

        let stored = u32::from_le_bytes([region[0], region[1], region[2], region[3]]);
        let computed = crc32(&region[CHECKSUM_LEN..]);
        if stored != computed {
            debug!(
                "Checksum mismatch at {}: stored {:#010x}, computed {:#010x}",
                offset, stored, computed
            );
            return Err(StoreError::Corrupt { stored, computed });
        }

        Ok(region)
    }

    /// Stamp the checksum into the first word of `region` and write it at `offset`.
    pub fn write(&mut self, offset: usize, region: &mut [u8]) -> Result<(), StoreError> {
        self.check_bounds(offset, region.len())?;

        let checksum = crc32(&region[CHECKSUM_LEN..]);
        region[..CHECKSUM_LEN].copy_from_slice(&checksum.to_le_bytes());
        self.memory.write(offset, region)
    }
}

/// Result of loading a region at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Content was valid and resumed.
    Restored,
    /// Content was absent or corrupt and has been reinitialized.
    Reinitialized,
}

/// The framework state record plus the application's opaque region.
pub struct StateStore<M: RtcMemory> {
    store: ChecksummedStore<M>,
    user_len: usize,
}

impl<M: RtcMemory> StateStore<M> {
    /// `user_len` is the payload size of the application region, 0 for none.
    pub fn new(memory: M, user_len: usize) -> Self {
        Self {
            store: ChecksummedStore::new(memory),
            user_len,
        }
    }

    /// Offset of the application region.
    pub const fn user_offset() -> usize {
        align_up(STATE_RECORD_LEN)
    }

    /// Total bytes of the application region, checksum and padding included.
    pub fn user_region_len(&self) -> usize {
        align_up(CHECKSUM_LEN + self.user_len)
    }

    pub fn user_len(&self) -> usize {
        self.user_len
    }

    pub fn store(&self) -> &ChecksummedStore<M> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChecksummedStore<M> {
        &mut self.store
    }

    pub fn into_inner(self) -> M {
        self.store.into_inner()
    }

    /// Load the state record, reinitializing it when absent or corrupt.
    pub fn load(&mut self) -> Result<(PersistentState, LoadOutcome), StoreError> {
        let decoded = self
            .store
            .read(0, STATE_RECORD_LEN)
            .and_then(|region| PersistentState::decode(&region));

        match decoded {
            Ok(state) => Ok((state, LoadOutcome::Restored)),
            Err(e) => {
                warn!("Persistent state unusable ({}), reinitializing", e);
                let state = self.reset()?;
                Ok((state, LoadOutcome::Reinitialized))
            }
        }
    }

    /// Write the default record and return it.
    pub fn reset(&mut self) -> Result<PersistentState, StoreError> {
        let state = PersistentState::default();
        self.save(&state)?;
        Ok(state)
    }

    pub fn save(&mut self, state: &PersistentState) -> Result<(), StoreError> {
        let mut region = state.encode();
        self.store.write(0, &mut region)
    }

    /// Load the application payload, zero-filling it when absent or corrupt.
    pub fn load_user(&mut self) -> Result<(Vec<u8>, LoadOutcome), StoreError> {
        if self.user_len == 0 {
            return Ok((Vec::new(), LoadOutcome::Restored));
        }

        match self.store.read(Self::user_offset(), self.user_region_len()) {
            Ok(region) => {
                let payload = region[CHECKSUM_LEN..CHECKSUM_LEN + self.user_len].to_vec();
                Ok((payload, LoadOutcome::Restored))
            }
            Err(e) => {
                warn!("User state unusable ({}), reinitializing", e);
                let payload = self.reset_user()?;
                Ok((payload, LoadOutcome::Reinitialized))
            }
        }
    }

    pub fn reset_user(&mut self) -> Result<Vec<u8>, StoreError> {
        let payload = vec![0u8; self.user_len];
        self.save_user(&payload)?;
        Ok(payload)
    }

    /// Persist the application payload. Longer input is cut to the region size.
    pub fn save_user(&mut self, payload: &[u8]) -> Result<(), StoreError> {
        if self.user_len == 0 {
            return Ok(());
        }

        let mut region = vec![0u8; self.user_region_len()];
        let len = payload.len().min(self.user_len);
        region[CHECKSUM_LEN..CHECKSUM_LEN + len].copy_from_slice(&payload[..len]);
        self.store.write(Self::user_offset(), &mut region)
    }
}

/// Decode an application value previously stored with [`encode_user`].
///
/// An all-zero payload (fresh region) yields `T::default()`.
pub fn decode_user<T: DeserializeOwned + Default>(payload: &[u8]) -> Result<T, StoreError> {
    if payload.iter().all(|&b| b == 0) {
        return Ok(T::default());
    }
    postcard::from_bytes(payload).map_err(|_| StoreError::Encoding)
}

/// Encode an application value into a payload of exactly `len` bytes.
pub fn encode_user<T: Serialize>(value: &T, len: usize) -> Result<Vec<u8>, StoreError> {
    let mut payload = vec![0u8; len];
    postcard::to_slice(value, &mut payload).map_err(|_| StoreError::Encoding)?;
    Ok(payload)
}
