//! Fixed binary layout of the framework state record.
//!
//! Binary format (little-endian, 28 bytes):
//! - checksum: 4 bytes (u32, CRC32 of bytes 4..28)
//! - magic: 4 bytes (u32)
//! - state: 1 byte
//! - return_state: 1 byte
//! - hours_24_count: 2 bytes (u16)
//! - one_hour_step_count: 4 bytes (u32, milliseconds)
//! - lost_count: 4 bytes (u32)
//! - elapse_time: 8 bytes (u64, microseconds)

use super::StoreError;
use crate::lifecycle::State;

/// Marker guarding against stale or foreign data after a firmware change.
pub const STATE_MAGIC: u32 = 0x55AA_AA55;

/// Size of the encoded record, checksum included.
pub const STATE_RECORD_LEN: usize = 28;

const MAGIC_AT: usize = 4;
const STATE_AT: usize = 8;
const RETURN_STATE_AT: usize = 9;
const HOURS_AT: usize = 10;
const STEP_AT: usize = 12;
const LOST_AT: usize = 16;
const ELAPSE_AT: usize = 20;

/// Lifecycle state carried across power-off cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentState {
    pub magic: u32,
    /// State the next activation runs in.
    pub state: State,
    /// State to resume after the `Hours24` side-trip.
    pub return_state: State,
    /// Completed hours toward the 24 hour watchdog (0..24).
    pub hours_24_count: u16,
    /// Milliseconds accumulated toward the next hour.
    pub one_hour_step_count: u32,
    /// Broker loss episodes since the last full reset.
    pub lost_count: u32,
    /// Microseconds spent in the previous activation (sleep included in battery mode).
    pub elapse_time: u64,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            magic: STATE_MAGIC,
            state: State::Startup,
            return_state: State::WaitForEvent,
            hours_24_count: 0,
            one_hour_step_count: 0,
            lost_count: 0,
            elapse_time: 0,
        }
    }
}

impl PersistentState {
    /// Encode into a region whose checksum word is left zeroed for the store to fill.
    pub fn encode(&self) -> [u8; STATE_RECORD_LEN] {
        let mut bytes = [0u8; STATE_RECORD_LEN];

        bytes[MAGIC_AT..MAGIC_AT + 4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[STATE_AT] = self.state as u8;
        bytes[RETURN_STATE_AT] = self.return_state as u8;
        bytes[HOURS_AT..HOURS_AT + 2].copy_from_slice(&self.hours_24_count.to_le_bytes());
        bytes[STEP_AT..STEP_AT + 4].copy_from_slice(&self.one_hour_step_count.to_le_bytes());
        bytes[LOST_AT..LOST_AT + 4].copy_from_slice(&self.lost_count.to_le_bytes());
        bytes[ELAPSE_AT..ELAPSE_AT + 8].copy_from_slice(&self.elapse_time.to_le_bytes());

        bytes
    }

    /// Decode a checksum-validated region.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < STATE_RECORD_LEN {
            return Err(StoreError::Invalid);
        }

        let magic = read_u32(bytes, MAGIC_AT)?;
        if magic != STATE_MAGIC {
            return Err(StoreError::Invalid);
        }

        let state = State::try_from(bytes[STATE_AT]).map_err(|_| StoreError::Invalid)?;
        let return_state =
            State::try_from(bytes[RETURN_STATE_AT]).map_err(|_| StoreError::Invalid)?;

        let hours = bytes
            .get(HOURS_AT..HOURS_AT + 2)
            .ok_or(StoreError::Invalid)?;

        Ok(Self {
            magic,
            state,
            return_state,
            hours_24_count: u16::from_le_bytes([hours[0], hours[1]]),
            one_hour_step_count: read_u32(bytes, STEP_AT)?,
            lost_count: read_u32(bytes, LOST_AT)?,
            elapse_time: read_u64(bytes, ELAPSE_AT)?,
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, StoreError> {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes.get(at..at + 4).ok_or(StoreError::Invalid)?);
    Ok(u32::from_le_bytes(word))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, StoreError> {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes.get(at..at + 8).ok_or(StoreError::Invalid)?);
    Ok(u64::from_le_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_word_aligned() {
        assert_eq!(STATE_RECORD_LEN % super::super::WORD_SIZE, 0);
    }

    #[test]
    fn test_field_offsets() {
        let state = PersistentState {
            magic: STATE_MAGIC,
            state: State::ProcessEvent,
            return_state: State::WaitEndEvent,
            hours_24_count: 0x0102,
            one_hour_step_count: 0x0A0B_0C0D,
            lost_count: 5,
            elapse_time: 0x1122_3344_5566_7788,
        };
        let bytes = state.encode();

        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x55, 0xAA, 0xAA, 0x55]);
        assert_eq!(bytes[8], 4);
        assert_eq!(bytes[9], 8);
        assert_eq!(&bytes[10..12], &[0x02, 0x01]);
        assert_eq!(&bytes[12..16], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&bytes[16..20], &[5, 0, 0, 0]);
        assert_eq!(bytes[20], 0x88);
        assert_eq!(bytes[27], 0x11);

        assert_eq!(PersistentState::decode(&bytes), Ok(state));
    }

    #[test]
    fn test_foreign_magic_rejected() {
        let mut bytes = PersistentState::default().encode();
        bytes[4] ^= 0xFF;
        assert_eq!(PersistentState::decode(&bytes), Err(StoreError::Invalid));
    }

    #[test]
    fn test_unknown_state_rejected() {
        let mut bytes = PersistentState::default().encode();
        bytes[8] = 3;
        assert_eq!(PersistentState::decode(&bytes), Err(StoreError::Invalid));
        assert_eq!(PersistentState::decode(&bytes[..20]), Err(StoreError::Invalid));
    }
}
