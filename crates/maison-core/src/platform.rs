//! Board services the lifecycle needs from the target
//!
//! [`Platform`] bundles the monotonic clock, the blocking delay used while
//! polling the radio and the few chip facts reported in state snapshots.
//! [`PowerControl`] holds the two calls that never return.

use core::fmt;

use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;

/// Why the processor started this power-on epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    /// Power was applied (or the reset pin was pulled).
    PowerOn,
    /// Hardware watchdog fired.
    Watchdog,
    /// Unhandled exception or panic.
    Exception,
    /// Software requested restart.
    Software,
    /// Timer wake-up from deep sleep.
    DeepSleepWake,
    /// Anything the target cannot classify.
    Other(u8),
}

impl ResetReason {
    /// Numeric code published in state snapshots.
    pub const fn code(self) -> u8 {
        match self {
            Self::PowerOn => 0,
            Self::Watchdog => 1,
            Self::Exception => 2,
            Self::Software => 4,
            Self::DeepSleepWake => 5,
            Self::Other(code) => code,
        }
    }

    /// True when the sleep-retaining memory cannot be trusted.
    ///
    /// A software restart keeps it, so `RESTART!!` can resume where it left off.
    pub const fn is_hard_reset(self) -> bool {
        !matches!(self, Self::DeepSleepWake | Self::Software)
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOn => f.write_str("power-on"),
            Self::Watchdog => f.write_str("watchdog"),
            Self::Exception => f.write_str("exception"),
            Self::Software => f.write_str("software"),
            Self::DeepSleepWake => f.write_str("deep-sleep wake"),
            Self::Other(code) => write!(f, "other ({code})"),
        }
    }
}

/// Clock, delay and chip information for one node.
pub trait Platform: DelayNs {
    /// Monotonic time since this power-on epoch started.
    fn now(&self) -> Instant;

    /// Reason for the current power-on epoch.
    fn reset_reason(&self) -> ResetReason;

    /// Station MAC address of the radio.
    fn mac_address(&self) -> [u8; 6];

    /// Supply voltage in volts, if the board can measure it.
    fn battery_voltage(&mut self) -> Option<f32> {
        None
    }

    /// Free heap in bytes, if known.
    fn free_heap(&self) -> Option<usize> {
        None
    }
}

/// Power transitions that end the current epoch.
///
/// Both calls are terminal: on hardware the processor powers down or resets
/// and execution resumes from the entry point. The lifecycle persists its
/// state before calling either of them.
pub trait PowerControl {
    /// Power off for `duration`, optionally waking with the radio calibrated.
    fn deep_sleep(&mut self, duration: Duration, radio_on_wake: bool) -> !;

    /// Reset the processor.
    fn restart(&mut self) -> !;
}

/// Time elapsed between two readings of [`Platform::now`], saturating at zero.
pub fn elapsed_between(earlier: Instant, later: Instant) -> Duration {
    later
        .checked_duration_since(earlier)
        .unwrap_or(Duration::from_ticks(0))
}

/// Render a MAC address as 12 upper-case hex digits (`A0B1C2D3E4F5`).
pub fn mac_to_compact(mac: &[u8; 6]) -> heapless::String<12> {
    let mut out = heapless::String::new();
    for byte in mac {
        let _ = out.push(hex_digit(byte >> 4));
        let _ = out.push(hex_digit(byte & 0x0F));
    }
    out
}

/// Render a MAC address as colon separated pairs (`A0:B1:C2:D3:E4:F5`).
pub fn mac_to_colon(mac: &[u8; 6]) -> heapless::String<17> {
    let mut out = heapless::String::new();
    for (idx, byte) in mac.iter().enumerate() {
        if idx != 0 {
            let _ = out.push(':');
        }
        let _ = out.push(hex_digit(byte >> 4));
        let _ = out.push(hex_digit(byte & 0x0F));
    }
    out
}

const fn hex_digit(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        _ => (b'A' + nibble - 10) as char,
    }
}
