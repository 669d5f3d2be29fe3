//! Streamed firmware update consumer
//!
//! A transfer starts with a `NEW_CODE:` descriptor naming the image size,
//! the firmware identity it targets and its MD5 digest. The image then
//! arrives as raw control-topic payloads which are streamed to the
//! [`FirmwareUpdater`] while the digest is computed on the fly. Once the
//! declared size has been consumed the image is committed if the digest
//! matches, and discarded otherwise.
//!
//! ```text
//! Idle --descriptor--> Receiving --size bytes, md5 ok--> Committed
//!                          |
//!                          +--md5 mismatch / timeout / flash error--> Aborted
//! ```

use alloc::string::{String, ToString};

use embassy_time::{Duration, Instant};
use log::{info, warn};
use md5::{Digest, Md5};
use serde::Deserialize;
use thiserror_no_std::Error;

use crate::config::truncated;
use crate::platform::elapsed_between;

pub const MD5_LEN: usize = 16;

/// Failures of the flash writer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterError {
    #[error("image does not fit the update partition")]
    NoSpace,
    #[error("flash write failed")]
    Flash,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    #[error("malformed firmware descriptor: {0}")]
    Descriptor(heapless::String<64>),
    #[error("descriptor field {0} is missing or invalid")]
    Missing(&'static str),
    #[error("firmware targets {0}, not this node")]
    WrongTarget(heapless::String<32>),
    #[error("no firmware transfer in progress")]
    NotReceiving,
    #[error("firmware digest mismatch")]
    Checksum,
    #[error("firmware transfer timed out")]
    Timeout,
    #[error("firmware update failed: {0}")]
    Updater(UpdaterError),
}

impl From<UpdaterError> for OtaError {
    fn from(e: UpdaterError) -> Self {
        Self::Updater(e)
    }
}

/// Staging area for a new firmware image (the inactive flash slot).
pub trait FirmwareUpdater {
    /// Prepare to receive `size` bytes.
    fn begin(&mut self, size: u32) -> Result<(), UpdaterError>;

    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdaterError>;

    /// Mark the staged image bootable.
    fn finalize(&mut self) -> Result<(), UpdaterError>;

    /// Discard whatever was staged.
    fn abort(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    Idle,
    Receiving,
    /// Image staged and verified; the node must reboot into it.
    Committed,
    Aborted,
}

#[derive(Deserialize)]
struct RawDescriptor {
    #[serde(rename = "SIZE")]
    size: Option<u32>,
    #[serde(rename = "APP_NAME")]
    app_name: Option<String>,
    #[serde(rename = "MD5")]
    md5: Option<String>,
}

/// Validated `NEW_CODE:` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    pub size: u32,
    pub app_name: heapless::String<32>,
    pub md5: [u8; MD5_LEN],
}

impl FirmwareDescriptor {
    /// Parse `{"SIZE":n,"APP_NAME":s,"MD5":s}`.
    pub fn parse(json: &[u8]) -> Result<Self, OtaError> {
        let raw: RawDescriptor = serde_json::from_slice(json)
            .map_err(|e| OtaError::Descriptor(truncated(&e.to_string())))?;

        let size = raw.size.filter(|&s| s > 0).ok_or(OtaError::Missing("SIZE"))?;
        let app_name = raw
            .app_name
            .filter(|n| !n.is_empty())
            .ok_or(OtaError::Missing("APP_NAME"))?;
        let md5_hex = raw.md5.ok_or(OtaError::Missing("MD5"))?;

        let mut md5 = [0u8; MD5_LEN];
        hex::decode_to_slice(md5_hex.trim(), &mut md5).map_err(|_| OtaError::Missing("MD5"))?;

        Ok(Self {
            size,
            app_name: truncated(&app_name),
            md5,
        })
    }
}

struct Transfer {
    expected: u32,
    received: u32,
    md5: [u8; MD5_LEN],
    hasher: Md5,
    started: Instant,
}

/// Consumes one firmware transfer at a time.
pub struct OtaConsumer<U: FirmwareUpdater> {
    updater: U,
    app_name: &'static str,
    timeout: Duration,
    status: OtaStatus,
    transfer: Option<Transfer>,
    last_error: Option<OtaError>,
}

impl<U: FirmwareUpdater> OtaConsumer<U> {
    /// `app_name` is this node's firmware identity; descriptors for anything else are ignored.
    pub fn new(updater: U, app_name: &'static str, timeout: Duration) -> Self {
        Self {
            updater,
            app_name,
            timeout,
            status: OtaStatus::Idle,
            transfer: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> OtaStatus {
        self.status
    }

    pub fn is_receiving(&self) -> bool {
        self.status == OtaStatus::Receiving
    }

    pub fn last_error(&self) -> Option<&OtaError> {
        self.last_error.as_ref()
    }

    pub fn updater(&self) -> &U {
        &self.updater
    }

    pub fn updater_mut(&mut self) -> &mut U {
        &mut self.updater
    }

    pub fn into_updater(self) -> U {
        self.updater
    }

    /// `(received, expected)` bytes of the running transfer.
    pub fn progress(&self) -> Option<(u32, u32)> {
        self.transfer.as_ref().map(|t| (t.received, t.expected))
    }

    /// Handle a `NEW_CODE:` descriptor.
    ///
    /// A descriptor that does not parse or targets another firmware leaves
    /// the status untouched. A valid one replaces any transfer in progress.
    pub fn start(&mut self, descriptor: &[u8], now: Instant) -> Result<(), OtaError> {
        let descriptor = match FirmwareDescriptor::parse(descriptor) {
            Ok(d) => d,
            Err(e) => {
                warn!("Firmware descriptor rejected: {}", e);
                self.last_error = Some(e.clone());
                return Err(e);
            }
        };

        if descriptor.app_name.as_str() != self.app_name {
            let e = OtaError::WrongTarget(descriptor.app_name);
            warn!("Firmware descriptor rejected: {}", e);
            self.last_error = Some(e.clone());
            return Err(e);
        }

        if self.is_receiving() {
            warn!("New descriptor received, dropping the transfer in progress");
            self.updater.abort();
            self.transfer = None;
        }

        if let Err(e) = self.updater.begin(descriptor.size) {
            self.abort(e.into());
            return Err(e.into());
        }

        info!(
            "Receiving {} bytes of firmware for {}",
            descriptor.size, descriptor.app_name
        );
        self.transfer = Some(Transfer {
            expected: descriptor.size,
            received: 0,
            md5: descriptor.md5,
            hasher: Md5::new(),
            started: now,
        });
        self.status = OtaStatus::Receiving;
        self.last_error = None;
        Ok(())
    }

    /// Stream one payload of image bytes.
    ///
    /// Bytes past the declared size are ignored. Returns the status after
    /// the payload was consumed.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Result<OtaStatus, OtaError> {
        if self.check_timeout(now) {
            return Err(OtaError::Timeout);
        }
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(OtaError::NotReceiving);
        };

        let remaining = (transfer.expected - transfer.received) as usize;
        let chunk = &bytes[..bytes.len().min(remaining)];
        transfer.hasher.update(chunk);
        transfer.received += chunk.len() as u32;

        if let Err(e) = self.updater.write(chunk) {
            self.abort(e.into());
            return Err(e.into());
        }

        match self.transfer.take() {
            Some(transfer) if transfer.received == transfer.expected => self.complete(transfer),
            other => {
                self.transfer = other;
                Ok(self.status)
            }
        }
    }

    /// Abort a transfer that outlived the timeout. Returns true if it did.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        let expired = self
            .transfer
            .as_ref()
            .is_some_and(|t| elapsed_between(t.started, now) >= self.timeout);
        if expired {
            self.abort(OtaError::Timeout);
        }
        expired
    }

    /// Drop the running transfer and discard the staged image.
    pub fn abort(&mut self, reason: OtaError) {
        if self.transfer.take().is_some() {
            self.updater.abort();
        }
        warn!("Firmware update aborted: {}", reason);
        self.status = OtaStatus::Aborted;
        self.last_error = Some(reason);
    }

    fn complete(&mut self, transfer: Transfer) -> Result<OtaStatus, OtaError> {
        // The transfer is already detached, so `abort` alone would not reach the updater.
        let digest = transfer.hasher.finalize();
        if digest.as_slice() != &transfer.md5[..] {
            self.updater.abort();
            self.abort(OtaError::Checksum);
            return Err(OtaError::Checksum);
        }

        if let Err(e) = self.updater.finalize() {
            self.updater.abort();
            self.abort(e.into());
            return Err(e.into());
        }

        info!("Firmware image of {} bytes verified", transfer.expected);
        self.status = OtaStatus::Committed;
        Ok(self.status)
    }
}
