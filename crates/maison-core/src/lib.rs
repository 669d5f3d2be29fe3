//! Hardware-independent core of the maison node framework
//!
//! This crate owns the lifecycle of a battery-powered, intermittently
//! connected sensor node: the event state machine that survives deep sleep,
//! the checksummed sleep-retaining memory it resumes from, the versioned
//! configuration store, the broker connectivity manager and the streamed
//! firmware update consumer.
//!
//! Everything touching hardware sits behind a trait ([`persistence::RtcMemory`],
//! [`config::FileStore`], [`net::WifiLink`], [`net::Broker`],
//! [`ota::FirmwareUpdater`], [`platform::Platform`], [`platform::PowerControl`])
//! so the crate compiles on both embedded targets and desktop hosts.
//!
//! It is `#![no_std]` with `extern crate alloc`.

#![no_std]

extern crate alloc;

pub mod config;
pub mod control;
pub mod crc;
pub mod lifecycle;
pub mod message;
pub mod net;
pub mod options;
pub mod ota;
pub mod persistence;
pub mod platform;

pub use lifecycle::{Application, Context, Maison, Next, State, UserResult};
pub use options::{Features, Options};
