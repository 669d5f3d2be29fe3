//! Outbound message documents
//!
//! Every message the node publishes is a serde type rendered with
//! `serde_json`, except log lines which are plain `<device>: <text>`.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};

use serde::Serialize;

use crate::config::truncated;

pub const MSG_STARTUP: &str = "STARTUP";
pub const MSG_WATCHDOG: &str = "WATCHDOG";
pub const MSG_STATE: &str = "STATE";
pub const MSG_CONFIG: &str = "CONFIG";
pub const MSG_EVENT: &str = "EVENT_DATA";

/// Published on the `state` topic at startup, every 24 hours and on `STATE?`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StateSnapshot<'a> {
    pub device: &'a str,
    pub msg_type: &'a str,
    pub ip: String,
    pub mac: &'a str,
    /// Reset reason code.
    pub reason: u8,
    pub state: u8,
    pub return_state: u8,
    pub hours: u16,
    pub millis: u32,
    pub lost: u32,
    /// Zero when the link is down.
    pub rssi: i32,
    pub heap: usize,
    pub app_name: &'a str,
    pub app_version: &'a str,
    #[serde(rename = "VBAT", skip_serializing_if = "Option::is_none")]
    pub vbat: Option<f32>,
}

/// `{"device":..,"msg_type":..,"content":..}` wrapper for config echoes and events.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Envelope<'a, T: Serialize> {
    pub device: &'a str,
    pub msg_type: &'a str,
    pub content: &'a T,
}

impl<'a, T: Serialize> Envelope<'a, T> {
    pub fn new(device: &'a str, msg_type: &'a str, content: &'a T) -> Self {
        Self {
            device,
            msg_type,
            content,
        }
    }
}

/// Render any message document.
pub fn to_json<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Log line for the `log` topic, cut to 128 bytes.
pub fn log_line(device: &str, text: fmt::Arguments<'_>) -> heapless::String<128> {
    let mut rendered = String::new();
    let _ = write!(rendered, "{device}: {text}");
    truncated(&rendered)
}
