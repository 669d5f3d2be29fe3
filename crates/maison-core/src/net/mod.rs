//! Radio link and broker session management
//!
//! The node talks to a single publish/subscribe broker over a lossy radio
//! link. [`ConnectivityManager`] brings both up on demand, with bounded
//! association polling and a fixed spacing between broker attempts, and
//! resets the link after too many consecutive session failures.

mod manager;
mod topics;

pub use manager::*;
pub use topics::*;

use alloc::string::String;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use thiserror_no_std::Error;

use crate::config::{FINGERPRINT_LEN, StaticIp};

/// Errors reported by a [`Broker`] implementation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker refused the session (code {0})")]
    Refused(u8),
    #[error("broker transport failure")]
    Transport,
    #[error("no broker session")]
    NotConnected,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    #[error("radio link did not come up after {attempts} polls")]
    LinkTimeout { attempts: u32 },
    #[error("broker session attempt too soon after the previous one")]
    Backoff,
    #[error("broker session failed: {0}")]
    Session(BrokerError),
    #[error("broker operation failed: {0}")]
    Broker(BrokerError),
    #[error("not connected")]
    NotConnected,
}

/// Subscription quality of service.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Message delivered by the broker on one of our subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: &str, payload: &[u8]) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.to_vec(),
        }
    }
}

/// Parameters of one broker session attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions<'a> {
    pub server: &'a str,
    pub port: u16,
    /// `client-<device_name>`, stable across activations.
    pub client_id: heapless::String<32>,
    pub username: &'a str,
    pub password: &'a str,
    /// Certificate pin; `None` accepts any certificate.
    pub fingerprint: Option<&'a [u8; FINGERPRINT_LEN]>,
    /// False for battery nodes, so the broker keeps subscriptions and
    /// queues messages while the node is powered off.
    pub clean_session: bool,
}

/// Station side of the radio.
pub trait WifiLink {
    fn is_connected(&mut self) -> bool;

    /// Start associating; completion is observed through [`is_connected`](Self::is_connected).
    fn begin(&mut self, ssid: &str, password: &str, static_ip: Option<StaticIp>);

    fn disconnect(&mut self);

    /// Received signal strength in dBm.
    fn rssi(&mut self) -> Option<i8>;

    fn local_ip(&self) -> Option<Ipv4Addr>;
}

/// Publish/subscribe client.
pub trait Broker {
    fn is_connected(&mut self) -> bool;

    /// Open a session. Returns whether the broker still held a session for this client.
    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<bool, BrokerError>;

    fn disconnect(&mut self);

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError>;

    /// Service the session and return the next inbound message, if any.
    fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError>;
}

/// Publishing handle lent to application code.
pub trait Outbox {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), NetError>;
}
