use alloc::vec::Vec;
use core::fmt;

use embassy_time::Duration;
use log::info;
use serde::{Serialize, de::DeserializeOwned};
use thiserror_no_std::Error;

use super::{State, UserResult};
use crate::message::{self, Envelope, MSG_EVENT};
use crate::net::{NetError, Outbox, TopicTooLong, Topics, UserTopic};
use crate::persistence::{StoreError, decode_user, encode_user};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    #[error("publish failed: {0}")]
    Net(NetError),
    #[error("message could not be encoded")]
    Encoding,
    #[error("{0}")]
    Topic(TopicTooLong),
}

impl From<NetError> for PublishError {
    fn from(e: NetError) -> Self {
        Self::Net(e)
    }
}

impl From<TopicTooLong> for PublishError {
    fn from(e: TopicTooLong) -> Self {
        Self::Topic(e)
    }
}

/// Node application: the per-activation decision function plus optional
/// handling of messages on its own topic.
pub trait Application {
    /// Inspect the hardware for `state` and report the outcome. Called exactly once per activation.
    fn process(&mut self, ctx: &mut Context<'_>, state: State) -> UserResult;

    /// A message arrived on the application topic.
    fn on_message(&mut self, _ctx: &mut Context<'_>, _topic: &str, _payload: &[u8]) {}

    /// Extra topic to subscribe, relative to the device root.
    fn user_topic(&self) -> Option<UserTopic> {
        None
    }
}

/// What the application may touch while it runs.
pub struct Context<'a> {
    pub(super) device: &'a str,
    pub(super) prefix: &'static str,
    pub(super) topics: &'a Topics,
    pub(super) state: State,
    pub(super) elapse_time: u64,
    pub(super) default_sleep: Duration,
    pub(super) sleep: &'a mut Option<Duration>,
    pub(super) user: &'a mut Vec<u8>,
    pub(super) outbox: &'a mut dyn Outbox,
}

impl Context<'_> {
    pub fn device_name(&self) -> &str {
        self.device
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn topics(&self) -> &Topics {
        self.topics
    }

    /// Microseconds the previous activation took, sleep included on battery nodes.
    pub fn elapse_time(&self) -> u64 {
        self.elapse_time
    }

    pub fn last_activation(&self) -> Duration {
        Duration::from_micros(self.elapse_time)
    }

    /// Power-off time after this activation: the requested one, else the
    /// default for the current state.
    pub fn sleep_duration(&self) -> Duration {
        self.sleep.unwrap_or(self.default_sleep)
    }

    /// Override the power-off time chosen for this activation.
    pub fn set_sleep_duration(&mut self, duration: Duration) {
        *self.sleep = Some(duration);
    }

    /// Publish on `<prefix><device>/<suffix>`.
    pub fn publish(&mut self, suffix: &str, payload: &[u8], retain: bool) -> Result<(), PublishError> {
        let topic = Topics::custom(self.prefix, self.device, suffix)?;
        self.outbox.publish(&topic, payload, retain)?;
        Ok(())
    }

    /// Publish `{"device":..,"msg_type":"EVENT_DATA","content":..}` on the event topic.
    pub fn publish_event<T: Serialize>(&mut self, content: &T) -> Result<(), PublishError> {
        let payload = message::to_json(&Envelope::new(self.device, MSG_EVENT, content))
            .map_err(|_| PublishError::Encoding)?;
        self.outbox.publish(&self.topics.event, &payload, false)?;
        Ok(())
    }

    /// Send a diagnostic line to the log topic (and the local log).
    pub fn log(&mut self, text: fmt::Arguments<'_>) {
        let line = message::log_line(self.device, text);
        info!("{}", line);
        // Best effort: nothing to do without a session.
        let _ = self.outbox.publish(&self.topics.log, line.as_bytes(), false);
    }

    /// Raw application memory, kept across power-off cycles.
    pub fn user_memory(&mut self) -> &mut [u8] {
        self.user.as_mut_slice()
    }

    /// Decode the application memory; a fresh region gives `T::default()`.
    pub fn load_user<T: DeserializeOwned + Default>(&self) -> Result<T, StoreError> {
        decode_user(&self.user[..])
    }

    pub fn store_user<T: Serialize>(&mut self, value: &T) -> Result<(), StoreError> {
        *self.user = encode_user(value, self.user.len())?;
        Ok(())
    }
}
