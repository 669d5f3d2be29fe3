use core::net::Ipv4Addr;

use embassy_time::{Duration, Instant};
use log::{debug, info, warn};

use super::{
    Broker, BrokerError, InboundMessage, NetError, Outbox, QoS, SessionOptions, Topics, WifiLink,
};
use crate::config::Config;
use crate::options::Options;
use crate::platform::{Platform, elapsed_between};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    LinkUp,
    SessionUp,
}

/// Transient connection bookkeeping, reset every power-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: LinkStatus,
    /// Consecutive failed session attempts.
    pub retries: u32,
    /// No session attempt made yet in this power-on; the first one is not spaced.
    pub first_trial: bool,
    /// The current loss episode was already added to `lost_count`.
    pub loss_counted: bool,
    pub last_attempt: Instant,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            retries: 0,
            first_trial: true,
            loss_counted: false,
            last_attempt: Instant::from_ticks(0),
        }
    }
}

/// Attempt ceilings and spacing, taken from [`Options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub wifi_attempts: u32,
    pub wifi_poll_interval: Duration,
    pub max_session_failures: u32,
    pub session_min_spacing: Duration,
}

impl From<&Options> for RetryPolicy {
    fn from(options: &Options) -> Self {
        Self {
            wifi_attempts: options.wifi_attempts,
            wifi_poll_interval: options.wifi_poll_interval,
            max_session_failures: options.max_session_failures,
            session_min_spacing: options.session_min_spacing,
        }
    }
}

/// Owns the radio link and the broker client.
pub struct ConnectivityManager<W, B>
where
    W: WifiLink,
    B: Broker,
{
    wifi: W,
    broker: B,
    policy: RetryPolicy,
    state: ConnectionState,
    /// Forced link resets since power-on.
    link_resets: u32,
}

impl<W, B> ConnectivityManager<W, B>
where
    W: WifiLink,
    B: Broker,
{
    pub fn new(wifi: W, broker: B, policy: RetryPolicy) -> Self {
        Self {
            wifi,
            broker,
            policy,
            state: ConnectionState::default(),
            link_resets: 0,
        }
    }

    pub fn wifi(&self) -> &W {
        &self.wifi
    }

    pub fn wifi_mut(&mut self) -> &mut W {
        &mut self.wifi
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn into_parts(self) -> (W, B) {
        (self.wifi, self.broker)
    }

    pub fn link_resets(&self) -> u32 {
        self.link_resets
    }

    pub fn is_session_up(&mut self) -> bool {
        self.state.status == LinkStatus::SessionUp && self.broker.is_connected()
    }

    pub fn rssi(&mut self) -> Option<i8> {
        self.wifi.rssi()
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        self.wifi.local_ip()
    }

    /// Bring the radio link up, polling at most `wifi_attempts` times.
    pub fn connect_link<P: Platform>(
        &mut self,
        config: &Config,
        platform: &mut P,
    ) -> Result<(), NetError> {
        if self.wifi.is_connected() {
            if self.state.status == LinkStatus::Disconnected {
                self.state.status = LinkStatus::LinkUp;
            }
            return Ok(());
        }

        info!("Connecting to access point {}", config.wifi_ssid);
        self.wifi
            .begin(&config.wifi_ssid, &config.wifi_password, config.static_ip());

        let interval_ms = self.policy.wifi_poll_interval.as_millis() as u32;
        for attempt in 1..=self.policy.wifi_attempts {
            if self.wifi.is_connected() {
                info!(
                    "Radio link up after {} polls, address {:?}",
                    attempt,
                    self.wifi.local_ip()
                );
                self.state.status = LinkStatus::LinkUp;
                return Ok(());
            }
            platform.delay_ms(interval_ms);
        }

        warn!(
            "Radio link still down after {} polls",
            self.policy.wifi_attempts
        );
        self.state.status = LinkStatus::Disconnected;
        Err(NetError::LinkTimeout {
            attempts: self.policy.wifi_attempts,
        })
    }

    /// Make sure a broker session exists. Idempotent.
    ///
    /// Session attempts are spaced by at least `session_min_spacing`; a call
    /// inside that window returns [`NetError::Backoff`] without touching the
    /// broker. After `max_session_failures` consecutive failures the link is
    /// torn down so the next call starts from association again.
    pub fn ensure<P: Platform>(
        &mut self,
        config: &Config,
        topics: &Topics,
        clean_session: bool,
        platform: &mut P,
    ) -> Result<(), NetError> {
        if !self.wifi.is_connected() {
            if self.state.status == LinkStatus::SessionUp {
                self.broker.disconnect();
            }
            self.state.status = LinkStatus::Disconnected;
            self.connect_link(config, platform)?;
        }

        if self.broker.is_connected() {
            self.state.status = LinkStatus::SessionUp;
            return Ok(());
        }
        if self.state.status == LinkStatus::SessionUp {
            warn!("Broker session dropped");
        }
        self.state.status = LinkStatus::LinkUp;

        let now = platform.now();
        if !self.state.first_trial
            && elapsed_between(self.state.last_attempt, now) < self.policy.session_min_spacing
        {
            return Err(NetError::Backoff);
        }
        self.state.first_trial = false;
        self.state.last_attempt = now;

        let options = session_options(config, clean_session);
        debug!(
            "Connecting to {}:{} as {} (clean session: {})",
            options.server, options.port, options.client_id, options.clean_session
        );

        match self.broker.connect(&options) {
            Ok(session_present) => {
                self.state.retries = 0;
                self.state.status = LinkStatus::SessionUp;
                info!("Broker session up (resumed: {})", session_present);

                if clean_session || !session_present {
                    if let Err(e) = self.subscribe(topics) {
                        self.broker.disconnect();
                        self.state.status = LinkStatus::LinkUp;
                        return Err(e);
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.state.retries += 1;
                warn!(
                    "Broker session attempt {} failed: {}",
                    self.state.retries, e
                );
                if self.state.retries >= self.policy.max_session_failures {
                    warn!("Too many session failures, resetting the radio link");
                    self.reset_link();
                    self.state.retries = 0;
                }
                Err(NetError::Session(e))
            }
        }
    }

    /// Drop the broker session and the radio link.
    pub fn reset_link(&mut self) {
        self.broker.disconnect();
        self.wifi.disconnect();
        self.state.status = LinkStatus::Disconnected;
        self.link_resets += 1;
    }

    /// Close the session before a restart.
    pub fn shutdown(&mut self) {
        if self.state.status == LinkStatus::SessionUp {
            self.broker.disconnect();
        }
        self.wifi.disconnect();
        self.state.status = LinkStatus::Disconnected;
    }

    /// Subscribe the control topic and, if any, the application topic.
    pub fn subscribe(&mut self, topics: &Topics) -> Result<(), NetError> {
        self.broker
            .subscribe(&topics.ctrl, QoS::AtLeastOnce)
            .map_err(NetError::Broker)?;
        if let Some((topic, qos)) = &topics.user {
            self.broker.subscribe(topic, *qos).map_err(NetError::Broker)?;
        }
        debug!("Subscribed to {}", topics.ctrl);
        Ok(())
    }

    pub fn unsubscribe(&mut self, topics: &Topics) -> Result<(), NetError> {
        self.broker
            .unsubscribe(&topics.ctrl)
            .map_err(NetError::Broker)?;
        if let Some((topic, _)) = &topics.user {
            self.broker.unsubscribe(topic).map_err(NetError::Broker)?;
        }
        Ok(())
    }

    /// Move the subscriptions from `old` to `new` after a device rename.
    pub fn resubscribe(&mut self, old: &Topics, new: &Topics) -> Result<(), NetError> {
        if !self.is_session_up() {
            return Err(NetError::NotConnected);
        }
        if let Err(e) = self.unsubscribe(old) {
            warn!("Unable to drop old subscriptions: {}", e);
        }
        self.subscribe(new)
    }

    /// Add one loss episode to `lost_count`. Returns false if this episode was already counted.
    pub fn note_session_lost(&mut self, lost_count: &mut u32) -> bool {
        if self.state.loss_counted {
            return false;
        }
        *lost_count = lost_count.saturating_add(1);
        self.state.loss_counted = true;
        warn!("Connection lost count: {}", lost_count);
        true
    }

    /// End the current loss episode.
    pub fn note_session_up(&mut self) {
        self.state.loss_counted = false;
    }

    pub fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), NetError> {
        if !self.is_session_up() {
            return Err(NetError::NotConnected);
        }
        self.broker
            .publish(topic, payload, retain)
            .map_err(NetError::Broker)
    }

    pub fn poll(&mut self) -> Result<Option<InboundMessage>, NetError> {
        if !self.is_session_up() {
            return Err(NetError::NotConnected);
        }
        match self.broker.poll() {
            Ok(message) => Ok(message),
            Err(BrokerError::NotConnected) => {
                self.state.status = LinkStatus::LinkUp;
                Err(NetError::NotConnected)
            }
            Err(e) => Err(NetError::Broker(e)),
        }
    }
}

impl<W, B> Outbox for ConnectivityManager<W, B>
where
    W: WifiLink,
    B: Broker,
{
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), NetError> {
        ConnectivityManager::publish(self, topic, payload, retain)
    }
}

/// Session parameters derived from the live config.
pub fn session_options(config: &Config, clean_session: bool) -> SessionOptions<'_> {
    let mut client_id = heapless::String::new();
    let _ = client_id.push_str("client-");
    let _ = client_id.push_str(&config.device_name);

    SessionOptions {
        server: &config.mqtt_server,
        port: config.mqtt_port,
        client_id,
        username: &config.mqtt_username,
        password: &config.mqtt_password,
        fingerprint: config.mqtt_fingerprint.as_ref(),
        clean_session,
    }
}
