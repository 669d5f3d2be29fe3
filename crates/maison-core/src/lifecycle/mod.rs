//! Event lifecycle of a node
//!
//! Every activation runs the same sequence:
//!
//! 1. bring the network up when this state needs it and drain the control
//!    topic (config updates, queries, restart requests, firmware transfers);
//! 2. call the application's decision function exactly once;
//! 3. advance the state machine, diverting through `HOURS_24` once a day;
//! 4. persist the state record and either power off (battery nodes) or
//!    return to the caller (mains nodes).
//!
//! On battery nodes the power-off is the end of the program: the next
//! activation starts from [`Maison::setup`] after the wake-up, and the
//! checksummed state record is all that carries over.

mod context;
mod state;

pub use context::*;
pub use state::*;

use alloc::string::ToString;
use alloc::vec::Vec;
use core::fmt;

use embassy_time::{Duration, Instant};
use log::{debug, error, info, warn};
use thiserror_no_std::Error;

use crate::config::{Config, ConfigError, ConfigManager, FileStore, UpdateOutcome};
use crate::control::Command;
use crate::message::{
    self, Envelope, MSG_CONFIG, MSG_STARTUP, MSG_STATE, MSG_WATCHDOG, StateSnapshot,
};
use crate::net::{
    Broker, ConnectivityManager, InboundMessage, NetError, RetryPolicy, Topics, UserTopic,
    WifiLink,
};
use crate::options::Options;
use crate::ota::{FirmwareUpdater, OtaConsumer, OtaError, OtaStatus};
use crate::persistence::{LoadOutcome, PersistentState, RtcMemory, StateStore, StoreError};
use crate::platform::{Platform, PowerControl, elapsed_between, mac_to_colon};

/// Shortest power-off; a zero request means "wake almost immediately".
pub const MIN_SLEEP: Duration = Duration::from_millis(100);

/// Longest power-off the sleep timer can express (`u32::MAX` µs, about 71.58 min).
pub const MAX_SLEEP: Duration = Duration::from_micros(u32::MAX as u64);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    #[error("sleep-retaining memory: {0}")]
    Store(StoreError),
    #[error("no usable config: {0}")]
    Config(ConfigError),
    #[error("network unavailable: {0}")]
    Network(NetError),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("unable to persist state: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// What the caller must do once an activation is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Mains node: run the next activation whenever convenient.
    Continue,
    /// Battery node: state persisted, power off for `duration`.
    PowerOff {
        duration: Duration,
        radio_on_wake: bool,
    },
    /// Restart the processor; `persist` tells whether state was saved first.
    Restart { persist: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    /// `RESTART!!`: save state, then restart.
    Restart,
    /// `REBOOT!` or a committed firmware image: restart as is.
    Reboot,
}

/// Everything the lifecycle drives.
pub struct Hardware<M, F, W, B, U, P> {
    pub memory: M,
    pub files: F,
    pub wifi: W,
    pub broker: B,
    pub updater: U,
    pub platform: P,
}

/// The node framework: owns the persistent state, the config, the
/// connectivity and the firmware update consumer.
pub struct Maison<M, F, W, B, U, P>
where
    M: RtcMemory,
    F: FileStore,
    W: WifiLink,
    B: Broker,
    U: FirmwareUpdater,
    P: Platform,
{
    options: Options,
    store: StateStore<M>,
    config: ConfigManager<F>,
    net: ConnectivityManager<W, B>,
    ota: OtaConsumer<U>,
    platform: P,
    mem: PersistentState,
    user: Vec<u8>,
    topics: Topics,
    user_topic: Option<UserTopic>,
    /// Power-off time of the current activation.
    sleep_duration: Duration,
    /// Power-off time the application asked for, if any.
    sleep_request: Option<Duration>,
    pending: Option<Request>,
    /// Mains nodes: last point folded into `one_hour_step_count`.
    last_count: Instant,
    /// Mains nodes: start of the previous decision call.
    loop_marker: Instant,
}

impl<M, F, W, B, U, P> Maison<M, F, W, B, U, P>
where
    M: RtcMemory,
    F: FileStore,
    W: WifiLink,
    B: Broker,
    U: FirmwareUpdater,
    P: Platform,
{
    /// `user_len` is the size of the application's persistent memory, 0 for none.
    pub fn new(options: Options, hardware: Hardware<M, F, W, B, U, P>, user_len: usize) -> Self {
        let policy = RetryPolicy::from(&options);
        let ota = OtaConsumer::new(hardware.updater, options.app_name, options.ota_timeout);
        let topics = Topics::new(options.topic_prefix, "", None);
        let sleep_duration = options.long_sleep;

        Self {
            store: StateStore::new(hardware.memory, user_len),
            config: ConfigManager::new(hardware.files),
            net: ConnectivityManager::new(hardware.wifi, hardware.broker, policy),
            ota,
            platform: hardware.platform,
            mem: PersistentState::default(),
            user: alloc::vec![0u8; user_len],
            topics,
            user_topic: None,
            sleep_duration,
            sleep_request: None,
            pending: None,
            last_count: Instant::from_ticks(0),
            loop_marker: Instant::from_ticks(0),
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn persistent(&self) -> &PersistentState {
        &self.mem
    }

    pub fn config(&self) -> &Config {
        self.config.config()
    }

    pub fn config_manager(&self) -> &ConfigManager<F> {
        &self.config
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn net(&self) -> &ConnectivityManager<W, B> {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut ConnectivityManager<W, B> {
        &mut self.net
    }

    pub fn ota(&self) -> &OtaConsumer<U> {
        &self.ota
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn store(&self) -> &StateStore<M> {
        &self.store
    }

    pub fn user_memory(&self) -> &[u8] {
        &self.user
    }

    /// Give the hardware back, e.g. to carry the sleep-retaining memory over a simulated power-off.
    pub fn into_hardware(self) -> Hardware<M, F, W, B, U, P> {
        let (wifi, broker) = self.net.into_parts();
        Hardware {
            memory: self.store.into_inner(),
            files: self.config.into_files(),
            wifi,
            broker,
            updater: self.ota.into_updater(),
            platform: self.platform,
        }
    }

    /// Whether this activation may use the network.
    pub fn network_allowed(&self) -> bool {
        !self.options.battery_powered() || self.mem.state.needs_network()
    }

    /// Restore persistent state and config, then bring the radio link up if this state needs it.
    ///
    /// A [`SetupError::Network`] leaves the node fully usable offline.
    pub fn setup<A: Application>(&mut self, app: &A) -> Result<(), SetupError> {
        let reason = self.platform.reset_reason();
        info!("Setup after {} reset", reason);

        if reason.is_hard_reset() {
            self.mem = self.store.reset().map_err(SetupError::Store)?;
            self.user = self.store.reset_user().map_err(SetupError::Store)?;
        } else {
            let (mem, outcome) = self.store.load().map_err(SetupError::Store)?;
            let (user, _) = self.store.load_user().map_err(SetupError::Store)?;
            if outcome == LoadOutcome::Restored {
                debug!("Resuming in {} (return to {})", mem.state, mem.return_state);
            }
            self.mem = mem;
            self.user = user;
        }

        let generation = self.config.load_newest().map_err(SetupError::Config)?;
        debug!("Config generation {} loaded: {}", generation, self.config.config());

        let mac = self.platform.mac_address();
        if self.config.config_mut().default_device_name(&mac) {
            info!("Device name defaulted to {}", self.config.config().device_name);
        }

        self.user_topic = app.user_topic();
        self.rebuild_topics();

        if self.network_allowed() {
            self.net
                .connect_link(self.config.config(), &mut self.platform)
                .map_err(SetupError::Network)?;
        }
        Ok(())
    }

    /// Run one activation. See the module documentation for the sequence.
    pub fn activate<A: Application>(&mut self, app: &mut A) -> Result<Next, LifecycleError> {
        self.sleep_request = None;
        if self.network_allowed() {
            self.service_network(app);
            if let Some(request) = self.pending.take() {
                return self.handle_request(request);
            }
        }

        let state = self.mem.state;
        self.sleep_duration = self.default_sleep(state);

        if !self.options.battery_powered() {
            let now = self.platform.now();
            self.mem.elapse_time = elapsed_between(self.loop_marker, now).as_micros();
            self.loop_marker = now;
        }

        if state == State::Startup {
            self.publish_state(MSG_STARTUP);
        }

        let result = {
            let mut ctx = self.context(state);
            app.process(&mut ctx, state)
        };
        debug!("Decision in {}: {:?}", state, result);

        if state == State::Hours24 {
            self.platform.delay_ms(100);
            if self.net.is_session_up() {
                self.poll_once(app);
            }
            if self.options.watchdog_enabled() {
                self.publish_state(MSG_WATCHDOG);
            }
        }

        let one_hour_ms = self.options.one_hour.as_millis() as u32;
        let mem = &mut self.mem;
        let next = transition(state, mem.return_state, result, || {
            check_24_hours(mem, one_hour_ms)
        });
        if next.state != state {
            info!("State {} -> {}", state, next.state);
        }
        self.mem.state = next.state;
        self.mem.return_state = next.return_state;

        if let Some(requested) = self.sleep_request.take() {
            self.sleep_duration = requested;
        }

        if let Some(request) = self.pending.take() {
            return self.handle_request(request);
        }

        if self.options.battery_powered() {
            self.power_off()
        } else {
            let now = self.platform.now();
            let elapsed = elapsed_between(self.last_count, now).as_millis() as u32;
            self.mem.one_hour_step_count = self.mem.one_hour_step_count.saturating_add(elapsed);
            self.last_count = now;
            self.persist()?;
            Ok(Next::Continue)
        }
    }

    /// Activate forever, handing power transitions to `power`.
    pub fn run<A, C>(&mut self, app: &mut A, power: &mut C) -> !
    where
        A: Application,
        C: PowerControl,
    {
        loop {
            match self.activate(app) {
                Ok(Next::Continue) => {}
                Ok(Next::PowerOff {
                    duration,
                    radio_on_wake,
                }) => power.deep_sleep(duration, radio_on_wake),
                Ok(Next::Restart { .. }) => power.restart(),
                Err(e) => {
                    error!("Activation failed: {}", e);
                    if self.options.battery_powered() {
                        power.deep_sleep(self.options.long_sleep, true);
                    }
                }
            }
        }
    }

    fn default_sleep(&self, state: State) -> Duration {
        if state.is_event_processing() {
            self.options.short_sleep
        } else {
            self.options.long_sleep
        }
    }

    /// Clamp the sleep, fold it into the counters, persist.
    fn power_off(&mut self) -> Result<Next, LifecycleError> {
        let requested = self.sleep_duration;
        let duration = if requested == Duration::from_ticks(0) {
            MIN_SLEEP
        } else if requested > MAX_SLEEP {
            warn!(
                "Sleep of {} s exceeds the timer range, clamped",
                requested.as_secs()
            );
            MAX_SLEEP
        } else {
            requested
        };

        // `now()` counts from the wake-up, so it is the time spent awake.
        let awake = elapsed_between(Instant::from_ticks(0), self.platform.now());
        let step = (awake + duration).as_millis() as u32;
        self.mem.one_hour_step_count = self.mem.one_hour_step_count.saturating_add(step);
        self.mem.elapse_time = (awake + duration).as_micros();

        self.persist()?;

        let radio_on_wake = self.mem.state.needs_network();
        debug!(
            "Powering off for {} ms, radio on wake: {}",
            duration.as_millis(),
            radio_on_wake
        );
        Ok(Next::PowerOff {
            duration,
            radio_on_wake,
        })
    }

    fn persist(&mut self) -> Result<(), LifecycleError> {
        self.store.save(&self.mem)?;
        self.store.save_user(&self.user)?;
        Ok(())
    }

    fn handle_request(&mut self, request: Request) -> Result<Next, LifecycleError> {
        self.log(format_args!("Info: Restart requested."));
        let persist = request == Request::Restart;
        if persist {
            self.persist()?;
        }
        self.net.shutdown();
        Ok(Next::Restart { persist })
    }

    /// Ensure the session and drain what the broker holds for us.
    fn service_network<A: Application>(&mut self, app: &mut A) {
        let clean_session = !self.options.battery_powered();
        let ensured = self.net.ensure(
            self.config.config(),
            &self.topics,
            clean_session,
            &mut self.platform,
        );

        match ensured {
            Ok(()) => {
                self.net.note_session_up();
                self.drain(app);
            }
            Err(e) => {
                warn!("Network unavailable: {}", e);
                self.net.note_session_lost(&mut self.mem.lost_count);
            }
        }
    }

    /// Poll until a pass brings nothing new.
    ///
    /// Battery nodes give each pass `drain_polls` polls so messages queued
    /// while powered off have time to arrive. While a firmware transfer is
    /// running passes continue until it ends or hits the OTA timeout.
    fn drain<A: Application>(&mut self, app: &mut A) {
        let started = self.platform.now();
        let polls = if self.options.battery_powered() {
            self.options.drain_polls.max(1)
        } else {
            1
        };
        let interval_us = self.options.drain_poll_interval.as_micros() as u32;

        debug!("Checking for incoming messages");
        loop {
            let mut received = false;
            for poll in 0..polls {
                match self.net.poll() {
                    Ok(Some(message)) => {
                        debug!("Message received after {} polls", poll);
                        self.dispatch(app, message);
                        received = true;
                        break;
                    }
                    Ok(None) => self.platform.delay_us(interval_us),
                    Err(e) => {
                        warn!("Message drain interrupted: {}", e);
                        self.platform.delay_us(interval_us);
                        break;
                    }
                }
            }

            let now = self.platform.now();
            if self.ota.check_timeout(now) {
                self.log(format_args!("Error: Wait for completion too long. Aborted."));
            }
            let waiting_ota = self.ota.is_receiving()
                && elapsed_between(started, now) < self.options.ota_timeout;

            if self.pending.is_some() || !(received || waiting_ota) {
                break;
            }
            if !received && !self.net.is_session_up() {
                break;
            }
        }

        if self.ota.is_receiving() {
            self.ota.abort(OtaError::Timeout);
            self.log(format_args!("Error: Wait for completion too long. Aborted."));
        }
    }

    fn poll_once<A: Application>(&mut self, app: &mut A) {
        match self.net.poll() {
            Ok(Some(message)) => self.dispatch(app, message),
            Ok(None) => {}
            Err(e) => debug!("Second-chance poll failed: {}", e),
        }
    }

    fn dispatch<A: Application>(&mut self, app: &mut A, message: InboundMessage) {
        if self.topics.is_ctrl(&message.topic) {
            self.handle_control(&message.payload);
        } else {
            let state = self.mem.state;
            let mut ctx = self.context(state);
            app.on_message(&mut ctx, &message.topic, &message.payload);
        }
    }

    fn handle_control(&mut self, payload: &[u8]) {
        let now = self.platform.now();
        let command = Command::parse(payload, self.ota.is_receiving());
        debug!("Control message: {}", command.name());

        match command {
            Command::Config(json) => self.receive_config(json),
            Command::ConfigQuery => self.send_config(),
            Command::StateQuery => self.publish_state(MSG_STATE),
            Command::Restart => self.pending = Some(Request::Restart),
            Command::Reboot => self.pending = Some(Request::Reboot),
            Command::NewCode(descriptor) => {
                if let Err(e) = self.ota.start(descriptor, now) {
                    self.log(format_args!("Error: firmware update refused: {}", e));
                }
            }
            Command::Firmware(bytes) => match self.ota.feed(bytes, now) {
                Ok(OtaStatus::Committed) => {
                    self.log(format_args!("Info: new firmware installed, rebooting."));
                    self.pending = Some(Request::Reboot);
                }
                Ok(_) => {
                    if let Some((received, expected)) = self.ota.progress() {
                        debug!("Firmware {}/{} bytes", received, expected);
                    }
                }
                Err(e) => self.log(format_args!("Error: firmware update failed: {}", e)),
            },
            Command::Unknown(payload) => {
                warn!("Unknown control message ({} bytes)", payload.len());
                self.log(format_args!("Warning: unknown command."));
            }
        }
    }

    /// `CONFIG:` handling: adopt a newer config, move the subscriptions, echo.
    fn receive_config(&mut self, json: &[u8]) {
        let candidate = match Config::from_json(json) {
            Ok(candidate) => candidate,
            Err(e) => {
                self.log(format_args!("Error: unable to retrieve config: {}", e));
                return;
            }
        };

        match self.config.apply_update(candidate) {
            Ok(UpdateOutcome::Accepted { previous }) => {
                let mac = self.platform.mac_address();
                self.config.config_mut().default_device_name(&mac);

                let old_topics = self.topics.clone();
                self.rebuild_topics();
                if let Err(e) = self.net.resubscribe(&old_topics, &self.topics) {
                    warn!("Unable to move subscriptions: {}", e);
                }
                info!(
                    "Config version {} replaced version {}",
                    self.config.config().version,
                    previous.version
                );
            }
            Ok(UpdateOutcome::Rejected { .. }) => {
                self.log(format_args!(
                    "Error: Received New Config with wrong version number."
                ));
            }
            Err(e) => {
                self.log(format_args!("Error: unable to save config: {}", e));
            }
        }
        self.send_config();
    }

    fn send_config(&mut self) {
        let document = self.config.config().to_document();
        let device = self.config.config().device_name.clone();
        let envelope = Envelope::new(&device, MSG_CONFIG, &document);
        self.publish_document(TopicKind::Config, &envelope);
    }

    fn publish_state(&mut self, msg_type: &str) {
        let mac = mac_to_colon(&self.platform.mac_address());
        let reason = self.platform.reset_reason().code();
        let heap = self.platform.free_heap().unwrap_or(0);
        let vbat = if self.options.show_voltage() {
            self.platform.battery_voltage()
        } else {
            None
        };
        let rssi = self.net.rssi().map(i32::from).unwrap_or(0);
        let ip = self
            .net
            .local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default();
        let device = self.config.config().device_name.clone();

        let snapshot = StateSnapshot {
            device: &device,
            msg_type,
            ip,
            mac: &mac,
            reason,
            state: self.mem.state as u8,
            return_state: self.mem.return_state as u8,
            hours: self.mem.hours_24_count,
            millis: self.mem.one_hour_step_count,
            lost: self.mem.lost_count,
            rssi,
            heap,
            app_name: self.options.app_name,
            app_version: self.options.app_version,
            vbat,
        };
        self.publish_document(TopicKind::State, &snapshot);
    }

    fn publish_document<T: serde::Serialize>(&mut self, kind: TopicKind, document: &T) {
        let payload = match message::to_json(document) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Unable to encode message: {}", e);
                return;
            }
        };
        let topic = match kind {
            TopicKind::State => &self.topics.state,
            TopicKind::Config => &self.topics.config,
        };
        if let Err(e) = self.net.publish(topic, &payload, false) {
            debug!("Message to {} dropped: {}", topic, e);
        }
    }

    /// Log locally and on the log topic when a session exists.
    fn log(&mut self, text: fmt::Arguments<'_>) {
        let line = message::log_line(&self.config.config().device_name, text);
        info!("{}", line);
        if self.net.is_session_up() {
            let _ = self.net.publish(&self.topics.log, line.as_bytes(), false);
        }
    }

    fn rebuild_topics(&mut self) {
        self.topics = Topics::new(
            self.options.topic_prefix,
            &self.config.config().device_name,
            self.user_topic,
        );
    }

    fn context(&mut self, state: State) -> Context<'_> {
        Context {
            device: &self.config.config().device_name,
            prefix: self.options.topic_prefix,
            topics: &self.topics,
            state,
            elapse_time: self.mem.elapse_time,
            default_sleep: self.sleep_duration,
            sleep: &mut self.sleep_request,
            user: &mut self.user,
            outbox: &mut self.net,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TopicKind {
    State,
    Config,
}
