#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;
use maison_core::config::{MemoryFiles, PRIMARY_FILE, StaticIp};
use maison_core::lifecycle::{Application, Context, Hardware, Maison, State, UserResult};
use maison_core::net::{Broker, BrokerError, InboundMessage, QoS, SessionOptions, WifiLink};
use maison_core::ota::{FirmwareUpdater, UpdaterError};
use maison_core::persistence::RamRegion;
use maison_core::platform::{Platform, ResetReason};
use maison_core::Options;

pub const DEVICE: &str = "DOOR";
pub const USER_LEN: usize = 16;
pub const MAC: [u8; 6] = [0x5C, 0xCF, 0x7F, 0x01, 0x02, 0x03];

pub type Node = Maison<RamRegion<64>, MemoryFiles, Radio, FakeBroker, Slot, SimClock>;
pub type Parts = Hardware<RamRegion<64>, MemoryFiles, Radio, FakeBroker, Slot, SimClock>;

/// Clock that only moves when the code under test delays.
pub struct SimClock {
    pub micros: u64,
    pub reason: ResetReason,
}

impl SimClock {
    /// Start a new power-on epoch.
    pub fn wake(&mut self, reason: ResetReason) {
        self.micros = 0;
        self.reason = reason;
    }

    pub fn advance(&mut self, duration: Duration) {
        self.micros += duration.as_micros();
    }
}

impl DelayNs for SimClock {
    fn delay_ns(&mut self, ns: u32) {
        self.micros += u64::from(ns) / 1000;
    }
}

impl Platform for SimClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.micros)
    }

    fn reset_reason(&self) -> ResetReason {
        self.reason
    }

    fn mac_address(&self) -> [u8; 6] {
        MAC
    }

    fn battery_voltage(&mut self) -> Option<f32> {
        Some(3.3)
    }
}

#[derive(Default)]
pub struct Radio {
    pub up: bool,
    pub never: bool,
    pub begins: u32,
    pub disconnects: u32,
}

impl WifiLink for Radio {
    fn is_connected(&mut self) -> bool {
        if self.begins > 0 && !self.never {
            self.up = true;
        }
        self.up
    }

    fn begin(&mut self, _ssid: &str, _password: &str, _static_ip: Option<StaticIp>) {
        self.begins += 1;
    }

    fn disconnect(&mut self) {
        self.up = false;
        self.begins = 0;
        self.disconnects += 1;
    }

    fn rssi(&mut self) -> Option<i8> {
        self.up.then_some(-58)
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.up.then_some(Ipv4Addr::new(192, 168, 1, 50))
    }
}

/// Broker double keeping a persistent session across power-off cycles.
#[derive(Default)]
pub struct FakeBroker {
    pub up: bool,
    pub refuse: bool,
    /// Polls on an empty inbox fail with a transport error.
    pub poll_errors: bool,
    pub has_session: bool,
    pub connects: u32,
    pub client_ids: Vec<String>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>)>,
    pub inbox: VecDeque<InboundMessage>,
}

impl FakeBroker {
    pub fn queue(&mut self, topic: &str, payload: &[u8]) {
        self.inbox.push_back(InboundMessage::new(topic, payload));
    }

    /// Payloads published on `topic`, as text.
    pub fn sent_on(&self, topic: &str) -> Vec<String> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }
}

impl Broker for FakeBroker {
    fn is_connected(&mut self) -> bool {
        self.up
    }

    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<bool, BrokerError> {
        self.connects += 1;
        self.client_ids.push(options.client_id.to_string());
        if self.refuse {
            return Err(BrokerError::Refused(5));
        }
        self.up = true;
        if options.clean_session {
            self.has_session = false;
            self.subscriptions.clear();
            return Ok(false);
        }
        let present = self.has_session;
        self.has_session = true;
        Ok(present)
    }

    fn disconnect(&mut self) {
        self.up = false;
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), BrokerError> {
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.subscriptions.retain(|t| t != topic);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], _retain: bool) -> Result<(), BrokerError> {
        if !self.up {
            return Err(BrokerError::NotConnected);
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        if !self.up {
            return Err(BrokerError::NotConnected);
        }
        if self.poll_errors && self.inbox.is_empty() {
            return Err(BrokerError::Transport);
        }
        Ok(self.inbox.pop_front())
    }
}

#[derive(Default)]
pub struct Slot {
    pub size: Option<u32>,
    pub staged: Vec<u8>,
    pub finalized: bool,
    pub aborts: u32,
}

impl FirmwareUpdater for Slot {
    fn begin(&mut self, size: u32) -> Result<(), UpdaterError> {
        self.size = Some(size);
        self.staged.clear();
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdaterError> {
        self.staged.extend_from_slice(chunk);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), UpdaterError> {
        self.finalized = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.staged.clear();
        self.aborts += 1;
    }
}

/// Application replaying a fixed list of results, then `fallback`.
pub struct Scripted {
    pub results: VecDeque<UserResult>,
    pub fallback: UserResult,
    pub sleep: Option<Duration>,
    pub seen: Vec<State>,
}

impl Scripted {
    pub fn new(results: &[UserResult], fallback: UserResult) -> Self {
        Self {
            results: results.iter().copied().collect(),
            fallback,
            sleep: None,
            seen: Vec::new(),
        }
    }

    pub fn idle() -> Self {
        Self::new(&[], UserResult::Completed)
    }
}

impl Application for Scripted {
    fn process(&mut self, ctx: &mut Context<'_>, state: State) -> UserResult {
        self.seen.push(state);
        if let Some(sleep) = self.sleep {
            ctx.set_sleep_duration(sleep);
        }
        self.results.pop_front().unwrap_or(self.fallback)
    }
}

pub fn config_json(version: u16, device: &str) -> Vec<u8> {
    serde_json::json!({
        "version": version,
        "device_name": device,
        "ssid": "home",
        "wifi_password": "secret",
        "mqtt_server_name": "broker.local",
        "mqtt_user_name": "node",
        "mqtt_password": "pass",
        "mqtt_port": 8883
    })
    .to_string()
    .into_bytes()
}

pub fn hardware() -> Parts {
    Hardware {
        memory: RamRegion::new(),
        files: MemoryFiles::new().with_file(PRIMARY_FILE, &config_json(3, DEVICE)),
        wifi: Radio::default(),
        broker: FakeBroker::default(),
        updater: Slot::default(),
        platform: SimClock {
            micros: 0,
            reason: ResetReason::PowerOn,
        },
    }
}

pub fn battery_options() -> Options {
    Options::new("door", "1.0").with_features(maison_core::Features::BATTERY_POWER)
}

pub fn mains_options() -> Options {
    Options::new("door", "1.0")
}

/// Create the node and run setup, as firmware does right after reset.
pub fn boot(options: Options, parts: Parts, app: &Scripted) -> Node {
    let mut node = Maison::new(options, parts, USER_LEN);
    node.setup(app).expect("setup");
    node
}

/// Hand the hardware over to the next power-on epoch.
pub fn power_cycle(node: Node, reason: ResetReason) -> Parts {
    let mut parts = node.into_hardware();
    parts.platform.wake(reason);
    parts.wifi.up = false;
    parts.wifi.begins = 0;
    parts.broker.up = false;
    parts
}

pub fn ctrl_topic() -> String {
    format!("maison/{DEVICE}/ctrl")
}
