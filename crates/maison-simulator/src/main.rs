//! Desktop simulator for a maison door-sensor node.
//!
//! Each process run is one activation, exactly like a battery node waking
//! from deep sleep: the sleep-retaining memory is an image file that is
//! loaded at start and rewritten on every store.
//!
//! # Working directory layout
//!
//! | Path                 | Role                                          |
//! |----------------------|-----------------------------------------------|
//! | `rtc.bin`            | sleep-retaining memory image                  |
//! | `fs/`                | flat file store (`config.json`, backups)      |
//! | `door`               | sensor input: `open` or `closed`              |
//! | `inbox/`             | one file per control message, consumed in order |
//! | `firmware.bin`       | last staged firmware image                    |
//! | `restart`            | marker left by a software restart             |
//!
//! The directory defaults to `./maison-sim` and can be set with
//! `MAISON_SIM_DIR`. Published messages are printed through the log.

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Instant as StdInstant;

use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use maison_core::config::{FileError, FileStore, PRIMARY_FILE, StaticIp};
use maison_core::lifecycle::{
    Application, Context, Hardware, Maison, SetupError, State, UserResult,
};
use maison_core::net::{Broker, BrokerError, InboundMessage, QoS, SessionOptions, WifiLink};
use maison_core::ota::{FirmwareUpdater, UpdaterError};
use maison_core::persistence::{RamRegion, RtcMemory, StoreError};
use maison_core::platform::{Platform, PowerControl, ResetReason};
use maison_core::{Features, Options};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of the simulated sleep-retaining memory.
const RTC_SIZE: usize = 128;

/// Bytes of application memory (door statistics).
const USER_LEN: usize = 16;

const DEFAULT_DIR: &str = "maison-sim";

const DEFAULT_CONFIG: &str = r#"{
  "version": 1,
  "device_name": "",
  "ssid": "simulated",
  "wifi_password": "simulated",
  "mqtt_server_name": "localhost",
  "mqtt_user_name": "maison",
  "mqtt_password": "maison",
  "mqtt_port": 1883
}
"#;

/// Tunables shortened so a full day of watchdog fits a short session.
fn options() -> Options {
    Options::new("door-sim", env!("CARGO_PKG_VERSION"))
        .with_features(Features::BATTERY_POWER | Features::WATCHDOG_24H | Features::VOLTAGE_CHECK)
        .with_drain(50, Duration::from_millis(2))
        .with_sleep_times(Duration::from_secs(5), Duration::from_secs(60))
        .with_one_hour(Duration::from_secs(60))
}

// ---------------------------------------------------------------------------
// Simulated hardware
// ---------------------------------------------------------------------------

/// Flat file store rooted in a host directory.
struct DirFiles {
    root: PathBuf,
}

impl DirFiles {
    fn new(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name.trim_start_matches('/'))
    }
}

fn file_error(e: io::Error) -> FileError {
    match e.kind() {
        io::ErrorKind::NotFound => FileError::NotFound,
        _ => FileError::Io,
    }
}

impl FileStore for DirFiles {
    fn exists(&mut self, name: &str) -> bool {
        self.path(name).is_file()
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>, FileError> {
        fs::read(self.path(name)).map_err(file_error)
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), FileError> {
        fs::write(self.path(name), data).map_err(file_error)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), FileError> {
        fs::rename(self.path(from), self.path(to)).map_err(file_error)
    }

    fn remove(&mut self, name: &str) -> Result<(), FileError> {
        fs::remove_file(self.path(name)).map_err(file_error)
    }
}

/// Access point that always accepts the station.
#[derive(Default)]
struct SimRadio {
    associating: bool,
    up: bool,
}

impl WifiLink for SimRadio {
    fn is_connected(&mut self) -> bool {
        // Association completes on the poll after `begin`.
        if self.associating {
            self.up = true;
        }
        self.up
    }

    fn begin(&mut self, ssid: &str, _password: &str, static_ip: Option<StaticIp>) {
        info!("[radio] associating with {} (static ip: {:?})", ssid, static_ip);
        self.associating = true;
    }

    fn disconnect(&mut self) {
        self.associating = false;
        self.up = false;
    }

    fn rssi(&mut self) -> Option<i8> {
        self.up.then_some(-61)
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.up.then_some(Ipv4Addr::new(192, 168, 4, 20))
    }
}

/// Broker that prints what the node publishes and serves the inbox directory.
struct SimBroker {
    inbox: PathBuf,
    ctrl_topic: Option<String>,
    up: bool,
}

impl SimBroker {
    fn new(inbox: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&inbox)?;
        Ok(Self {
            inbox,
            ctrl_topic: None,
            up: false,
        })
    }

    /// Oldest message file, by name.
    fn next_message(&self) -> io::Result<Option<PathBuf>> {
        let mut entries = fs::read_dir(&self.inbox)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        entries.sort();
        Ok(entries.into_iter().next())
    }
}

impl Broker for SimBroker {
    fn is_connected(&mut self) -> bool {
        self.up
    }

    fn connect(&mut self, options: &SessionOptions<'_>) -> Result<bool, BrokerError> {
        info!(
            "[broker] session for {} at {}:{} (clean: {})",
            options.client_id, options.server, options.port, options.clean_session
        );
        self.up = true;
        // Subscriptions are not remembered between runs.
        Ok(false)
    }

    fn disconnect(&mut self) {
        self.up = false;
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        debug!("[broker] subscribe {} (qos {})", topic, qos as u8);
        if topic.ends_with("/ctrl") {
            self.ctrl_topic = Some(topic.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        debug!("[broker] unsubscribe {}", topic);
        if self.ctrl_topic.as_deref() == Some(topic) {
            self.ctrl_topic = None;
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError> {
        if !self.up {
            return Err(BrokerError::NotConnected);
        }
        info!(
            "[broker] {}{} <- {}",
            topic,
            if retain { " (retained)" } else { "" },
            String::from_utf8_lossy(payload)
        );
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        if !self.up {
            return Err(BrokerError::NotConnected);
        }
        let Some(topic) = self.ctrl_topic.clone() else {
            return Ok(None);
        };
        let Some(path) = self.next_message().map_err(|_| BrokerError::Transport)? else {
            return Ok(None);
        };

        let payload = fs::read(&path).map_err(|_| BrokerError::Transport)?;
        fs::remove_file(&path).map_err(|_| BrokerError::Transport)?;
        info!("[broker] {} -> {}", path.display(), topic);
        Ok(Some(InboundMessage::new(&topic, trim_newline(&payload))))
    }
}

/// Messages written with an editor usually end with a newline.
fn trim_newline(payload: &[u8]) -> &[u8] {
    payload.strip_suffix(b"\n").unwrap_or(payload)
}

/// Stages firmware images into a host file.
struct FileUpdater {
    path: PathBuf,
    staged: Vec<u8>,
}

impl FirmwareUpdater for FileUpdater {
    fn begin(&mut self, size: u32) -> Result<(), UpdaterError> {
        info!("[ota] staging {} bytes", size);
        self.staged = Vec::with_capacity(size as usize);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdaterError> {
        self.staged.extend_from_slice(chunk);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), UpdaterError> {
        fs::write(&self.path, &self.staged).map_err(|_| UpdaterError::Flash)?;
        info!("[ota] image written to {}", self.path.display());
        Ok(())
    }

    fn abort(&mut self) {
        self.staged.clear();
    }
}

/// Wall clock of this run plus fixed chip facts.
struct HostPlatform {
    started: StdInstant,
    reason: ResetReason,
}

impl DelayNs for HostPlatform {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(std::time::Duration::from_nanos(u64::from(ns)));
    }
}

impl Platform for HostPlatform {
    fn now(&self) -> Instant {
        Instant::from_micros(self.started.elapsed().as_micros() as u64)
    }

    fn reset_reason(&self) -> ResetReason {
        self.reason
    }

    fn mac_address(&self) -> [u8; 6] {
        [0x02, 0x4D, 0x41, 0x49, 0x53, 0x4E]
    }

    fn battery_voltage(&mut self) -> Option<f32> {
        Some(3.02)
    }
}

/// Sleep-retaining memory mirrored to an image file on every write.
struct ImageMemory {
    path: PathBuf,
    ram: RamRegion<RTC_SIZE>,
}

impl ImageMemory {
    /// Load the image; a missing or mis-sized file is a cold memory.
    fn open(path: PathBuf) -> (Self, bool) {
        let image = fs::read(&path)
            .ok()
            .and_then(|bytes| <[u8; RTC_SIZE]>::try_from(bytes).ok());
        let retained = image.is_some();
        let ram = image.map(RamRegion::from_bytes).unwrap_or_default();
        (Self { path, ram }, retained)
    }
}

impl RtcMemory for ImageMemory {
    fn capacity(&self) -> usize {
        self.ram.capacity()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        self.ram.read(offset, buf)
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        self.ram.write(offset, data)?;
        fs::write(&self.path, self.ram.as_bytes()).map_err(|e| {
            error!("Unable to save {}: {}", self.path.display(), e);
            StoreError::Backend
        })
    }
}

/// Ends the run: the memory image is already on disk, so powering off is exiting.
struct ExitPower {
    dir: PathBuf,
}

impl PowerControl for ExitPower {
    fn deep_sleep(&mut self, duration: Duration, radio_on_wake: bool) -> ! {
        info!(
            "Deep sleep for {} s (radio on wake: {}). Run again to wake the node.",
            duration.as_secs(),
            radio_on_wake
        );
        std::process::exit(0)
    }

    fn restart(&mut self) -> ! {
        if let Err(e) = fs::write(self.dir.join("restart"), b"") {
            warn!("Unable to leave the restart marker: {}", e);
        }
        info!("Restarting. Run again to boot the node.");
        std::process::exit(0)
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Default, Debug)]
struct DoorStats {
    openings: u32,
    /// Activations spent waiting for the door to close.
    held_open: u16,
}

#[derive(Serialize)]
struct DoorEvent {
    door: &'static str,
    openings: u32,
}

/// Reports door openings and closings read from the `door` file.
struct DoorSensor {
    input: PathBuf,
}

impl DoorSensor {
    fn is_open(&self) -> bool {
        fs::read_to_string(&self.input).is_ok_and(|s| s.trim() == "open")
    }

    fn report(&self, ctx: &mut Context<'_>, door: &'static str, openings: u32) {
        if let Err(e) = ctx.publish_event(&DoorEvent { door, openings }) {
            warn!("Door event not sent: {}", e);
        }
    }
}

impl Application for DoorSensor {
    fn process(&mut self, ctx: &mut Context<'_>, state: State) -> UserResult {
        let mut stats: DoorStats = ctx.load_user().unwrap_or_default();
        let open = self.is_open();

        let result = match state {
            State::Startup => {
                ctx.log(format_args!("Info: door sensor up, {} openings so far", stats.openings));
                UserResult::Completed
            }
            State::WaitForEvent if open => UserResult::NewEvent,
            State::WaitForEvent => UserResult::Completed,
            State::ProcessEvent => {
                if !open {
                    // Closed again before we could report it.
                    UserResult::Aborted
                } else {
                    stats.openings += 1;
                    stats.held_open = 0;
                    self.report(ctx, "open", stats.openings);
                    UserResult::Completed
                }
            }
            State::WaitEndEvent if open => {
                stats.held_open = stats.held_open.saturating_add(1);
                UserResult::NotCompleted
            }
            State::WaitEndEvent => UserResult::Completed,
            State::EndEvent => {
                self.report(ctx, "closed", stats.openings);
                UserResult::Completed
            }
            State::Hours24 => {
                ctx.log(format_args!("Info: {} openings, held open {}", stats.openings, stats.held_open));
                UserResult::Completed
            }
        };

        if let Err(e) = ctx.store_user(&stats) {
            warn!("Door statistics not saved: {}", e);
        }
        result
    }

    fn on_message(&mut self, _ctx: &mut Context<'_>, topic: &str, payload: &[u8]) {
        info!("Application message on {}: {}", topic, String::from_utf8_lossy(payload));
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

type SimNode = Maison<ImageMemory, DirFiles, SimRadio, SimBroker, FileUpdater, HostPlatform>;

fn build(dir: &Path) -> io::Result<(SimNode, DoorSensor)> {
    let (memory, retained) = ImageMemory::open(dir.join("rtc.bin"));
    let restarted = fs::remove_file(dir.join("restart")).is_ok();
    let reason = match (retained, restarted) {
        (true, true) => ResetReason::Software,
        (true, false) => ResetReason::DeepSleepWake,
        (false, _) => ResetReason::PowerOn,
    };

    let mut files = DirFiles::new(dir.join("fs"))?;
    if !files.exists(PRIMARY_FILE) {
        info!("No config found, writing the default one");
        fs::write(files.path(PRIMARY_FILE), DEFAULT_CONFIG)?;
    }

    let hardware = Hardware {
        memory,
        files,
        wifi: SimRadio::default(),
        broker: SimBroker::new(dir.join("inbox"))?,
        updater: FileUpdater {
            path: dir.join("firmware.bin"),
            staged: Vec::new(),
        },
        platform: HostPlatform {
            started: StdInstant::now(),
            reason,
        },
    };

    let app = DoorSensor {
        input: dir.join("door"),
    };
    Ok((Maison::new(options(), hardware, USER_LEN), app))
}

/// Offline activations still run the application; anything else stops the node.
fn setup_is_fatal(e: &SetupError) -> bool {
    !matches!(e, SetupError::Network(_))
}

fn main() {
    env_logger::init();

    let dir = std::env::var_os("MAISON_SIM_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DIR));
    info!("Starting maison simulator in {}", dir.display());

    let (mut node, mut app) = match fs::create_dir_all(&dir).and_then(|_| build(&dir)) {
        Ok(parts) => parts,
        Err(e) => {
            error!("Unable to prepare {}: {}", dir.display(), e);
            std::process::exit(1);
        }
    };

    if let Err(e) = node.setup(&app) {
        if setup_is_fatal(&e) {
            error!("Setup failed: {}", e);
            std::process::exit(1);
        }
        warn!("Setup incomplete: {}", e);
    }
    info!(
        "Node {} in {} (lost sessions: {})",
        node.config().device_name,
        node.persistent().state,
        node.persistent().lost_count
    );

    let mut power = ExitPower { dir };
    node.run(&mut app, &mut power)
}
