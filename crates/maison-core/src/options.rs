//! Framework tunables
//!
//! The attempt ceilings and intervals below are representative defaults
//! taken from field use; every one of them can be overridden per node.

use embassy_time::Duration;

/// Optional framework behaviors selected by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features(u8);

impl Features {
    /// No optional behavior.
    pub const NONE: Self = Self(0x00);
    /// Report the supply voltage in state snapshots.
    pub const VOLTAGE_CHECK: Self = Self(0x01);
    /// Running from batteries: deep sleep between activations.
    pub const BATTERY_POWER: Self = Self(0x02);
    /// Publish a `WATCHDOG` snapshot every 24 hours.
    pub const WATCHDOG_24H: Self = Self(0x04);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for Features {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Timing and retry parameters of the lifecycle.
#[derive(Debug, Clone)]
pub struct Options {
    pub features: Features,
    /// Firmware identity matched against OTA descriptors.
    pub app_name: &'static str,
    pub app_version: &'static str,
    /// Prepended to every topic (`maison/`).
    pub topic_prefix: &'static str,
    /// Link association polls before giving up.
    pub wifi_attempts: u32,
    pub wifi_poll_interval: Duration,
    /// Consecutive failed broker sessions before the link is reset.
    pub max_session_failures: u32,
    /// Minimum spacing between two broker session attempts.
    pub session_min_spacing: Duration,
    /// Inbound polls per drain pass in battery mode.
    pub drain_polls: u32,
    pub drain_poll_interval: Duration,
    /// Wall-clock ceiling for a firmware transfer.
    pub ota_timeout: Duration,
    /// Sleep while an event is being processed.
    pub short_sleep: Duration,
    /// Sleep while waiting for an event.
    pub long_sleep: Duration,
    /// Length of one step of the 24 hour watchdog.
    pub one_hour: Duration,
}

impl Options {
    pub const fn new(app_name: &'static str, app_version: &'static str) -> Self {
        Self {
            features: Features::NONE,
            app_name,
            app_version,
            topic_prefix: "maison/",
            wifi_attempts: 50,
            wifi_poll_interval: Duration::from_millis(200),
            max_session_failures: 5,
            session_min_spacing: Duration::from_secs(5),
            drain_polls: 2000,
            drain_poll_interval: Duration::from_millis(1),
            ota_timeout: Duration::from_secs(120),
            short_sleep: Duration::from_secs(5),
            long_sleep: Duration::from_secs(3600),
            one_hour: Duration::from_secs(3600),
        }
    }

    pub const fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub const fn with_topic_prefix(mut self, prefix: &'static str) -> Self {
        self.topic_prefix = prefix;
        self
    }

    pub const fn with_wifi_attempts(mut self, attempts: u32, interval: Duration) -> Self {
        self.wifi_attempts = attempts;
        self.wifi_poll_interval = interval;
        self
    }

    pub const fn with_session_retries(mut self, max_failures: u32, min_spacing: Duration) -> Self {
        self.max_session_failures = max_failures;
        self.session_min_spacing = min_spacing;
        self
    }

    pub const fn with_drain(mut self, polls: u32, interval: Duration) -> Self {
        self.drain_polls = polls;
        self.drain_poll_interval = interval;
        self
    }

    pub const fn with_ota_timeout(mut self, timeout: Duration) -> Self {
        self.ota_timeout = timeout;
        self
    }

    pub const fn with_sleep_times(mut self, short: Duration, long: Duration) -> Self {
        self.short_sleep = short;
        self.long_sleep = long;
        self
    }

    /// Shorten the watchdog hour, handy on the bench (5 s makes 24 "hours" two minutes).
    pub const fn with_one_hour(mut self, one_hour: Duration) -> Self {
        self.one_hour = one_hour;
        self
    }

    pub const fn battery_powered(&self) -> bool {
        self.features.contains(Features::BATTERY_POWER)
    }

    pub const fn watchdog_enabled(&self) -> bool {
        self.features.contains(Features::WATCHDOG_24H)
    }

    pub const fn show_voltage(&self) -> bool {
        self.features.contains(Features::VOLTAGE_CHECK)
    }
}
