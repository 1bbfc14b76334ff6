// MIT License - Copyright (c) 2026 Peter Wright
// Panel variants, connection settings and credential parsing

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use crate::constants;
use crate::error::{ArrowheadError, Result};

/// Protocol variant spoken by the panel.
///
/// Both variants share the line grammar; they differ in device limits,
/// RF supervision support and connect-time negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PanelType {
    /// Elite-SX: 32 zones, 16 outputs, RF supervision codes, no firmware negotiation
    Esx,
    /// ECi: up to 248 zones, 32 outputs, firmware-gated enhanced mode (MODE 4)
    Eci,
}

impl PanelType {
    /// Device limits for this variant as (max_zones, max_areas, max_outputs).
    pub fn limits(&self) -> (u16, u8, u16) {
        match self {
            Self::Esx => (32, 32, 16),
            Self::Eci => (constants::MAX_ZONE, constants::MAX_AREA, 32),
        }
    }

    pub fn max_zones(&self) -> u16 {
        self.limits().0
    }

    pub fn max_areas(&self) -> u8 {
        self.limits().1
    }

    pub fn max_outputs(&self) -> u16 {
        self.limits().2
    }

    /// Whether the panel emits RF receiver/sensor supervision codes.
    pub fn supports_rf(&self) -> bool {
        matches!(self, Self::Esx)
    }

    /// Whether the panel needs VERSION / MODE 4 / provisioning checks at connect.
    pub fn negotiates_mode(&self) -> bool {
        matches!(self, Self::Eci)
    }

    /// How long to wait for a `login:` prompt before probing directly.
    pub fn login_prompt_timeout(&self) -> Duration {
        match self {
            Self::Esx => Duration::from_secs(5),
            Self::Eci => Duration::from_secs(3),
        }
    }

    /// Default (interval, threshold) for the keep-alive loop.
    pub fn keep_alive(&self) -> (Duration, Duration) {
        match self {
            Self::Esx => (Duration::from_secs(30), Duration::from_secs(45)),
            Self::Eci => (Duration::from_secs(45), Duration::from_secs(60)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Esx => "ESX",
            Self::Eci => "ECi",
        }
    }

    /// Parse a user-supplied panel type name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "esx" | "elite-sx" | "elite_sx" => Some(Self::Esx),
            "eci" => Some(Self::Eci),
            _ => None,
        }
    }
}

impl fmt::Display for PanelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol mode the session ended up in after negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProtocolMode {
    /// Mode 1: default, no acknowledgements beyond OK.
    #[default]
    Mode1,
    Mode2,
    Mode3,
    /// Mode 4: enhanced, with user tracking, keypad alarms and timers.
    Mode4,
}

impl ProtocolMode {
    pub fn number(&self) -> u8 {
        match self {
            Self::Mode1 => 1,
            Self::Mode2 => 2,
            Self::Mode3 => 3,
            Self::Mode4 => 4,
        }
    }

    pub fn is_enhanced(&self) -> bool {
        matches!(self, Self::Mode4)
    }
}

/// Panel firmware version as reported by `VERSION`.
///
/// Ordered numerically by (major, minor, patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FirmwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

/// Lowest firmware that supports MODE 4.
pub const MIN_ENHANCED_FIRMWARE: FirmwareVersion = FirmwareVersion {
    major: 10,
    minor: 3,
    patch: 50,
};

impl FirmwareVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// Extract the first `major.minor.patch` triple from free-form text,
    /// e.g. `OK Version "ECi F/W Ver. 10.3.50"`.
    ///
    /// A missing patch component is read as 0 (`10.4` == `10.4.0`).
    pub fn parse(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            if !bytes[start].is_ascii_digit() {
                start += 1;
                continue;
            }
            let end = bytes[start..]
                .iter()
                .position(|b| !(b.is_ascii_digit() || *b == b'.'))
                .map_or(bytes.len(), |p| start + p);
            let parts: Vec<&str> = text[start..end]
                .split('.')
                .filter(|p| !p.is_empty())
                .collect();
            if parts.len() >= 2 {
                let major = parts[0].parse().ok();
                let minor = parts[1].parse().ok();
                let patch = parts.get(2).map_or(Some(0), |p| p.parse().ok());
                if let (Some(major), Some(minor), Some(patch)) = (major, minor, patch) {
                    return Some(Self { major, minor, patch });
                }
            }
            start = end;
        }
        None
    }

    /// Whether this firmware can run the enhanced protocol mode.
    pub fn supports_enhanced_mode(&self) -> bool {
        self.cmp(&MIN_ENHANCED_FIRMWARE) != Ordering::Less
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// A numeric user id + PIN pair, as configured in a single `"<user> <pin>"` string.
#[derive(Clone, PartialEq, Eq)]
pub struct UserCredential {
    pub user: u16,
    pin: String,
}

impl UserCredential {
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (Some(user), Some(pin), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ArrowheadError::InvalidCredential {
                reason: "expected \"<user> <pin>\"".to_string(),
            });
        };
        let user: u16 = user.parse().map_err(|_| ArrowheadError::InvalidCredential {
            reason: format!("user id '{user}' is not a number"),
        })?;
        if pin.is_empty() || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ArrowheadError::InvalidCredential {
                reason: "PIN must be numeric".to_string(),
            });
        }
        Ok(Self {
            user,
            pin: pin.to_string(),
        })
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }
}

// PIN stays out of logs.
impl fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredential")
            .field("user", &self.user)
            .field("pin", &"****")
            .finish()
    }
}

/// Configuration for connecting to an Arrowhead panel.
#[derive(Clone)]
pub struct PanelConfig {
    /// Panel variant (determines limits and negotiation)
    pub panel_type: PanelType,
    /// Panel (or serial-to-IP module) host name or address
    pub host: String,
    /// Panel TCP port (default: 9000)
    pub port: u16,
    /// `"<user> <pin>"` used for DISARM
    pub user_pin: String,
    /// Username sent if the panel shows a `login:` prompt
    pub username: String,
    /// Password sent after the username
    pub password: String,
    /// Number of outputs wired up; outputs are not discovered
    pub output_count: u16,
    /// Zones to pre-populate before detection or status data arrives
    pub initial_zone_count: u16,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// How long a command waits for its acknowledgement
    pub command_timeout: Duration,
    /// Read-loop idle time after which a STATUS probe is sent
    pub read_idle_timeout: Duration,
    /// Keep-alive interval override (panel default otherwise)
    pub keep_alive_interval: Option<Duration>,
    /// Keep-alive silence threshold override (panel default otherwise)
    pub keep_alive_threshold: Option<Duration>,
    /// Login prompt wait override (panel default otherwise)
    pub login_prompt_timeout: Option<Duration>,
    /// First reconnect delay; doubles on each failed attempt
    pub reconnect_base_delay: Duration,
    /// Ceiling for the reconnect delay
    pub reconnect_max_delay: Duration,
    /// Failed attempts after which the supervisor gives up (0 = never retry)
    pub max_reconnect_attempts: u32,
    /// Pause after an arm/disarm ack so the status push can catch up
    pub settle_delay: Duration,
    /// Abort the connection instead of degrading when firmware lacks MODE 4
    pub require_enhanced_mode: bool,
}

// Credentials stay out of logs.
impl fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanelConfig")
            .field("panel_type", &self.panel_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user_pin", &"****")
            .field("username", &self.username)
            .field("password", &"****")
            .field("output_count", &self.output_count)
            .field("initial_zone_count", &self.initial_zone_count)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("read_idle_timeout", &self.read_idle_timeout)
            .field("reconnect_base_delay", &self.reconnect_base_delay)
            .field("reconnect_max_delay", &self.reconnect_max_delay)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("settle_delay", &self.settle_delay)
            .field("require_enhanced_mode", &self.require_enhanced_mode)
            .finish_non_exhaustive()
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            panel_type: PanelType::Esx,
            host: "192.168.1.100".to_string(),
            port: constants::DEFAULT_PORT,
            user_pin: constants::DEFAULT_USER_PIN.to_string(),
            username: constants::DEFAULT_USERNAME.to_string(),
            password: constants::DEFAULT_PASSWORD.to_string(),
            output_count: 4,
            initial_zone_count: 16,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            read_idle_timeout: Duration::from_secs(60),
            keep_alive_interval: None,
            keep_alive_threshold: None,
            login_prompt_timeout: None,
            reconnect_base_delay: Duration::from_secs(30),
            reconnect_max_delay: Duration::from_secs(300),
            max_reconnect_attempts: 5,
            settle_delay: Duration::from_secs(2),
            require_enhanced_mode: false,
        }
    }
}

impl PanelConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> PanelConfigBuilder {
        PanelConfigBuilder::default()
    }

    /// The configured DISARM credential.
    pub fn credential(&self) -> Result<UserCredential> {
        UserCredential::parse(&self.user_pin)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
            .unwrap_or_else(|| self.panel_type.keep_alive().0)
            .max(constants::MIN_TIMER_PERIOD)
    }

    pub fn keep_alive_threshold(&self) -> Duration {
        self.keep_alive_threshold
            .unwrap_or_else(|| self.panel_type.keep_alive().1)
    }

    pub fn login_prompt_timeout(&self) -> Duration {
        self.login_prompt_timeout
            .unwrap_or_else(|| self.panel_type.login_prompt_timeout())
    }

    /// Output count clamped to the panel maximum.
    pub fn effective_output_count(&self) -> u16 {
        self.output_count.min(self.panel_type.max_outputs())
    }

    /// Initial zone count clamped to the panel maximum.
    pub fn effective_zone_count(&self) -> u16 {
        self.initial_zone_count.min(self.panel_type.max_zones())
    }

    /// Delay before reconnect attempt `attempt` (1-based): base doubled per
    /// previous failure, capped at the ceiling.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay
            .saturating_mul(1u32 << shift)
            .min(self.reconnect_max_delay)
    }

    /// `host:port` for socket connection and logs.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for PanelConfig.
#[derive(Debug, Clone, Default)]
pub struct PanelConfigBuilder {
    config: PanelConfig,
}

impl PanelConfigBuilder {
    pub fn panel_type(mut self, panel_type: PanelType) -> Self {
        self.config.panel_type = panel_type;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn user_pin(mut self, user_pin: impl Into<String>) -> Self {
        self.config.user_pin = user_pin.into();
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn output_count(mut self, count: u16) -> Self {
        self.config.output_count = count;
        self
    }

    pub fn initial_zone_count(mut self, count: u16) -> Self {
        self.config.initial_zone_count = count;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Clamped to [`constants::MIN_TIMER_PERIOD`].
    pub fn read_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_idle_timeout = timeout.max(constants::MIN_TIMER_PERIOD);
        self
    }

    /// The interval is clamped to [`constants::MIN_TIMER_PERIOD`].
    pub fn keep_alive(mut self, interval: Duration, threshold: Duration) -> Self {
        self.config.keep_alive_interval = Some(interval.max(constants::MIN_TIMER_PERIOD));
        self.config.keep_alive_threshold = Some(threshold);
        self
    }

    pub fn login_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.config.login_prompt_timeout = Some(timeout);
        self
    }

    pub fn reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.reconnect_base_delay = base;
        self.config.reconnect_max_delay = max;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    pub fn require_enhanced_mode(mut self, require: bool) -> Self {
        self.config.require_enhanced_mode = require;
        self
    }

    pub fn build(self) -> PanelConfig {
        self.config
    }
}
