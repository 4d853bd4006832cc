use btleplug::api::CentralState;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::error::{ReabilitaError, Result};

/// Power state of the local Bluetooth adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterPowerState {
    /// State not reported yet
    #[default]
    Unknown,
    /// The stack is restarting
    Resetting,
    /// The platform has no BLE support
    Unsupported,
    /// The app is not allowed to use Bluetooth
    Unauthorized,
    /// Radio switched off
    PoweredOff,
    /// Radio ready for scanning and connections
    PoweredOn,
}

impl AdapterPowerState {
    /// Whether scans, connections and commands are allowed
    #[must_use]
    pub const fn is_powered_on(self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl From<CentralState> for AdapterPowerState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => Self::PoweredOn,
            CentralState::PoweredOff => Self::PoweredOff,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for AdapterPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralHandle {
    /// Stable platform identifier
    pub id: String,
    /// Advertised local name
    pub name: Option<String>,
}

impl PeripheralHandle {
    /// Create a new peripheral handle
    #[must_use]
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
        }
    }

    /// Name to show in alerts and lists
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// An established link to a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
    /// Peripheral on the other end of the link
    pub peripheral: PeripheralHandle,
}

impl Connection {
    /// Create a connection record for a peripheral
    #[must_use]
    pub const fn new(peripheral: PeripheralHandle) -> Self {
        Self { peripheral }
    }

    /// Identity of the connection, shared with its peripheral
    #[must_use]
    pub fn id(&self) -> &str {
        &self.peripheral.id
    }
}

/// One of the three user-adjustable control parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    /// Actuation speed, 1 to 5
    Speed,
    /// Actuation intensity, 1 to 5
    Intensity,
    /// Number of repetitions per cycle, 1 to 20
    Repetitions,
}

impl Parameter {
    /// Inclusive lower bound
    #[must_use]
    pub const fn min(self) -> u8 {
        1
    }

    /// Inclusive upper bound
    #[must_use]
    pub const fn max(self) -> u8 {
        match self {
            Self::Speed | Self::Intensity => 5,
            Self::Repetitions => 20,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Speed => write!(f, "speed"),
            Self::Intensity => write!(f, "intensity"),
            Self::Repetitions => write!(f, "repetitions"),
        }
    }
}

/// Parameters sent with a start command
///
/// Every value stays within its [`Parameter`] bounds. Steps past a bound are
/// ignored rather than wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ControlParameters {
    speed: u8,
    intensity: u8,
    repetitions: u8,
}

impl Default for ControlParameters {
    fn default() -> Self {
        Self {
            speed: Parameter::Speed.min(),
            intensity: Parameter::Intensity.min(),
            repetitions: Parameter::Repetitions.min(),
        }
    }
}

impl ControlParameters {
    /// Create parameters, rejecting out-of-range values
    ///
    /// # Errors
    ///
    /// Returns [`ReabilitaError::InvalidParameters`] if any value is outside its bounds.
    pub fn new(speed: u8, intensity: u8, repetitions: u8) -> Result<Self> {
        for (parameter, value) in [
            (Parameter::Speed, speed),
            (Parameter::Intensity, intensity),
            (Parameter::Repetitions, repetitions),
        ] {
            if !(parameter.min()..=parameter.max()).contains(&value) {
                return Err(ReabilitaError::InvalidParameters(format!(
                    "{parameter} {value} is outside {}-{}",
                    parameter.min(),
                    parameter.max()
                )));
            }
        }

        Ok(Self {
            speed,
            intensity,
            repetitions,
        })
    }

    /// Current speed
    #[must_use]
    pub const fn speed(&self) -> u8 {
        self.speed
    }

    /// Current intensity
    #[must_use]
    pub const fn intensity(&self) -> u8 {
        self.intensity
    }

    /// Current repetitions
    #[must_use]
    pub const fn repetitions(&self) -> u8 {
        self.repetitions
    }

    /// Value of a single parameter
    #[must_use]
    pub const fn get(&self, parameter: Parameter) -> u8 {
        match parameter {
            Parameter::Speed => self.speed,
            Parameter::Intensity => self.intensity,
            Parameter::Repetitions => self.repetitions,
        }
    }

    /// Set a parameter, clamping to its bounds. Returns the stored value.
    pub fn set(&mut self, parameter: Parameter, value: u8) -> u8 {
        let value = value.clamp(parameter.min(), parameter.max());
        match parameter {
            Parameter::Speed => self.speed = value,
            Parameter::Intensity => self.intensity = value,
            Parameter::Repetitions => self.repetitions = value,
        }
        value
    }

    /// Step a parameter up by one; a no-op at the maximum
    pub fn increment(&mut self, parameter: Parameter) -> u8 {
        let current = self.get(parameter);
        if current >= parameter.max() {
            return current;
        }
        self.set(parameter, current + 1)
    }

    /// Step a parameter down by one; a no-op at the minimum
    pub fn decrement(&mut self, parameter: Parameter) -> u8 {
        let current = self.get(parameter);
        if current <= parameter.min() {
            return current;
        }
        self.set(parameter, current - 1)
    }
}

/// Timing configuration for the discovery, connection and polling sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a scan runs before it is stopped, in milliseconds
    pub scan_duration_ms: u64,
    /// Pause before scanning so the stack can release a previous scan, in milliseconds
    pub scan_settle_ms: u64,
    /// Period of the status polling channel, in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound for a connection attempt, in milliseconds
    pub connect_timeout_ms: u64,
    /// Buffer size of the notice bus
    pub notice_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_duration_ms: 5_000,
            scan_settle_ms: 500,
            poll_interval_ms: 2_000,
            connect_timeout_ms: 10_000,
            notice_capacity: 16,
        }
    }
}

impl SessionConfig {
    /// Scan duration
    #[must_use]
    pub const fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    /// Scan settle delay
    #[must_use]
    pub const fn scan_settle(&self) -> Duration {
        Duration::from_millis(self.scan_settle_ms)
    }

    /// Polling period
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Connection timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Alert raised for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The radio was switched off; scan and connection state were reset
    AdapterPoweredOff,
    /// An action needed the radio but it is not powered on
    AdapterUnavailable(AdapterPowerState),
    /// The scan could not be started
    ScanFailed(String),
    /// Connecting to the selected peripheral failed
    ConnectFailed(String),
    /// The active peripheral went away
    Disconnected {
        /// Display name of the lost peripheral
        peripheral: String,
    },
    /// A control command could not be delivered
    CommandFailed(String),
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterPoweredOff => write!(f, "Bluetooth is off. Turn it on to continue."),
            Self::AdapterUnavailable(state) => {
                write!(f, "Bluetooth is not available ({state}). Turn it on to scan.")
            }
            Self::ScanFailed(reason) => write!(f, "Could not start the scan: {reason}"),
            Self::ConnectFailed(reason) => write!(f, "Could not connect, try again: {reason}"),
            Self::Disconnected { peripheral } => {
                write!(f, "The device {peripheral} was disconnected.")
            }
            Self::CommandFailed(reason) => write!(f, "Command not sent: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_bounds() {
        assert_eq!(Parameter::Speed.max(), 5);
        assert_eq!(Parameter::Intensity.max(), 5);
        assert_eq!(Parameter::Repetitions.max(), 20);
        assert_eq!(Parameter::Repetitions.min(), 1);
    }

    #[test]
    fn test_increment_stops_at_maximum() {
        let mut params = ControlParameters::new(5, 1, 20).unwrap();
        assert_eq!(params.increment(Parameter::Speed), 5);
        assert_eq!(params.increment(Parameter::Repetitions), 20);
        assert_eq!(params.increment(Parameter::Intensity), 2);
        assert_eq!(params, ControlParameters::new(5, 2, 20).unwrap());
    }

    #[test]
    fn test_decrement_stops_at_minimum() {
        let mut params = ControlParameters::default();
        assert_eq!(params.decrement(Parameter::Repetitions), 1);
        assert_eq!(params.decrement(Parameter::Speed), 1);

        params.set(Parameter::Intensity, 3);
        assert_eq!(params.decrement(Parameter::Intensity), 2);
    }

    #[test]
    fn test_set_clamps_to_bounds() {
        let mut params = ControlParameters::default();
        assert_eq!(params.set(Parameter::Speed, 9), 5);
        assert_eq!(params.set(Parameter::Repetitions, 0), 1);
        assert_eq!(params.set(Parameter::Repetitions, 12), 12);
        assert_eq!(params.repetitions(), 12);
    }

    #[test]
    fn test_new_rejects_out_of_range() {
        assert!(ControlParameters::new(0, 1, 1).is_err());
        assert!(ControlParameters::new(1, 6, 1).is_err());
        assert!(ControlParameters::new(1, 1, 21).is_err());
        assert!(ControlParameters::new(3, 2, 10).is_ok());
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.scan_duration(), Duration::from_secs(5));
        assert_eq!(config.scan_settle(), Duration::from_millis(500));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.notice_capacity, 16);
    }

    #[test]
    fn test_power_state_from_central_state() {
        assert_eq!(
            AdapterPowerState::from(CentralState::PoweredOn),
            AdapterPowerState::PoweredOn
        );
        assert_eq!(
            AdapterPowerState::from(CentralState::PoweredOff),
            AdapterPowerState::PoweredOff
        );
        assert!(!AdapterPowerState::default().is_powered_on());
    }

    #[test]
    fn test_peripheral_display_name() {
        let named = PeripheralHandle::new("AA:BB", Some("Reabilita".to_string()));
        let anonymous = PeripheralHandle::new("CC:DD", None);
        assert_eq!(named.display_name(), "Reabilita");
        assert_eq!(anonymous.display_name(), "CC:DD");
        assert_eq!(Connection::new(named).id(), "AA:BB");
    }
}
