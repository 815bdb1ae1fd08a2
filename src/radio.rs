//! Radio/network capability seam.
//!
//! The connection manager never talks to a Wi-Fi driver directly; it issues
//! commands through the [`Radio`] trait and receives completions as
//! [`RadioEvent`]s on its own queue. This keeps the state machine
//! platform-independent and testable on the host. The ESP-IDF
//! implementation lives in `platform` behind the `esp32` feature.

use std::fmt;
use std::net::Ipv4Addr;

use crate::settings::{ApSettings, StationCredentials};

/// Radio operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMode {
    /// Station only.
    Station,
    /// Combined access-point + station (captive-portal mode).
    ApStation,
}

/// IPv4 lease information delivered with a got-IP event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

/// Events emitted by the radio substrate into the manager queue.
///
/// All radio operations are asynchronous: a command returns immediately and
/// its completion arrives later as one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// A scan finished (successfully or not). Also raised when an in-flight
    /// scan is cancelled via [`Radio::scan_stop`].
    ScanDone { success: bool },
    /// The station lost or failed its connection. The reason code is the
    /// driver's disconnect reason, logged for diagnosis only.
    Disconnected { reason: u16 },
    /// The station obtained an IPv4 lease.
    GotIp(IpInfo),
    /// The soft-AP came up.
    ApStarted,
    /// The soft-AP went down.
    ApStopped,
}

/// Commands accepted by the radio substrate.
///
/// Implementations must be non-blocking: completions surface as
/// [`RadioEvent`]s, never as return values.
pub trait Radio: Send {
    /// Begin an asynchronous scan. Completion arrives as `ScanDone`.
    fn scan_start(&mut self) -> Result<(), RadioError>;

    /// Cancel an in-flight scan. The cancellation itself raises a
    /// `ScanDone` event through the normal path.
    fn scan_stop(&mut self) -> Result<(), RadioError>;

    /// Apply station credentials to the driver ahead of a connect.
    fn apply_station_config(&mut self, credentials: &StationCredentials)
        -> Result<(), RadioError>;

    /// Begin connecting to the configured station network.
    fn connect(&mut self) -> Result<(), RadioError>;

    /// Begin disconnecting; completion arrives as `Disconnected`.
    fn disconnect(&mut self) -> Result<(), RadioError>;

    /// Switch the radio operating mode.
    fn set_mode(&mut self, mode: WifiMode) -> Result<(), RadioError>;

    /// Pull the scan result list, bounded by the given capacity.
    fn scan_records(&mut self, max: usize) -> Result<Vec<crate::scan::AccessPointRecord>, RadioError>;

    /// Reconfigure the soft-AP (SSID, passphrase, channel, bandwidth).
    fn configure_ap(&mut self, settings: &ApSettings) -> Result<(), RadioError>;
}

/// External HTTP presentation layer, restarted by the manager when the
/// portal flavor changes. Out-of-scope collaborator; interface only.
pub trait PortalHttp: Send {
    /// Restart the configuration UI. `captive` selects the AP flavor with
    /// the portal redirect page; otherwise the plain STA flavor is served.
    fn restart(&mut self, captive: bool);
}

/// Errors surfaced by a radio implementation.
#[derive(Debug)]
pub enum RadioError {
    /// The driver rejected the command.
    Driver(String),
    /// The command is invalid in the current radio state.
    InvalidState(&'static str),
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Driver(msg) => write!(f, "driver error: {}", msg),
            Self::InvalidState(what) => write!(f, "invalid radio state: {}", what),
        }
    }
}

impl std::error::Error for RadioError {}
