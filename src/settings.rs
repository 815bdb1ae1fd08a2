//! Durable Wi-Fi configuration data structures.
//!
//! This module contains platform-independent types for the soft-AP settings
//! and the station credentials. Everything here is testable on the host.
//!
//! # Example
//!
//! ```
//! use wifi_provision_esp32::settings::{ApSettings, StationCredentials};
//!
//! let settings = ApSettings::default();
//! assert!(settings.validate().is_ok());
//!
//! let creds = StationCredentials::new("MyNetwork", "MyPassword").unwrap();
//! assert!(creds.validate().is_ok());
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2. A soft-AP passphrase shorter than
/// this forces the access point into open (unauthenticated) mode.
pub const WPA2_MIN_PASSWORD_LEN: usize = 8;

/// Default SSID broadcast by the fallback access point.
pub const DEFAULT_AP_SSID: &str = "esp32-provision";

/// Default passphrase for the fallback access point.
pub const DEFAULT_AP_PASSWORD: &str = "esp32pwd";

/// Default soft-AP channel.
pub const DEFAULT_AP_CHANNEL: u8 = 1;

/// Address the device claims on its own access-point network. This is also
/// the address every hijacked DNS query resolves to.
pub const DEFAULT_AP_IP: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 1);

/// Gateway advertised on the access-point network (the device itself).
pub const DEFAULT_AP_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 10, 0, 1);

/// Netmask of the access-point network.
pub const DEFAULT_AP_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Soft-AP channel bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    /// 20 MHz channel.
    Ht20 = 1,
    /// 40 MHz channel.
    Ht40 = 2,
}

impl Bandwidth {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Ht20),
            2 => Some(Self::Ht40),
            _ => None,
        }
    }
}

/// Station power-save mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSave {
    /// No power save (lowest latency).
    None = 0,
    /// Minimum modem power save.
    Minimum = 1,
    /// Maximum modem power save.
    Maximum = 2,
}

impl PowerSave {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Minimum),
            2 => Some(Self::Maximum),
            _ => None,
        }
    }
}

/// Static IP configuration for the station interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIpConfig {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl Default for StaticIpConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Durable soft-AP and station settings.
///
/// Initialized to compile-time defaults at startup, optionally overwritten
/// by a fetch from the persistent store, and mutated only by the connection
/// manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApSettings {
    /// SSID broadcast by the fallback access point (1-32 bytes).
    pub ap_ssid: String,
    /// Soft-AP passphrase. Fewer than 8 bytes means the AP runs open.
    pub ap_password: String,
    /// Soft-AP channel.
    pub ap_channel: u8,
    /// Whether the soft-AP SSID is hidden from beacons.
    pub ap_hidden: bool,
    /// Soft-AP channel bandwidth.
    pub ap_bandwidth: Bandwidth,
    /// When true, the radio drops back to station-only mode once connected.
    pub sta_only: bool,
    /// Station power-save mode.
    pub sta_power_save: PowerSave,
    /// Whether the station uses a static IP instead of DHCP.
    pub sta_static_ip: bool,
    /// Static IP configuration, meaningful only when `sta_static_ip` is set.
    pub sta_static_ip_config: StaticIpConfig,
}

impl Default for ApSettings {
    fn default() -> Self {
        Self {
            ap_ssid: DEFAULT_AP_SSID.to_string(),
            ap_password: DEFAULT_AP_PASSWORD.to_string(),
            ap_channel: DEFAULT_AP_CHANNEL,
            ap_hidden: false,
            ap_bandwidth: Bandwidth::Ht20,
            sta_only: true,
            sta_power_save: PowerSave::None,
            sta_static_ip: false,
            sta_static_ip_config: StaticIpConfig::default(),
        }
    }
}

impl ApSettings {
    /// Validate the settings against protocol maxima.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.ap_ssid.is_empty() {
            return Err(SettingsError::SsidEmpty);
        }
        if self.ap_ssid.len() > MAX_SSID_LEN {
            return Err(SettingsError::SsidTooLong {
                len: self.ap_ssid.len(),
                max: MAX_SSID_LEN,
            });
        }
        if self.ap_password.len() > MAX_PASSWORD_LEN {
            return Err(SettingsError::PasswordTooLong {
                len: self.ap_password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }
        Ok(())
    }

    /// True when the soft-AP must run without authentication because the
    /// passphrase is below the WPA2 minimum.
    pub fn is_open(&self) -> bool {
        self.ap_password.len() < WPA2_MIN_PASSWORD_LEN
    }

    /// Serialize to bytes for the persistent-store `settings` record.
    ///
    /// Format: `[ssid_len:1][ssid:N][pwd_len:1][pwd:M][channel:1][hidden:1]`
    /// `[bandwidth:1][sta_only:1][power_save:1][static_ip:1][ip:4][mask:4][gw:4]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(20 + self.ap_ssid.len() + self.ap_password.len());
        bytes.push(self.ap_ssid.len() as u8);
        bytes.extend_from_slice(self.ap_ssid.as_bytes());
        bytes.push(self.ap_password.len() as u8);
        bytes.extend_from_slice(self.ap_password.as_bytes());
        bytes.push(self.ap_channel);
        bytes.push(self.ap_hidden as u8);
        bytes.push(self.ap_bandwidth as u8);
        bytes.push(self.sta_only as u8);
        bytes.push(self.sta_power_save as u8);
        bytes.push(self.sta_static_ip as u8);
        bytes.extend_from_slice(&self.sta_static_ip_config.ip.octets());
        bytes.extend_from_slice(&self.sta_static_ip_config.netmask.octets());
        bytes.extend_from_slice(&self.sta_static_ip_config.gateway.octets());
        bytes
    }

    /// Deserialize from the persistent-store `settings` record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SettingsError> {
        let mut cur = Cursor::new(bytes);
        let ap_ssid = cur.take_string()?;
        let ap_password = cur.take_string()?;
        let ap_channel = cur.take_u8()?;
        let ap_hidden = cur.take_u8()? != 0;
        let ap_bandwidth = Bandwidth::from_u8(cur.take_u8()?)
            .ok_or_else(|| SettingsError::InvalidFormat("bad bandwidth".into()))?;
        let sta_only = cur.take_u8()? != 0;
        let sta_power_save = PowerSave::from_u8(cur.take_u8()?)
            .ok_or_else(|| SettingsError::InvalidFormat("bad power save mode".into()))?;
        let sta_static_ip = cur.take_u8()? != 0;
        let ip = cur.take_ipv4()?;
        let netmask = cur.take_ipv4()?;
        let gateway = cur.take_ipv4()?;

        let settings = Self {
            ap_ssid,
            ap_password,
            ap_channel,
            ap_hidden,
            ap_bandwidth,
            sta_only,
            sta_power_save,
            sta_static_ip,
            sta_static_ip_config: StaticIpConfig { ip, netmask, gateway },
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Credentials for joining an upstream network as a station.
///
/// Owned exclusively by the connection manager. The passphrase is zeroized
/// when the value is dropped or cleared.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct StationCredentials {
    /// Network SSID (1-32 bytes; empty means "no credentials").
    pub ssid: String,
    /// Network password (empty for open networks).
    pub password: String,
}

impl StationCredentials {
    /// Create validated credentials.
    pub fn new(
        ssid: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, SettingsError> {
        let creds = Self {
            ssid: ssid.into(),
            password: password.into(),
        };
        creds.validate()?;
        Ok(creds)
    }

    /// The cleared state: no SSID, no password.
    pub fn empty() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
        }
    }

    /// Validate against protocol maxima. Empty credentials are valid; they
    /// represent the "nothing configured" state.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(SettingsError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(SettingsError::PasswordTooLong {
                len: self.password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }
        Ok(())
    }

    /// True when no credentials are configured.
    pub fn is_empty(&self) -> bool {
        self.ssid.is_empty()
    }

    /// Wipe the credentials in place (user-requested disconnect).
    pub fn clear(&mut self) {
        self.ssid.zeroize();
        self.password.zeroize();
        self.ssid = String::new();
        self.password = String::new();
    }
}

/// Byte cursor used by the blob decoders.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_u8(&mut self) -> Result<u8, SettingsError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| SettingsError::InvalidFormat("truncated record".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take_string(&mut self) -> Result<String, SettingsError> {
        let len = self.take_u8()? as usize;
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| SettingsError::InvalidFormat("truncated string".into()))?;
        let s = String::from_utf8(slice.to_vec())
            .map_err(|_| SettingsError::InvalidFormat("invalid UTF-8".into()))?;
        self.pos = end;
        Ok(s)
    }

    fn take_ipv4(&mut self) -> Result<Ipv4Addr, SettingsError> {
        let end = self.pos + 4;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| SettingsError::InvalidFormat("truncated address".into()))?;
        let octets: [u8; 4] = slice.try_into().expect("slice length checked");
        self.pos = end;
        Ok(Ipv4Addr::from(octets))
    }
}

/// Errors raised while validating or decoding settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// SSID is empty where a value is required.
    SsidEmpty,
    /// SSID exceeds the 802.11 maximum.
    SsidTooLong { len: usize, max: usize },
    /// Password exceeds the WPA2 maximum.
    PasswordTooLong { len: usize, max: usize },
    /// Invalid data encountered during deserialization.
    InvalidFormat(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::InvalidFormat(msg) => write!(f, "invalid format: {}", msg),
        }
    }
}

impl std::error::Error for SettingsError {}
