//! Wi-Fi provisioning library for ESP32-class devices.
//!
//! When no usable credentials are stored, the device raises a fallback
//! access point with a captive portal: a DNS server answers every query
//! with the soft-AP address so that joining devices land on the
//! provisioning UI. Once the user picks a network, the connection manager
//! drives the station association, persists the credentials after the
//! first successful lease, and tears the portal back down.
//!
//! The core is platform-independent and fully testable on the host: all
//! hardware access goes through the [`radio::Radio`], [`radio::PortalHttp`]
//! and [`store::ConfigStore`] traits. The esp-idf implementations live in
//! [`platform`], behind the `esp32` feature.

pub mod dns;
pub mod manager;
#[cfg(feature = "esp32")]
pub mod platform;
pub mod queue;
pub mod radio;
pub mod scan;
pub mod settings;
pub mod status;
pub mod store;
pub mod timer;

// Re-export the types a host application touches directly.
pub use manager::{
    ConnectCause, ConnectionManager, ManagerConfig, ManagerHandle, Message, MessageCode,
};
pub use radio::{IpInfo, PortalHttp, Radio, WifiMode};
pub use scan::{AccessPointRecord, AuthMode};
pub use settings::{ApSettings, StationCredentials};
pub use status::{StatusBuffers, UpdateReason};
pub use store::{ConfigStore, SharedStore};
