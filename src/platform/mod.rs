//! esp-idf implementations of the hardware seams.
//!
//! Everything here requires the `esp32` feature and an ESP-IDF toolchain.
//! [`NvsStore`] persists credentials in NVS, [`EspRadio`] drives the Wi-Fi
//! peripheral, and [`forward_radio_events`] subscribes to the system event
//! loop and translates driver events into manager messages.

use std::net::Ipv4Addr;

use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::handle::RawHandle;
use esp_idf_svc::netif::IpEvent;
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent,
};
use esp_idf_sys::{self as sys, esp, EspError};
use log::{info, warn};

use crate::manager::{ManagerHandle, Message};
use crate::radio::{IpInfo, PortalHttp, Radio, RadioError, WifiMode};
use crate::scan::{AccessPointRecord, AuthMode};
use crate::settings::{
    ApSettings, Bandwidth, PowerSave, StationCredentials, DEFAULT_AP_GATEWAY, DEFAULT_AP_IP,
    DEFAULT_AP_NETMASK,
};
use crate::store::ConfigStore;

/// NVS namespace holding the provisioning records.
const NVS_NAMESPACE: &str = "espwifimgr";

/// NVS blobs are bounded by the settings record, the largest of the three.
const NVS_VALUE_MAX: usize = 256;

impl From<EspError> for RadioError {
    fn from(e: EspError) -> Self {
        RadioError::Driver(format!("{e}"))
    }
}

/// Credential storage backed by the default NVS partition.
pub struct NvsStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStore {
    pub fn new() -> Result<Self, EspError> {
        let partition = EspNvsPartition::<NvsDefault>::take()?;
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        Ok(Self { nvs })
    }
}

impl ConfigStore for NvsStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, crate::store::StoreError> {
        let mut buf = [0u8; NVS_VALUE_MAX];
        let bytes = self
            .nvs
            .get_raw(key, &mut buf)
            .map_err(|e| crate::store::StoreError::Backend(format!("{e}")))?;
        Ok(bytes.map(|b| b.to_vec()))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), crate::store::StoreError> {
        self.nvs
            .set_raw(key, value)
            .map_err(|e| crate::store::StoreError::Backend(format!("{e}")))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), crate::store::StoreError> {
        // esp-idf commits each set_raw internally.
        Ok(())
    }
}

/// The Wi-Fi peripheral, driven through esp-idf-svc.
pub struct EspRadio {
    wifi: EspWifi<'static>,
    ap_config: AccessPointConfiguration,
    sta_config: ClientConfiguration,
    settings: ApSettings,
}

impl EspRadio {
    pub fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            ap_config: AccessPointConfiguration::default(),
            sta_config: ClientConfiguration::default(),
            settings: ApSettings::default(),
        }
    }

    fn apply_configuration(&mut self, mode: WifiMode) -> Result<(), RadioError> {
        let config = match mode {
            WifiMode::Station => Configuration::Client(self.sta_config.clone()),
            WifiMode::ApStation => {
                Configuration::Mixed(self.sta_config.clone(), self.ap_config.clone())
            }
        };
        self.wifi.set_configuration(&config)?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        self.apply_radio_tuning()?;
        if mode == WifiMode::ApStation {
            self.configure_ap_netif()?;
        }
        Ok(())
    }

    /// Bandwidth and power-save can only be set on a started driver.
    fn apply_radio_tuning(&mut self) -> Result<(), RadioError> {
        let bandwidth = match self.settings.ap_bandwidth {
            Bandwidth::Ht20 => sys::wifi_bandwidth_t_WIFI_BW_HT20,
            Bandwidth::Ht40 => sys::wifi_bandwidth_t_WIFI_BW_HT40,
        };
        esp!(unsafe { sys::esp_wifi_set_bandwidth(sys::wifi_interface_t_WIFI_IF_AP, bandwidth) })?;

        let power_save = match self.settings.sta_power_save {
            PowerSave::None => sys::wifi_ps_type_t_WIFI_PS_NONE,
            PowerSave::Minimum => sys::wifi_ps_type_t_WIFI_PS_MIN_MODEM,
            PowerSave::Maximum => sys::wifi_ps_type_t_WIFI_PS_MAX_MODEM,
        };
        esp!(unsafe { sys::esp_wifi_set_ps(power_save) })?;
        Ok(())
    }

    /// Put the portal address on the soft-AP netif. The DNS hijack binds
    /// this address, so the netif must hold it before clients join. The
    /// DHCP server has to be down while the address changes.
    fn configure_ap_netif(&mut self) -> Result<(), RadioError> {
        let handle = self.wifi.ap_netif().handle();
        let ip_info = sys::esp_netif_ip_info_t {
            ip: ip4_raw(DEFAULT_AP_IP),
            netmask: ip4_raw(DEFAULT_AP_NETMASK),
            gw: ip4_raw(DEFAULT_AP_GATEWAY),
        };
        unsafe {
            // Already-stopped is not an error here.
            sys::esp_netif_dhcps_stop(handle);
            esp!(sys::esp_netif_set_ip_info(handle, &ip_info))?;
            esp!(sys::esp_netif_dhcps_start(handle))?;
        }
        Ok(())
    }
}

fn ip4_raw(ip: Ipv4Addr) -> sys::esp_ip4_addr_t {
    // esp_ip4_addr_t stores the address in network byte order.
    sys::esp_ip4_addr_t {
        addr: u32::from_le_bytes(ip.octets()),
    }
}

impl Radio for EspRadio {
    fn scan_start(&mut self) -> Result<(), RadioError> {
        self.wifi.start_scan(&Default::default(), false)?;
        Ok(())
    }

    fn scan_stop(&mut self) -> Result<(), RadioError> {
        self.wifi.stop_scan()?;
        Ok(())
    }

    fn apply_station_config(
        &mut self,
        credentials: &StationCredentials,
    ) -> Result<(), RadioError> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        self.sta_config = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidState("ssid too long for driver"))?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidState("password too long for driver"))?,
            auth_method,
            ..Default::default()
        };
        Ok(())
    }

    fn connect(&mut self) -> Result<(), RadioError> {
        self.apply_configuration(if self.wifi.driver().is_ap_enabled()? {
            WifiMode::ApStation
        } else {
            WifiMode::Station
        })?;
        self.wifi.connect()?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), RadioError> {
        self.wifi.disconnect()?;
        Ok(())
    }

    fn set_mode(&mut self, mode: WifiMode) -> Result<(), RadioError> {
        self.apply_configuration(mode)
    }

    fn scan_records(&mut self, max: usize) -> Result<Vec<AccessPointRecord>, RadioError> {
        let found = self.wifi.get_scan_result()?;
        Ok(found
            .into_iter()
            .take(max)
            .map(|ap| AccessPointRecord {
                ssid: ap.ssid.to_string(),
                channel: ap.channel,
                rssi: ap.signal_strength,
                auth_mode: auth_mode_from_driver(ap.auth_method),
            })
            .collect())
    }

    fn configure_ap(&mut self, settings: &ApSettings) -> Result<(), RadioError> {
        let auth_method = if settings.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        self.ap_config = AccessPointConfiguration {
            ssid: settings
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidState("AP ssid too long for driver"))?,
            password: settings
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidState("AP password too long for driver"))?,
            channel: settings.ap_channel,
            ssid_hidden: settings.ap_hidden,
            auth_method,
            ..Default::default()
        };
        self.settings = settings.clone();
        Ok(())
    }
}

fn auth_mode_from_driver(method: Option<AuthMethod>) -> AuthMode {
    match method {
        None | Some(AuthMethod::None) => AuthMode::OPEN,
        Some(AuthMethod::WEP) => AuthMode::WEP,
        Some(AuthMethod::WPA) => AuthMode::WPA_PSK,
        Some(AuthMethod::WPA2Personal) => AuthMode::WPA2_PSK,
        _ => AuthMode::WPA_WPA2_PSK,
    }
}

/// Subscribe to the system event loop and forward Wi-Fi and IP events into
/// the manager queue. The returned subscriptions must stay alive for as
/// long as the manager runs.
pub fn forward_radio_events(
    sysloop: &EspSystemEventLoop,
    handle: ManagerHandle,
) -> Result<(EspSubscription<'static, System>, EspSubscription<'static, System>), EspError> {
    let wifi_handle = handle.clone();
    let wifi_sub = sysloop.subscribe::<WifiEvent, _>(move |event| match event {
        WifiEvent::ScanDone(done) => wifi_handle.radio_event(Message::ScanDone {
            success: done.is_scan_successful(),
        }),
        WifiEvent::StaDisconnected(info) => wifi_handle.radio_event(Message::StaDisconnected {
            reason: info.reason() as u16,
        }),
        WifiEvent::ApStarted => wifi_handle.radio_event(Message::ApStarted),
        WifiEvent::ApStopped => wifi_handle.radio_event(Message::ApStopped),
        _ => {}
    })?;

    let ip_sub = sysloop.subscribe::<IpEvent, _>(move |event| {
        if let IpEvent::DhcpIpAssigned(assignment) = event {
            let settings = assignment.ip_settings;
            handle.radio_event(Message::GotIp(IpInfo {
                ip: settings.ip,
                netmask: Ipv4Addr::from(settings.subnet.mask),
                gateway: settings.subnet.gateway,
            }));
        }
    })?;

    Ok((wifi_sub, ip_sub))
}

/// Placeholder HTTP seam. The firmware plugs its own `EspHttpServer`
/// handlers in here; this type only tracks the requested flavor so the
/// manager's lifecycle calls have somewhere to land.
pub struct EspPortalHttp {
    captive: bool,
}

impl EspPortalHttp {
    pub fn new() -> Self {
        Self { captive: false }
    }
}

impl Default for EspPortalHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl PortalHttp for EspPortalHttp {
    fn restart(&mut self, captive: bool) {
        if self.captive != captive {
            info!(
                "HTTP server restart requested (captive portal: {})",
                captive
            );
            self.captive = captive;
        } else {
            warn!("HTTP server already in requested flavor");
        }
    }
}
