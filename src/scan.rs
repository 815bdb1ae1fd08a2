//! Scan results: the discovered access-point list.
//!
//! The radio mutates its internal record array in place on every scan, so
//! the manager copies the list out wholesale (bounded by [`MAX_AP_NUM`]),
//! deduplicates it, and serializes it for the HTTP layer. The list is never
//! partially updated.

use serde::Serialize;

/// Maximum number of access points kept from a scan.
pub const MAX_AP_NUM: usize = 15;

/// Authentication modes reported by the scanner, mirroring the driver's
/// numbering so the UI can map them back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AuthMode(pub u8);

impl AuthMode {
    pub const OPEN: AuthMode = AuthMode(0);
    pub const WEP: AuthMode = AuthMode(1);
    pub const WPA_PSK: AuthMode = AuthMode(2);
    pub const WPA2_PSK: AuthMode = AuthMode(3);
    pub const WPA_WPA2_PSK: AuthMode = AuthMode(4);
}

/// One sighting of an access point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessPointRecord {
    /// Network name, escaped by the JSON serializer on output.
    pub ssid: String,
    /// Primary channel.
    #[serde(rename = "chan")]
    pub channel: u8,
    /// Received signal strength indicator, dBm.
    pub rssi: i8,
    /// Authentication mode.
    #[serde(rename = "auth")]
    pub auth_mode: AuthMode,
}

/// Deduplicate a scan result by (SSID, authmode).
///
/// Builds a fresh list, stable by original order, truncated to
/// [`MAX_AP_NUM`]. When several sightings share SSID and authmode, the
/// first one survives and carries the maximum RSSI among them. The same
/// SSID under a different authmode is a distinct network.
pub fn dedupe_access_points(records: &[AccessPointRecord]) -> Vec<AccessPointRecord> {
    let mut unique: Vec<AccessPointRecord> = Vec::with_capacity(records.len().min(MAX_AP_NUM));

    for record in records {
        if record.ssid.is_empty() {
            // Hidden networks report an empty SSID; nothing to show.
            continue;
        }
        if let Some(existing) = unique
            .iter_mut()
            .find(|ap| ap.ssid == record.ssid && ap.auth_mode == record.auth_mode)
        {
            if record.rssi > existing.rssi {
                existing.rssi = record.rssi;
            }
        } else if unique.len() < MAX_AP_NUM {
            unique.push(record.clone());
        }
    }

    unique
}
