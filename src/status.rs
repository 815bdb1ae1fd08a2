//! Shared status buffers read by the external HTTP layer.
//!
//! Two JSON snapshots live behind a single mutex: the discovered
//! access-point list and the connection status. They nearly always change
//! together, so one lock keeps things simple at the cost of a little
//! concurrency; producers and consumers share the same lock.
//!
//! The buffers hold well-formed JSON on every lock release, including the
//! empty-state fallbacks `[]` and `{}`. All string content goes through the
//! serde escaper, so an SSID full of quotes cannot corrupt a snapshot.
//!
//! The station IP string has its own lock; the HTTP layer reads it on every
//! request to decide its listener binding.

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::warn;
use serde::Serialize;

use crate::radio::IpInfo;
use crate::scan::AccessPointRecord;

/// How long the scan path waits for the snapshot lock before abandoning an
/// update. Stale data beats blocking the radio event path.
pub const JSON_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the connection snapshot was regenerated. The numeric value is
/// published as the `urc` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    /// Connected, lease obtained.
    ConnectionOk = 0,
    /// A user-requested attempt failed (bad credentials, unreachable AP).
    FailedAttempt = 1,
    /// The user explicitly disconnected.
    UserDisconnect = 2,
    /// The connection dropped unexpectedly.
    LostConnection = 3,
}

#[derive(Serialize)]
struct ConnectionSnapshot<'a> {
    ssid: &'a str,
    ip: String,
    netmask: String,
    gw: String,
    urc: u8,
}

/// The two mutex-guarded JSON snapshots.
#[derive(Debug)]
pub struct Snapshots {
    ap_list_json: String,
    status_json: String,
}

impl Snapshots {
    /// Overwrite the AP-list snapshot from a deduplicated scan result.
    pub fn set_ap_list(&mut self, records: &[AccessPointRecord]) {
        // Vec<AccessPointRecord> always serializes; the fallback covers a
        // hypothetical serializer failure without ever leaving bad JSON.
        self.ap_list_json =
            serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string());
    }

    /// Reset the AP-list snapshot to the empty array.
    pub fn clear_ap_list(&mut self) {
        self.ap_list_json = "[]".to_string();
    }

    /// Regenerate the connection snapshot.
    ///
    /// On `ConnectionOk` the lease fields are rendered dotted-decimal; on
    /// every other reason they are the literal string `"0"`.
    pub fn set_connection(&mut self, ssid: &str, reason: UpdateReason, lease: Option<IpInfo>) {
        let snapshot = match (reason, lease) {
            (UpdateReason::ConnectionOk, Some(info)) => ConnectionSnapshot {
                ssid,
                ip: info.ip.to_string(),
                netmask: info.netmask.to_string(),
                gw: info.gateway.to_string(),
                urc: reason as u8,
            },
            _ => ConnectionSnapshot {
                ssid,
                ip: "0".to_string(),
                netmask: "0".to_string(),
                gw: "0".to_string(),
                urc: reason as u8,
            },
        };
        self.status_json =
            serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
    }

    /// Reset the connection snapshot to the empty object.
    pub fn clear_connection(&mut self) {
        self.status_json = "{}".to_string();
    }

    /// Current AP-list JSON.
    pub fn ap_list_json(&self) -> &str {
        &self.ap_list_json
    }

    /// Current connection-status JSON.
    pub fn status_json(&self) -> &str {
        &self.status_json
    }
}

/// Handle shared between the connection manager (producer) and the HTTP
/// layer (consumer).
#[derive(Debug)]
pub struct StatusBuffers {
    snapshots: Mutex<Snapshots>,
    sta_ip: Mutex<String>,
}

impl Default for StatusBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBuffers {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(Snapshots {
                ap_list_json: "[]".to_string(),
                status_json: "{}".to_string(),
            }),
            sta_ip: Mutex::new(Ipv4Addr::UNSPECIFIED.to_string()),
        }
    }

    /// Acquire the snapshot lock, waiting as long as it takes. Used on the
    /// state-transition paths where the update must not be lost.
    pub fn lock(&self) -> MutexGuard<'_, Snapshots> {
        self.snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire the snapshot lock with a bounded wait. Returns `None` on
    /// timeout; the caller is expected to skip its update and log.
    pub fn lock_timeout(&self, timeout: Duration) -> Option<MutexGuard<'_, Snapshots>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.snapshots.try_lock() {
                Ok(guard) => return Some(guard),
                Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                    return Some(poisoned.into_inner())
                }
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        warn!("status snapshot lock not acquired within {:?}", timeout);
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    /// Record the station IP under its own lock.
    pub fn set_sta_ip(&self, ip: Ipv4Addr) {
        let mut guard = self
            .sta_ip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = ip.to_string();
        log::info!("station IP set to {}", guard);
    }

    /// Reset the station IP string to `0.0.0.0`.
    pub fn clear_sta_ip(&self) {
        self.set_sta_ip(Ipv4Addr::UNSPECIFIED);
    }

    /// Read the station IP string.
    pub fn sta_ip(&self) -> String {
        self.sta_ip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
