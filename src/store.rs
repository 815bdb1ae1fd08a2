//! Persistent configuration store.
//!
//! The device keeps three logical records: the station SSID, the station
//! password, and the soft-AP settings blob. The backing store is opaque
//! behind [`ConfigStore`]; the ESP build implements it over NVS, host
//! builds and tests use [`MemoryStore`].
//!
//! Flash wears out, so [`save_config`] performs a read-compare-write per
//! record and commits only when something actually changed. Access to the
//! store is serialized by one mutex held for the whole read-modify-write
//! sequence (see [`SharedStore`]).

use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::settings::{ApSettings, SettingsError, StationCredentials};

/// Record key for the station SSID.
pub const KEY_SSID: &str = "ssid";
/// Record key for the station password.
pub const KEY_PASSWORD: &str = "password";
/// Record key for the soft-AP settings blob.
pub const KEY_SETTINGS: &str = "settings";

/// Opaque key/value blob store. Implementations need no internal locking;
/// all access goes through the [`SharedStore`] mutex.
pub trait ConfigStore: Send {
    /// Read a record; `None` when the key has never been written.
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stage a record write.
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Flush staged writes to durable storage.
    fn commit(&mut self) -> Result<(), StoreError>;
}

/// The store behind its synchronization mutex. The mutex is held for the
/// duration of every read-modify-write sequence.
pub type SharedStore = Arc<Mutex<Box<dyn ConfigStore>>>;

/// Wrap a store for shared use.
pub fn shared(store: impl ConfigStore + 'static) -> SharedStore {
    Arc::new(Mutex::new(Box::new(store)))
}

/// Persist credentials and settings, writing only records whose stored
/// value differs. Returns the number of records written; zero writes means
/// no commit was issued.
pub fn save_config(
    store: &mut dyn ConfigStore,
    credentials: &StationCredentials,
    settings: &ApSettings,
) -> Result<usize, StoreError> {
    let mut written = 0;

    let mut write_if_changed = |store: &mut dyn ConfigStore,
                                key: &str,
                                value: &[u8]|
     -> Result<bool, StoreError> {
        let stored = store.get(key)?;
        if stored.as_deref() == Some(value) {
            return Ok(false);
        }
        store.set(key, value)?;
        debug!("config record '{}' written ({} bytes)", key, value.len());
        Ok(true)
    };

    if write_if_changed(store, KEY_SSID, credentials.ssid.as_bytes())? {
        written += 1;
    }
    if write_if_changed(store, KEY_PASSWORD, credentials.password.as_bytes())? {
        written += 1;
    }
    if write_if_changed(store, KEY_SETTINGS, &settings.to_bytes())? {
        written += 1;
    }

    if written > 0 {
        store.commit()?;
        info!("config saved, {} record(s) changed", written);
    } else {
        info!("config unchanged, nothing written");
    }

    Ok(written)
}

/// Load credentials and settings from the store.
///
/// Returns `Ok(None)` when no station SSID has ever been stored (first
/// boot). A stored but corrupt settings blob is an error; the caller
/// decides whether to fall back to defaults.
pub fn fetch_config(
    store: &mut dyn ConfigStore,
) -> Result<Option<(StationCredentials, ApSettings)>, StoreError> {
    let ssid_bytes = match store.get(KEY_SSID)? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    let password_bytes = store.get(KEY_PASSWORD)?.unwrap_or_default();

    let ssid = String::from_utf8(ssid_bytes)
        .map_err(|_| StoreError::Corrupt("stored SSID is not UTF-8"))?;
    let password = String::from_utf8(password_bytes)
        .map_err(|_| StoreError::Corrupt("stored password is not UTF-8"))?;
    let credentials = StationCredentials::new(ssid, password)?;

    let settings = match store.get(KEY_SETTINGS)? {
        Some(blob) => ApSettings::from_bytes(&blob)?,
        None => ApSettings::default(),
    };

    Ok(Some((credentials, settings)))
}

/// In-memory store for host builds and tests.
#[derive(Default)]
pub struct MemoryStore {
    records: std::collections::HashMap<String, Vec<u8>>,
    /// Cumulative record writes, inspected by tests.
    pub write_count: usize,
    /// Cumulative commits, inspected by tests.
    pub commit_count: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.records.insert(key.to_string(), value.to_vec());
        self.write_count += 1;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.commit_count += 1;
        Ok(())
    }
}

/// Errors surfaced by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The backing store failed an I/O operation.
    Backend(String),
    /// A stored record is unreadable.
    Corrupt(&'static str),
    /// A stored record decoded but failed validation.
    Invalid(SettingsError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "store backend error: {}", msg),
            Self::Corrupt(what) => write!(f, "corrupt record: {}", what),
            Self::Invalid(e) => write!(f, "invalid record: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Invalid(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SettingsError> for StoreError {
    fn from(e: SettingsError) -> Self {
        Self::Invalid(e)
    }
}
