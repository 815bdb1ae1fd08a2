//! The connection manager: a single-consumer state machine serializing all
//! radio and network transitions through one bounded queue.
//!
//! Commands (from the UI, boot sequence and timers) and radio events all
//! arrive as [`Message`]s. The manager is the only consumer, so every
//! externally visible side effect (DNS hijack start/stop, HTTP restart,
//! persistence writes, JSON regeneration) happens inside the loop and no
//! two transitions ever race on shared state. Locks exist only around data
//! read by outside consumers (the status buffers and the persistent
//! store).
//!
//! Retry and fallback policy, in short: a failed user-requested attempt is
//! reported once and never retried (a wrong password must not trap the
//! user in a retry loop); an unexpected loss is retried a bounded number
//! of times before the fallback access point comes back up.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::dns::DnsServer;
use crate::queue::{self, Receiver, Sender, QUEUE_CAPACITY};
use crate::radio::{IpInfo, PortalHttp, Radio, WifiMode};
use crate::scan::{dedupe_access_points, MAX_AP_NUM};
use crate::settings::{ApSettings, StationCredentials, DEFAULT_AP_IP};
use crate::status::{StatusBuffers, UpdateReason, JSON_LOCK_TIMEOUT};
use crate::store::{self, SharedStore};
use crate::timer::OneShot;

/// Why a connect attempt was made. Carried on the in-flight attempt and
/// consumed exactly once by the disconnect/success handler, which uses it
/// to attribute the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCause {
    /// The user asked for this connection from the portal UI.
    User,
    /// The retry timer re-issued the connect after an unexpected loss.
    AutoReconnect,
    /// Credentials restored from the persistent store at boot.
    Restore,
}

/// Messages consumed by the manager loop: commands first, radio events
/// after. Payloads are owned by the message and released after dispatch
/// and callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Start an asynchronous scan (ignored while one is in flight).
    StartScan,
    /// Connect as a station. User-initiated connects carry the fresh
    /// credentials to apply.
    Connect {
        cause: ConnectCause,
        credentials: Option<StationCredentials>,
    },
    /// User-requested disconnect.
    Disconnect,
    /// Bring up the fallback access point (portal mode).
    StartAp,
    /// Tear the access point back down (normally fired by the shutdown
    /// timer).
    StopAp,
    /// Load persisted credentials and either restore the connection or
    /// start the portal. Queued once at startup.
    LoadAndRestore,
    /// Radio event: scan finished.
    ScanDone { success: bool },
    /// Radio event: station disconnected, with the driver reason code.
    StaDisconnected { reason: u16 },
    /// Radio event: station obtained a lease.
    GotIp(IpInfo),
    /// Radio event: soft-AP came up.
    ApStarted,
    /// Radio event: soft-AP went down.
    ApStopped,
    /// Stop the manager loop (teardown).
    Shutdown,
}

/// Discriminant used for callback registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    StartScan,
    Connect,
    Disconnect,
    StartAp,
    StopAp,
    LoadAndRestore,
    ScanDone,
    StaDisconnected,
    GotIp,
    ApStarted,
    ApStopped,
    Shutdown,
}

impl Message {
    /// The code used to look up a registered callback.
    pub fn code(&self) -> MessageCode {
        match self {
            Message::StartScan => MessageCode::StartScan,
            Message::Connect { .. } => MessageCode::Connect,
            Message::Disconnect => MessageCode::Disconnect,
            Message::StartAp => MessageCode::StartAp,
            Message::StopAp => MessageCode::StopAp,
            Message::LoadAndRestore => MessageCode::LoadAndRestore,
            Message::ScanDone { .. } => MessageCode::ScanDone,
            Message::StaDisconnected { .. } => MessageCode::StaDisconnected,
            Message::GotIp(_) => MessageCode::GotIp,
            Message::ApStarted => MessageCode::ApStarted,
            Message::ApStopped => MessageCode::ApStopped,
            Message::Shutdown => MessageCode::Shutdown,
        }
    }
}

/// Host-registered callback, invoked synchronously after the manager's own
/// handling of the matching message, never before.
pub type Callback = Box<dyn FnMut(&Message) + Send>;

/// Tunables for the retry/fallback policy.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Unexpected-loss reconnect attempts before the fallback AP starts.
    pub max_retries: u8,
    /// Delay before an automatic reconnect attempt.
    pub retry_delay: Duration,
    /// Grace period before the AP shuts down after a successful
    /// connection. Zero stops the AP immediately.
    pub ap_shutdown_delay: Duration,
    /// Address of the soft-AP network; also the DNS hijack answer.
    pub ap_ip: std::net::Ipv4Addr,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(8),
            ap_shutdown_delay: Duration::from_secs(60),
            ap_ip: DEFAULT_AP_IP,
        }
    }
}

/// Errors raised by the manager's registration-time API.
#[derive(Debug)]
pub enum ManagerError {
    /// A callback is already registered for this code.
    DuplicateCallback(MessageCode),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateCallback(code) => {
                write!(f, "callback already registered for {:?}", code)
            }
        }
    }
}

impl std::error::Error for ManagerError {}

/// The connection manager. Construct with [`ConnectionManager::new`],
/// register callbacks, then consume it with [`ConnectionManager::start`].
pub struct ConnectionManager {
    radio: Box<dyn Radio>,
    http: Box<dyn PortalHttp>,
    store: SharedStore,
    status: Arc<StatusBuffers>,
    config: ManagerConfig,

    tx: Sender<Message>,
    rx: Receiver<Message>,
    callbacks: HashMap<MessageCode, Callback>,

    settings: ApSettings,
    credentials: StationCredentials,

    // Transition state, touched only by the consumer loop.
    connected: bool,
    ap_active: bool,
    scan_in_progress: bool,
    pending_connect: Option<ConnectCause>,
    disconnect_requested: bool,
    retries: u8,

    retry_timer: OneShot,
    ap_shutdown_timer: OneShot,
    dns: Option<DnsServer>,
}

impl ConnectionManager {
    pub fn new(
        radio: Box<dyn Radio>,
        http: Box<dyn PortalHttp>,
        store: SharedStore,
        status: Arc<StatusBuffers>,
        config: ManagerConfig,
    ) -> Self {
        let (tx, rx) = queue::bounded(QUEUE_CAPACITY);
        Self {
            radio,
            http,
            store,
            status,
            config,
            tx,
            rx,
            callbacks: HashMap::new(),
            settings: ApSettings::default(),
            credentials: StationCredentials::empty(),
            connected: false,
            ap_active: false,
            scan_in_progress: false,
            pending_connect: None,
            disconnect_requested: false,
            retries: 0,
            retry_timer: OneShot::new("retry"),
            ap_shutdown_timer: OneShot::new("ap_shutdown"),
            dns: None,
        }
    }

    /// Register the single callback for a message code. Registering twice
    /// for the same code is rejected.
    pub fn register_callback(
        &mut self,
        code: MessageCode,
        callback: Callback,
    ) -> Result<(), ManagerError> {
        if self.callbacks.contains_key(&code) {
            return Err(ManagerError::DuplicateCallback(code));
        }
        self.callbacks.insert(code, callback);
        Ok(())
    }

    /// A producer handle into the manager queue.
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            tx: self.tx.clone(),
            status: self.status.clone(),
        }
    }

    /// Bring the radio into its boot state and spawn the consumer loop.
    /// The first queued message restores any persisted connection.
    pub fn start(mut self) -> std::io::Result<ManagerHandle> {
        let handle = self.handle();
        self.startup();
        self.tx.send(Message::LoadAndRestore);
        thread::Builder::new()
            .name("wifi_manager".to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    /// Apply settings to the radio and present the station-flavor UI. The
    /// AP is not started here: it only comes up when needed.
    fn startup(&mut self) {
        if let Err(e) = self.radio.configure_ap(&self.settings) {
            error!("failed to apply soft-AP configuration: {}", e);
        }
        if let Err(e) = self.radio.set_mode(WifiMode::Station) {
            error!("failed to enter station mode: {}", e);
        }
        self.http.restart(false);
    }

    fn run(mut self) {
        loop {
            let msg = self.rx.recv();
            if !self.dispatch(msg) {
                break;
            }
        }
        info!("connection manager stopped");
    }

    /// Handle one message, then invoke its registered callback. Returns
    /// false when the loop must stop.
    fn dispatch(&mut self, msg: Message) -> bool {
        if matches!(msg, Message::Shutdown) {
            return false;
        }
        let invoke_callback = self.handle_message(&msg);
        if invoke_callback {
            if let Some(callback) = self.callbacks.get_mut(&msg.code()) {
                callback(&msg);
            }
        }
        true
    }

    /// The state machine proper. Returns whether the message's callback
    /// should fire (suppressed only by the stop-AP race guard).
    fn handle_message(&mut self, msg: &Message) -> bool {
        match msg {
            Message::StartScan => self.on_start_scan(),
            Message::ScanDone { success } => self.on_scan_done(*success),
            Message::LoadAndRestore => self.on_load_and_restore(),
            Message::Connect { cause, credentials } => {
                self.on_connect(*cause, credentials.clone())
            }
            Message::StaDisconnected { reason } => self.on_sta_disconnected(*reason),
            Message::StartAp => self.on_start_ap(),
            Message::StopAp => return self.on_stop_ap(),
            Message::GotIp(info) => self.on_got_ip(*info),
            Message::ApStarted => {
                info!("soft-AP started");
                self.ap_active = true;
            }
            Message::ApStopped => {
                info!("soft-AP stopped");
                self.ap_active = false;
            }
            Message::Disconnect => self.on_disconnect(),
            Message::Shutdown => unreachable!("handled in dispatch"),
        }
        true
    }

    fn on_start_scan(&mut self) {
        // A scan already in flight makes this a no-op; the scan bit is
        // cleared by the eventual ScanDone.
        if self.scan_in_progress {
            return;
        }
        self.scan_in_progress = true;
        if let Err(e) = self.radio.scan_start() {
            error!("scan start failed: {}", e);
            self.scan_in_progress = false;
        }
    }

    fn on_scan_done(&mut self, success: bool) {
        self.scan_in_progress = false;
        if !success {
            return;
        }
        // The driver mutates its record list in place, so it is copied out
        // wholesale on every scan.
        let records = match self.radio.scan_records(MAX_AP_NUM) {
            Ok(records) => records,
            Err(e) => {
                error!("failed to read scan records: {}", e);
                return;
            }
        };
        let unique = dedupe_access_points(&records);
        // A lock timeout here is a local failure: the result is dropped
        // rather than blocking the radio event path on the HTTP layer.
        match self.status.lock_timeout(JSON_LOCK_TIMEOUT) {
            Some(mut snapshots) => snapshots.set_ap_list(&unique),
            None => error!("could not lock status snapshots after scan; result dropped"),
        }
    }

    fn on_load_and_restore(&mut self) {
        let fetched = {
            let mut store = self
                .store
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            store::fetch_config(store.as_mut())
        };
        match fetched {
            Ok(Some((credentials, settings))) if !credentials.is_empty() => {
                info!("saved wifi found on startup, will attempt to connect");
                self.credentials = credentials;
                self.settings = settings;
                if let Err(e) = self.radio.configure_ap(&self.settings) {
                    error!("failed to apply restored soft-AP settings: {}", e);
                }
                self.tx.send(Message::Connect {
                    cause: ConnectCause::Restore,
                    credentials: None,
                });
            }
            Ok(_) => {
                info!("no saved wifi found on startup, starting access point");
                self.tx.send(Message::StartAp);
            }
            Err(e) => {
                error!("config fetch failed ({}), starting access point", e);
                self.tx.send(Message::StartAp);
            }
        }
    }

    fn on_connect(&mut self, cause: ConnectCause, credentials: Option<StationCredentials>) {
        info!("connect requested ({:?})", cause);
        if let Some(credentials) = credentials {
            self.credentials = credentials;
        }
        self.pending_connect = Some(cause);

        if self.connected {
            return;
        }
        if let Err(e) = self.radio.apply_station_config(&self.credentials) {
            error!("failed to apply station credentials: {}", e);
            return;
        }
        // An in-flight scan would starve the connect; cancelling it is
        // asynchronous and raises its own ScanDone through the event path.
        if self.scan_in_progress {
            if let Err(e) = self.radio.scan_stop() {
                warn!("scan cancellation failed: {}", e);
            }
        }
        if let Err(e) = self.radio.connect() {
            error!("connect command failed: {}", e);
        }
    }

    fn on_sta_disconnected(&mut self, reason: u16) {
        info!("station disconnected, driver reason {}", reason);

        self.connected = false;
        // A disconnect during a scan means the scan will never complete;
        // clearing the bit keeps scanning usable afterwards.
        self.scan_in_progress = false;
        self.status.clear_sta_ip();
        // Connectivity is being reconfigured; a pending AP shutdown no
        // longer applies.
        self.ap_shutdown_timer.cancel();

        if self.pending_connect == Some(ConnectCause::User) {
            // A user-requested attempt failed. Report once; no retries, so
            // a wrong password cannot trap the user in a loop.
            self.pending_connect = None;
            self.status
                .lock()
                .set_connection(&self.credentials.ssid, UpdateReason::FailedAttempt, None);
        } else if self.disconnect_requested {
            // The user asked for this disconnect: erase the credentials,
            // persist the erasure and go back to portal mode.
            self.disconnect_requested = false;
            self.credentials.clear();
            self.status
                .lock()
                .set_connection("", UpdateReason::UserDisconnect, None);
            self.persist_config();
            self.tx.send(Message::StartAp);
        } else {
            // Unexpected loss (including a failed restore or auto-retry).
            self.pending_connect = None;
            self.status
                .lock()
                .set_connection(&self.credentials.ssid, UpdateReason::LostConnection, None);

            let tx = self.tx.clone();
            self.retry_timer.arm(self.config.retry_delay, move || {
                info!("retry timer fired, requesting auto-reconnect");
                tx.send(Message::Connect {
                    cause: ConnectCause::AutoReconnect,
                    credentials: None,
                });
            });

            if !self.ap_active {
                if self.retries < self.config.max_retries {
                    self.retries += 1;
                } else {
                    // Lost beyond repair: expose the portal again.
                    self.retries = 0;
                    self.tx.send(Message::StartAp);
                }
            }
        }
    }

    fn on_start_ap(&mut self) {
        info!("starting fallback access point");
        if let Err(e) = self.radio.set_mode(WifiMode::ApStation) {
            error!("failed to enter AP+STA mode: {}", e);
            return;
        }
        self.http.restart(true);
        match DnsServer::start(self.config.ap_ip) {
            Ok(server) => self.dns = Some(server),
            // No hijack without a port 53 bind; the portal degrades to
            // "no redirect" instead of taking the device down.
            Err(e) => error!("DNS hijack unavailable: {}", e),
        }
    }

    /// Returns false (suppressing the callback) when the race guard trips:
    /// the shutdown timer may fire after a fresh disconnect, in which case
    /// the AP must stay up.
    fn on_stop_ap(&mut self) -> bool {
        if !self.connected {
            warn!("stop-AP ignored: station no longer connected");
            return false;
        }
        info!("stopping access point");
        if let Err(e) = self.radio.set_mode(WifiMode::Station) {
            error!("failed to enter station mode: {}", e);
        }
        self.dns = None;
        self.http.restart(false);
        true
    }

    fn on_got_ip(&mut self, info: IpInfo) {
        info!("station got IP {}", info.ip);
        self.connected = true;
        let cause = self.pending_connect.take();

        self.status.set_sta_ip(info.ip);

        // Restored credentials are already on disk; everything else gets
        // persisted now that the connection is proven.
        if cause != Some(ConnectCause::Restore) {
            self.persist_config();
        }

        self.retries = 0;
        self.status
            .lock()
            .set_connection(&self.credentials.ssid, UpdateReason::ConnectionOk, Some(info));

        // Connectivity is real now; the hijack must not outlive it.
        self.dns = None;

        if self.ap_active {
            if self.config.ap_shutdown_delay.is_zero() {
                self.tx.send_front(Message::StopAp);
            } else {
                let tx = self.tx.clone();
                self.ap_shutdown_timer
                    .arm(self.config.ap_shutdown_delay, move || {
                        // Head of the queue: AP lifecycle stays responsive
                        // even when the queue is busy.
                        tx.send_front(Message::StopAp);
                    });
            }
        }
    }

    fn on_disconnect(&mut self) {
        info!("user disconnect requested");
        self.disconnect_requested = true;
        if let Err(e) = self.radio.disconnect() {
            error!("disconnect command failed: {}", e);
        }
    }

    fn persist_config(&mut self) {
        let mut store = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = store::save_config(store.as_mut(), &self.credentials, &self.settings) {
            // Logged, not retried: the next change overwrites naturally.
            error!("config save failed: {}", e);
        }
    }
}

/// Producer handle used by the HTTP layer, boot code and tests.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: Sender<Message>,
    status: Arc<StatusBuffers>,
}

impl ManagerHandle {
    /// Request an asynchronous scan.
    pub fn scan_async(&self) {
        self.tx.send(Message::StartScan);
    }

    /// Request a user-initiated connection with fresh credentials. The
    /// stale connection snapshot is cleared first so the front-end cannot
    /// read the previous outcome as this attempt's result.
    pub fn connect_async(&self, credentials: StationCredentials) {
        self.status.lock().clear_connection();
        self.tx.send(Message::Connect {
            cause: ConnectCause::User,
            credentials: Some(credentials),
        });
    }

    /// Request a user-initiated disconnect.
    pub fn disconnect_async(&self) {
        self.tx.send(Message::Disconnect);
    }

    /// Request the fallback access point.
    pub fn start_ap_async(&self) {
        self.tx.send(Message::StartAp);
    }

    /// Forward a radio event into the queue.
    pub fn radio_event(&self, msg: Message) {
        self.tx.send(msg);
    }

    /// Stop the manager loop.
    pub fn shutdown(&self) {
        self.tx.send_front(Message::Shutdown);
    }

    /// The shared status buffers (for the HTTP layer).
    pub fn status(&self) -> &StatusBuffers {
        &self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::RadioError;
    use crate::scan::{AccessPointRecord, AuthMode};
    use crate::store::{ConfigStore, MemoryStore};
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum RadioCall {
        ScanStart,
        ScanStop,
        ApplyStationConfig(String),
        Connect,
        Disconnect,
        SetMode(WifiMode),
        ConfigureAp,
    }

    #[derive(Clone, Default)]
    struct FakeRadio {
        calls: Arc<Mutex<Vec<RadioCall>>>,
        scan_results: Arc<Mutex<Vec<AccessPointRecord>>>,
    }

    impl FakeRadio {
        fn calls(&self) -> Vec<RadioCall> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: RadioCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Radio for FakeRadio {
        fn scan_start(&mut self) -> Result<(), RadioError> {
            self.push(RadioCall::ScanStart);
            Ok(())
        }
        fn scan_stop(&mut self) -> Result<(), RadioError> {
            self.push(RadioCall::ScanStop);
            Ok(())
        }
        fn apply_station_config(
            &mut self,
            credentials: &StationCredentials,
        ) -> Result<(), RadioError> {
            self.push(RadioCall::ApplyStationConfig(credentials.ssid.clone()));
            Ok(())
        }
        fn connect(&mut self) -> Result<(), RadioError> {
            self.push(RadioCall::Connect);
            Ok(())
        }
        fn disconnect(&mut self) -> Result<(), RadioError> {
            self.push(RadioCall::Disconnect);
            Ok(())
        }
        fn set_mode(&mut self, mode: WifiMode) -> Result<(), RadioError> {
            self.push(RadioCall::SetMode(mode));
            Ok(())
        }
        fn scan_records(&mut self, max: usize) -> Result<Vec<AccessPointRecord>, RadioError> {
            let mut records = self.scan_results.lock().unwrap().clone();
            records.truncate(max);
            Ok(records)
        }
        fn configure_ap(&mut self, _settings: &ApSettings) -> Result<(), RadioError> {
            self.push(RadioCall::ConfigureAp);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeHttp {
        restarts: Arc<Mutex<Vec<bool>>>,
    }

    impl PortalHttp for FakeHttp {
        fn restart(&mut self, captive: bool) {
            self.restarts.lock().unwrap().push(captive);
        }
    }

    struct Fixture {
        manager: ConnectionManager,
        radio: FakeRadio,
        http: FakeHttp,
        store: SharedStore,
        status: Arc<StatusBuffers>,
    }

    fn fixture(config: ManagerConfig) -> Fixture {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init()
            .ok();
        let radio = FakeRadio::default();
        let http = FakeHttp::default();
        let store = store::shared(MemoryStore::new());
        let status = Arc::new(StatusBuffers::new());
        let manager = ConnectionManager::new(
            Box::new(radio.clone()),
            Box::new(http.clone()),
            store.clone(),
            status.clone(),
            config,
        );
        Fixture {
            manager,
            radio,
            http,
            store,
            status,
        }
    }

    /// Test config with timers long enough to never fire mid-test.
    fn quiet_config() -> ManagerConfig {
        ManagerConfig {
            max_retries: 3,
            retry_delay: Duration::from_secs(600),
            ap_shutdown_delay: Duration::from_secs(600),
            ap_ip: Ipv4Addr::new(10, 10, 0, 1),
        }
    }

    /// Process messages the manager queued for itself.
    fn drain(manager: &mut ConnectionManager) {
        while let Some(msg) = manager.rx.try_recv() {
            manager.dispatch(msg);
        }
    }

    fn creds(ssid: &str) -> StationCredentials {
        StationCredentials::new(ssid, "password123").unwrap()
    }

    fn lease() -> IpInfo {
        IpInfo {
            ip: Ipv4Addr::new(192, 168, 1, 42),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
        }
    }

    fn user_connect(manager: &mut ConnectionManager, ssid: &str) {
        manager.dispatch(Message::Connect {
            cause: ConnectCause::User,
            credentials: Some(creds(ssid)),
        });
    }

    fn status_urc(status: &StatusBuffers) -> Option<u64> {
        let json = status.lock().status_json().to_string();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        parsed["urc"].as_u64()
    }

    // ==================== Scan ====================

    #[test]
    fn test_scan_issued_once_while_in_flight() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartScan);
        fx.manager.dispatch(Message::StartScan);
        assert_eq!(
            fx.radio
                .calls()
                .iter()
                .filter(|c| **c == RadioCall::ScanStart)
                .count(),
            1
        );
    }

    #[test]
    fn test_scan_done_publishes_deduplicated_list() {
        let mut fx = fixture(quiet_config());
        *fx.radio.scan_results.lock().unwrap() = vec![
            AccessPointRecord {
                ssid: "Home".into(),
                channel: 1,
                rssi: -70,
                auth_mode: AuthMode::WPA2_PSK,
            },
            AccessPointRecord {
                ssid: "Home".into(),
                channel: 6,
                rssi: -40,
                auth_mode: AuthMode::WPA2_PSK,
            },
        ];
        fx.manager.dispatch(Message::StartScan);
        fx.manager.dispatch(Message::ScanDone { success: true });

        assert!(!fx.manager.scan_in_progress);
        let json = fx.status.lock().ap_list_json().to_string();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);
        assert_eq!(parsed[0]["rssi"], -40);
    }

    #[test]
    fn test_failed_scan_leaves_list_untouched() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartScan);
        fx.manager.dispatch(Message::ScanDone { success: false });
        assert_eq!(fx.status.lock().ap_list_json(), "[]");
        assert!(!fx.manager.scan_in_progress);
    }

    #[test]
    fn test_disconnect_during_scan_reenables_scanning() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartScan);

        // The driver never raises ScanDone for a scan interrupted by a
        // disconnect; the disconnect handler must clear the bit itself or
        // scanning stays wedged forever.
        fx.manager.dispatch(Message::StaDisconnected { reason: 200 });
        assert!(!fx.manager.scan_in_progress);

        fx.manager.dispatch(Message::StartScan);
        assert_eq!(
            fx.radio
                .calls()
                .iter()
                .filter(|c| **c == RadioCall::ScanStart)
                .count(),
            2
        );
    }

    #[test]
    fn test_connect_cancels_inflight_scan() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartScan);
        user_connect(&mut fx.manager, "Home");
        let calls = fx.radio.calls();
        let stop = calls.iter().position(|c| *c == RadioCall::ScanStop);
        let connect = calls.iter().position(|c| *c == RadioCall::Connect);
        assert!(stop.unwrap() < connect.unwrap());
    }

    // ==================== Connect / got IP ====================

    #[test]
    fn test_user_connect_applies_credentials() {
        let mut fx = fixture(quiet_config());
        user_connect(&mut fx.manager, "Home");
        assert!(fx
            .radio
            .calls()
            .contains(&RadioCall::ApplyStationConfig("Home".into())));
        assert!(fx.radio.calls().contains(&RadioCall::Connect));
    }

    #[test]
    fn test_got_ip_publishes_status_and_persists() {
        let mut fx = fixture(quiet_config());
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));

        assert!(fx.manager.connected);
        assert_eq!(fx.manager.pending_connect, None);
        assert_eq!(fx.status.sta_ip(), "192.168.1.42");
        assert_eq!(status_urc(&fx.status), Some(0));

        // Credentials reached the store.
        let mut store = fx.store.lock().unwrap();
        let ssid = store.get(crate::store::KEY_SSID).unwrap().unwrap();
        assert_eq!(ssid, b"Home");
    }

    #[test]
    fn test_got_ip_after_restore_skips_persistence() {
        let fx_store = store::shared(MemoryStore::new());
        {
            let mut store = fx_store.lock().unwrap();
            store::save_config(store.as_mut(), &creds("Saved"), &ApSettings::default())
                .unwrap();
        }
        let radio = FakeRadio::default();
        let status = Arc::new(StatusBuffers::new());
        let mut manager = ConnectionManager::new(
            Box::new(radio.clone()),
            Box::new(FakeHttp::default()),
            fx_store.clone(),
            status,
            quiet_config(),
        );

        manager.dispatch(Message::LoadAndRestore);
        drain(&mut manager);
        assert_eq!(manager.pending_connect, Some(ConnectCause::Restore));

        manager.dispatch(Message::GotIp(lease()));

        // Restore must not rewrite flash. A save of identical data is a
        // no-op, so a zero-write save proves nothing changed since seeding.
        let mut store = fx_store.lock().unwrap();
        let written =
            store::save_config(store.as_mut(), &creds("Saved"), &ApSettings::default())
                .unwrap();
        assert_eq!(written, 0);
    }

    #[test]
    fn test_got_ip_arms_ap_shutdown_only_when_ap_active() {
        let mut fx = fixture(quiet_config());
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));
        assert!(!fx.manager.ap_shutdown_timer.is_armed());

        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartAp);
        fx.manager.dispatch(Message::ApStarted);
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));
        assert!(fx.manager.ap_shutdown_timer.is_armed());
    }

    #[test]
    fn test_got_ip_with_zero_grace_stops_ap_immediately() {
        let mut fx = fixture(ManagerConfig {
            ap_shutdown_delay: Duration::ZERO,
            ..quiet_config()
        });
        fx.manager.dispatch(Message::StartAp);
        fx.manager.dispatch(Message::ApStarted);
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));
        drain(&mut fx.manager);
        assert!(fx
            .radio
            .calls()
            .contains(&RadioCall::SetMode(WifiMode::Station)));
    }

    // ==================== Disconnect attribution ====================

    #[test]
    fn test_user_attempt_failure_never_retries() {
        let mut fx = fixture(quiet_config());
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::StaDisconnected { reason: 15 });

        assert_eq!(status_urc(&fx.status), Some(1));
        assert_eq!(fx.manager.retries, 0);
        assert!(!fx.manager.retry_timer.is_armed());
        assert_eq!(fx.manager.pending_connect, None);
        // No fallback AP requested either.
        drain(&mut fx.manager);
        assert!(!fx
            .radio
            .calls()
            .contains(&RadioCall::SetMode(WifiMode::ApStation)));
    }

    #[test]
    fn test_user_disconnect_erases_and_starts_ap() {
        let mut fx = fixture(quiet_config());
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));

        fx.manager.dispatch(Message::Disconnect);
        assert!(fx.radio.calls().contains(&RadioCall::Disconnect));
        fx.manager.dispatch(Message::StaDisconnected { reason: 8 });

        assert!(fx.manager.credentials.is_empty());
        assert_eq!(status_urc(&fx.status), Some(2));
        assert_eq!(fx.status.sta_ip(), "0.0.0.0");

        // The erasure was persisted.
        {
            let mut store = fx.store.lock().unwrap();
            let ssid = store.get(crate::store::KEY_SSID).unwrap().unwrap();
            assert!(ssid.is_empty());
        }

        // And the portal came back.
        drain(&mut fx.manager);
        assert!(fx
            .radio
            .calls()
            .contains(&RadioCall::SetMode(WifiMode::ApStation)));
        assert_eq!(fx.http.restarts.lock().unwrap().last(), Some(&true));
    }

    #[test]
    fn test_unexpected_loss_arms_retry_and_counts() {
        let mut fx = fixture(quiet_config());
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));

        fx.manager.dispatch(Message::StaDisconnected { reason: 200 });
        assert_eq!(status_urc(&fx.status), Some(3));
        assert!(fx.manager.retry_timer.is_armed());
        assert_eq!(fx.manager.retries, 1);
    }

    #[test]
    fn test_retry_bound_requests_ap_exactly_once_and_resets() {
        let mut fx = fixture(quiet_config());
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));

        // max_retries consecutive losses increment the counter only.
        for i in 1..=3 {
            fx.manager.dispatch(Message::StaDisconnected { reason: 200 });
            assert_eq!(fx.manager.retries, i);
            assert!(fx.manager.rx.try_recv().is_none());
        }

        // The saturating loss resets the counter and requests the AP.
        fx.manager.dispatch(Message::StaDisconnected { reason: 200 });
        assert_eq!(fx.manager.retries, 0);
        assert_eq!(fx.manager.rx.try_recv(), Some(Message::StartAp));
        assert!(fx.manager.rx.try_recv().is_none());
    }

    #[test]
    fn test_loss_with_ap_active_does_not_count_retries() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartAp);
        fx.manager.dispatch(Message::ApStarted);
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));
        drain(&mut fx.manager);

        fx.manager.dispatch(Message::StaDisconnected { reason: 200 });
        assert_eq!(fx.manager.retries, 0);
        assert!(fx.manager.rx.try_recv().is_none());
    }

    #[test]
    fn test_disconnect_cancels_pending_ap_shutdown() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartAp);
        fx.manager.dispatch(Message::ApStarted);
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));
        assert!(fx.manager.ap_shutdown_timer.is_armed());

        fx.manager.dispatch(Message::StaDisconnected { reason: 200 });
        assert!(!fx.manager.ap_shutdown_timer.is_armed());
    }

    // ==================== AP lifecycle ====================

    #[test]
    fn test_start_ap_restarts_http_in_captive_flavor() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartAp);
        assert!(fx
            .radio
            .calls()
            .contains(&RadioCall::SetMode(WifiMode::ApStation)));
        assert_eq!(fx.http.restarts.lock().unwrap().as_slice(), &[true]);
    }

    #[test]
    fn test_stop_ap_race_guard_when_disconnected() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartAp);
        fx.manager.dispatch(Message::ApStarted);

        let restarts_before = fx.http.restarts.lock().unwrap().len();
        // The timer fired after a fresh disconnect: the AP must stay up.
        fx.manager.dispatch(Message::StopAp);
        assert!(!fx
            .radio
            .calls()
            .contains(&RadioCall::SetMode(WifiMode::Station)));
        assert_eq!(fx.http.restarts.lock().unwrap().len(), restarts_before);
    }

    #[test]
    fn test_stop_ap_while_connected_returns_to_station() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::StartAp);
        fx.manager.dispatch(Message::ApStarted);
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));

        fx.manager.dispatch(Message::StopAp);
        assert!(fx
            .radio
            .calls()
            .contains(&RadioCall::SetMode(WifiMode::Station)));
        assert_eq!(fx.http.restarts.lock().unwrap().last(), Some(&false));
    }

    // ==================== Load and restore ====================

    #[test]
    fn test_first_boot_starts_ap() {
        let mut fx = fixture(quiet_config());
        fx.manager.dispatch(Message::LoadAndRestore);
        assert_eq!(fx.manager.rx.try_recv(), Some(Message::StartAp));
    }

    #[test]
    fn test_restore_issues_connect_with_restore_cause() {
        let fx_store = store::shared(MemoryStore::new());
        {
            let mut store = fx_store.lock().unwrap();
            store::save_config(store.as_mut(), &creds("Saved"), &ApSettings::default())
                .unwrap();
        }
        let radio = FakeRadio::default();
        let mut manager = ConnectionManager::new(
            Box::new(radio.clone()),
            Box::new(FakeHttp::default()),
            fx_store,
            Arc::new(StatusBuffers::new()),
            quiet_config(),
        );

        manager.dispatch(Message::LoadAndRestore);
        let queued = manager.rx.try_recv();
        assert_eq!(
            queued,
            Some(Message::Connect {
                cause: ConnectCause::Restore,
                credentials: None,
            })
        );
        manager.dispatch(queued.unwrap());
        drain(&mut manager);
        assert!(radio
            .calls()
            .contains(&RadioCall::ApplyStationConfig("Saved".into())));
    }

    // ==================== Callbacks ====================

    #[test]
    fn test_callback_runs_after_handling() {
        let mut fx = fixture(quiet_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        fx.manager
            .register_callback(
                MessageCode::ScanDone,
                Box::new(move |msg| {
                    seen2.lock().unwrap().push(msg.clone());
                }),
            )
            .unwrap();

        fx.manager.dispatch(Message::StartScan);
        fx.manager.dispatch(Message::ScanDone { success: true });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[Message::ScanDone { success: true }]);
        // Handling happened first: the scan bit was already cleared when
        // the callback observed the message.
        assert!(!fx.manager.scan_in_progress);
    }

    #[test]
    fn test_duplicate_callback_rejected() {
        let mut fx = fixture(quiet_config());
        fx.manager
            .register_callback(MessageCode::GotIp, Box::new(|_| {}))
            .unwrap();
        let result = fx
            .manager
            .register_callback(MessageCode::GotIp, Box::new(|_| {}));
        assert!(matches!(
            result,
            Err(ManagerError::DuplicateCallback(MessageCode::GotIp))
        ));
    }

    #[test]
    fn test_stop_ap_race_guard_suppresses_callback() {
        let mut fx = fixture(quiet_config());
        let fired = Arc::new(Mutex::new(0));
        let fired2 = fired.clone();
        fx.manager
            .register_callback(
                MessageCode::StopAp,
                Box::new(move |_| {
                    *fired2.lock().unwrap() += 1;
                }),
            )
            .unwrap();

        // Guard trips: no callback.
        fx.manager.dispatch(Message::StopAp);
        assert_eq!(*fired.lock().unwrap(), 0);

        // Connected: callback fires.
        user_connect(&mut fx.manager, "Home");
        fx.manager.dispatch(Message::GotIp(lease()));
        fx.manager.dispatch(Message::StopAp);
        assert_eq!(*fired.lock().unwrap(), 1);
    }
}
