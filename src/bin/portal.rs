//! Provisioning portal firmware binary.
//!
//! Brings up the connection manager with the esp-idf radio and NVS store,
//! then idles; the manager thread owns everything from there.

#[cfg(feature = "esp32")]
fn main() {
    // Link ESP-IDF patches (must be first!)
    esp_idf_sys::link_patches();

    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::wifi::EspWifi;
    use std::sync::Arc;
    use std::time::Duration;
    use wifi_provision_esp32::platform::{
        forward_radio_events, EspPortalHttp, EspRadio, NvsStore,
    };
    use wifi_provision_esp32::{ConnectionManager, ManagerConfig, StatusBuffers};

    esp_idf_svc::log::EspLogger::initialize_default();
    log::info!("provisioning portal starting");

    let peripherals = Peripherals::take().expect("peripherals already taken");
    let sysloop = EspSystemEventLoop::take().expect("event loop unavailable");
    let wifi = EspWifi::new(peripherals.modem, sysloop.clone(), None)
        .expect("wifi driver init failed");

    let store = wifi_provision_esp32::store::shared(
        NvsStore::new().expect("NVS partition unavailable"),
    );
    let status = Arc::new(StatusBuffers::new());

    let manager = ConnectionManager::new(
        Box::new(EspRadio::new(wifi)),
        Box::new(EspPortalHttp::new()),
        store,
        status,
        ManagerConfig::default(),
    );
    let handle = manager.start().expect("manager thread failed to start");

    let _subscriptions =
        forward_radio_events(&sysloop, handle).expect("event subscription failed");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

#[cfg(not(feature = "esp32"))]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("this binary requires the 'esp32' feature; use 'cargo test' for host testing");
}
