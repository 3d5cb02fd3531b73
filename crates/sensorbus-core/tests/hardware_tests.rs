//! Hardware integration tests for sensorbus-core
//!
//! These tests require actual BLE hardware and should be run with:
//! ```
//! cargo test --package sensorbus-core --test hardware_tests -- --ignored --nocapture
//! ```
//!
//! Configure the device via environment variable:
//! - `SENSORBUS_DEVICE`: address of a peripheral exposing the standard
//!   battery level characteristic
//!
//! Example:
//! ```
//! SENSORBUS_DEVICE="A0:E6:F8:00:11:22" cargo test --package sensorbus-core --test hardware_tests -- --ignored --nocapture
//! ```

use std::env;
use std::sync::Arc;
use std::time::Duration;

use sensorbus_core::{BleTransport, PollCharacteristic, Session, decode, register_device};
use sensorbus_types::uuids::{BATTERY_LEVEL, DEVICE_NAME};
use tokio::time::timeout;

/// Default timeout for BLE operations
const BLE_TIMEOUT: Duration = Duration::from_secs(30);

fn get_device() -> Option<String> {
    env::var("SENSORBUS_DEVICE").ok().filter(|s| !s.is_empty())
}

#[tokio::test]
#[ignore = "requires BLE hardware"]
async fn test_read_battery_level() {
    let Some(address) = get_device() else {
        println!("SENSORBUS_DEVICE not set, skipping");
        return;
    };

    let transport = BleTransport::new().await.expect("no Bluetooth adapter");
    let session = Session::new(Arc::new(transport));
    let battery = register_device(address.as_str(), PollCharacteristic::new(BATTERY_LEVEL), decode::u8);
    let name = register_device(address.as_str(), PollCharacteristic::new(DEVICE_NAME), decode::utf8);

    session.connect(&battery).unwrap();
    session.connect(&name).unwrap();
    session.start().unwrap();

    let level = timeout(BLE_TIMEOUT, session.read(&battery))
        .await
        .expect("read timed out")
        .expect("read failed");
    println!("Battery: {level}%");
    assert!(level <= 100);

    match timeout(BLE_TIMEOUT, session.read(&name)).await {
        Ok(Ok(name)) => println!("Name: {name}"),
        Ok(Err(e)) => println!("Name not readable: {e}"),
        Err(_) => println!("Name read timed out"),
    }

    session.shutdown().await;
    assert!(session.failure().is_none());
}
