//! Hardware tests for the monochromator and the external filter wheel.
//!
//! These tests require the instruments connected to this machine.
//! Run with: cargo test --test hardware_instruments --features hardware_tests -- --ignored --nocapture
//!
//! Ports are taken from `SEQE_MONO_PORT` and `SEQE_WHEEL_PORT`
//! (e.g. `/dev/ttyUSB1`, `/dev/ttyUSB0`).
#![cfg(all(feature = "hardware_tests", feature = "instrument_serial"))]

use seqe_daq::config::Settings;
use seqe_daq::instrument::fw102c::Fw102c;
use seqe_daq::instrument::hrs300::Hrs300;
use seqe_daq::instrument::{FilterWheel, Monochromator};

fn port(var: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| panic!("set {var} to the serial port"))
}

#[tokio::test]
#[ignore] // Hardware-only test
async fn monochromator_moves_and_reports_position() {
    let settings = Settings::default();
    let mut mono = Hrs300::open(&port("SEQE_MONO_PORT"), &settings.monochromator).unwrap();
    assert!(mono.connect().await.unwrap(), "no HELLO acknowledgement");

    mono.set_scan_speed(500.0).await.unwrap();
    mono.goto_wavelength(550.0).await.unwrap();
    mono.select_grating(2).await.unwrap();
    assert_eq!(mono.query_grating().await.unwrap(), 2);
    mono.select_filter(3).await.unwrap();
    assert_eq!(mono.query_filter().await.unwrap(), 3);
    mono.select_filter(1).await.unwrap();
}

#[tokio::test]
#[ignore] // Hardware-only test
async fn filter_wheel_cycles_through_slots() {
    let settings = Settings::default();
    let mut wheel = Fw102c::open(&port("SEQE_WHEEL_PORT"), &settings.filter_wheel).unwrap();
    assert!(
        wheel.connect().await.unwrap(),
        "wheel must start in the open position"
    );

    for slot in 1..=settings.filter_wheel.slots {
        wheel.set_position(slot).await.unwrap();
        assert_eq!(wheel.position().await.unwrap(), slot);
    }
    wheel.set_position(1).await.unwrap();
}
