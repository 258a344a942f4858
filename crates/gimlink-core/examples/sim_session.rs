//! Drive the link engine against the simulated gimbal.
//!
//! Run with: cargo run --example sim_session

use std::thread;
use std::time::Duration;

use gimlink_core::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let sim = SimulatedGimbal::new();
    // Firmware 1.2.3, release-candidate channel
    sim.set_param(0, 1);
    sim.set_param(67, 2);
    sim.set_param(68, 0x43);

    let link = GimbalLink::new(LinkConfig::default());
    link.start(sim.channel()).expect("start link");

    // Wait for the peer to come up
    while !link.present() {
        thread::sleep(Duration::from_millis(50));
    }
    println!("connection: {:?}", link.connection_state());
    println!("identity:   {:?}", link.identity());

    let version = link.firmware_version().expect("firmware version");
    println!("firmware:   {}", version);

    let result = link.set_follow_mode_sync().expect("follow mode");
    println!("follow:     {:?}", result);

    let result = link
        .set_rotation_sync(10.0, 0.0, -5.0, RotationMode::RelativeAngle)
        .expect("rotation");
    println!("rotation:   {:?}", result);

    thread::sleep(Duration::from_millis(500));
    println!("attitude:   {:?}", link.attitude());
    println!("status:     {:?}", link.status());
    println!("rates:      {:?}", link.message_rates());
    println!(
        "writes: {} (heartbeats {})",
        link.write_count(),
        link.heartbeat_write_count()
    );

    link.stop();
}
