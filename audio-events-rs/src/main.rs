//! `audio-events` monitor.
//!
//! Prints the current endpoints and defaults, then every collection change
//! as it happens. Pass device IDs as arguments to also follow their volume.

use anyhow::Result;
use audio_events::logging;

fn main() -> Result<()> {
    logging::init_logging_from_env()?;
    run()
}

#[cfg(windows)]
fn run() -> Result<()> {
    use std::thread;
    use std::time::Duration;

    use anyhow::Context;
    use audio_events::{AudioBridge, BridgeConfig, DataFlow, DeviceState, Notification, Role};

    let bridge = AudioBridge::windows(BridgeConfig::default())
        .context("failed to open the Windows audio backend")?;
    let collection = bridge.collection().context("failed to open device collection")?;

    println!("Devices:");
    for device in collection.filter(DataFlow::All, DeviceState::ALL).iter() {
        println!(
            "  [{:?}] {} ({}) {}",
            device.dataflow, device.name, device.state, device.device_id
        );
    }
    for (label, flow) in [("output", DataFlow::Render), ("input", DataFlow::Capture)] {
        for role in Role::ALL {
            let name = collection
                .default_device(flow, role)
                .map(|d| d.name().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            println!("Default {} ({:?}): {}", label, role, name);
        }
    }

    for device_id in std::env::args().skip(1) {
        let events = bridge
            .observe(&device_id)
            .with_context(|| format!("failed to observe volume of {}", device_id))?;
        thread::spawn(move || loop {
            match events.next_timeout(Duration::from_millis(500)) {
                Ok(Some(Notification::Event(e))) => println!(
                    "volume {}: {:.2} mute={} channels={:?}",
                    e.device, e.volume, e.mute, e.channel_volumes
                ),
                Ok(Some(marker)) => println!("volume {}: {:?}", device_id, marker),
                Ok(None) if events.is_closed() => {
                    println!("volume {}: device removed", device_id);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    eprintln!("volume {}: {}", device_id, e);
                    break;
                }
            }
        });
    }

    let events = collection.events()?;
    println!("Watching for changes...");
    loop {
        match events.next_timeout(Duration::from_millis(500))? {
            Some(event) => println!("{:?}", event),
            None if events.is_closed() => break,
            None => {}
        }
    }
    Ok(())
}

#[cfg(not(windows))]
fn run() -> Result<()> {
    anyhow::bail!("audio-events requires the Windows audio endpoint API")
}
