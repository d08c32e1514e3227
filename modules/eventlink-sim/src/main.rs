mod config;
mod device;

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use device::{Radio, SensorEvent, WriteError};
use eventlink_bridge::{CapabilityControl, Hub, RequestError};

fn readings(event: &SensorEvent) -> Option<i64> {
    match event {
        SensorEvent::Reading(value) => Some(*value),
        _ => None,
    }
}

fn write_completed(op: u32) -> impl Fn(&SensorEvent) -> Option<Result<(), WriteError>> + Send + Sync {
    move |event| match event {
        SensorEvent::WriteComplete { op: id, result } if *id == op => Some(result.clone()),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("eventlink=info".parse()?))
        .init();

    info!("Eventlink simulator starting...");

    let (bridge_config, sim) = config::load()?;
    bridge_config.log_summary();

    let (radio, task) = Radio::new();
    let control: Arc<dyn CapabilityControl<String>> = Arc::new(radio.clone());
    let hub = Arc::new(Hub::new(control, bridge_config));
    let driver = tokio::spawn(task.run(Arc::clone(&hub), sim.clone()));

    for device in &sim.devices {
        hub.attach(device.clone());
    }
    let first = sim.devices.first().context("No devices configured under [sim]")?;

    // Stream readings; notifications stay on only while the stream is open
    let mut stream = hub.stream(first, readings)?;
    let collected: Vec<i64> = (&mut stream).take(sim.readings).collect().await;
    info!(device = %first, ?collected, "Collected readings");
    stream.cancel();

    // One write per device; read-only devices answer with a failure
    for (op, device) in (1u32..).zip(sim.devices.iter()) {
        let sender = radio.clone();
        let target = device.clone();
        let outcome = hub
            .request(device, write_completed(op), move || sender.write(&target, op, 42))
            .await;
        match outcome {
            Ok(()) => info!(device = %device, op, "Write acknowledged"),
            Err(RequestError::Failed(err)) => warn!(device = %device, op, error = %err, "Write rejected"),
            Err(err) => warn!(device = %device, op, error = %err, "Write did not complete"),
        }
    }

    // A request left waiting when its device goes away
    let pending = hub.request(first, write_completed(0), || Ok(()));
    hub.detach(first);
    let outcome = pending.await;
    info!(device = %first, ?outcome, "Request on detached device");

    let disconnected = hub.shutdown();
    info!(listeners = disconnected, "Hub shut down");

    radio.stop();
    driver.await.context("Radio task panicked")?;

    info!("Simulation complete");
    Ok(())
}
