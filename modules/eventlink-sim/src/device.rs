//! A fake radio: devices that emit readings while notifications are on and
//! answer writes after a short delay. The hub holds only the command sender;
//! the task that owns the hub holds the receiver, so neither keeps the other
//! alive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use eventlink_bridge::{CapabilityControl, Hub};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SimConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Reading(i64),
    WriteComplete { op: u32, result: Result<(), WriteError> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("device {0} is read-only")]
    ReadOnly(String),
    #[error("radio is offline")]
    Offline,
}

#[derive(Debug)]
enum Command {
    Notify { device: String, enabled: bool },
    Write { device: String, op: u32, value: i64 },
    Stop,
}

/// The command side of the radio, handed to the hub as its capability
/// control and to request senders.
#[derive(Clone)]
pub struct Radio {
    commands: mpsc::UnboundedSender<Command>,
}

impl Radio {
    pub fn new() -> (Self, RadioTask) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (Self { commands }, RadioTask { receiver })
    }

    pub fn write(&self, device: &str, op: u32, value: i64) -> Result<(), WriteError> {
        self.commands
            .send(Command::Write {
                device: device.to_string(),
                op,
                value,
            })
            .map_err(|_| WriteError::Offline)
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

impl CapabilityControl<String> for Radio {
    fn set_capability(&self, key: &String, enabled: bool) {
        let command = Command::Notify {
            device: key.clone(),
            enabled,
        };
        if self.commands.send(command).is_err() {
            warn!(device = %key, enabled, "Radio offline, capability command dropped");
        }
    }
}

pub struct RadioTask {
    receiver: mpsc::UnboundedReceiver<Command>,
}

impl RadioTask {
    /// Drive the devices until [`Radio::stop`] or every sender is gone.
    pub async fn run(mut self, hub: Arc<Hub<String, SensorEvent>>, config: SimConfig) {
        let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
        let mut notifying: HashSet<String> = HashSet::new();
        let mut readings: HashMap<String, i64> = HashMap::new();
        let read_only: HashSet<String> = config.read_only.iter().cloned().collect();
        let latency = Duration::from_millis(config.write_latency_ms);

        loop {
            tokio::select! {
                command = self.receiver.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Notify { device, enabled } => {
                            let changed = if enabled {
                                notifying.insert(device.clone())
                            } else {
                                notifying.remove(&device)
                            };
                            if changed {
                                info!(device = %device, enabled, "Notifications toggled");
                            }
                            hub.capability_changed(&device, enabled, None);
                        }
                        Command::Write { device, op, value } => {
                            let result = if read_only.contains(&device) {
                                Err(WriteError::ReadOnly(device.clone()))
                            } else {
                                Ok(())
                            };
                            debug!(device = %device, op, value, "Write queued");
                            let hub = Arc::clone(&hub);
                            tokio::spawn(async move {
                                tokio::time::sleep(latency).await;
                                hub.receive(&device, &SensorEvent::WriteComplete { op, result });
                            });
                        }
                        Command::Stop => break,
                    }
                }
                _ = ticker.tick() => {
                    for device in &notifying {
                        let next = readings.entry(device.clone()).or_insert(0);
                        *next += 1;
                        hub.receive(device, &SensorEvent::Reading(*next));
                    }
                }
            }
        }

        info!("Radio stopped");
    }
}
