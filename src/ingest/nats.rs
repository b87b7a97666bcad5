// NATS-backed MessageBus. The wire client is async-nats; this adapter only
// pumps messages into the channel contract the ingest consumes, and keeps
// resubscribing if the subscription drops. The client itself reconnects to
// the server list on its own.

use anyhow::{Context, Result};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{BusMessage, MessageBus};

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to the configured server list. A short retry loop covers
    /// servers that are still coming up; a dead bus at startup is fatal,
    /// matching the rest of the startup taxonomy.
    pub async fn connect(servers: &[String]) -> Result<Self> {
        let addrs = servers.join(",");
        let mut attempts = 3u32;
        loop {
            match async_nats::connect(addrs.as_str()).await {
                Ok(client) => {
                    info!(servers = %addrs, "Connected to NATS");
                    return Ok(Self { client });
                }
                Err(e) if attempts > 1 => {
                    attempts -= 1;
                    warn!(error = %e, attempts_left = attempts, "NATS connect failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => {
                    return Err(e).context("Failed to connect to NATS");
                }
            }
        }
    }
}

impl MessageBus for NatsBus {
    fn subscribe(&self, subject: &str) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(1024);
        let client = self.client.clone();
        let subject = subject.to_string();

        tokio::spawn(async move {
            loop {
                match client.subscribe(subject.clone()).await {
                    Ok(mut subscription) => {
                        while let Some(message) = subscription.next().await {
                            let out = BusMessage {
                                subject: message.subject.to_string(),
                                payload: message.payload.to_vec(),
                            };
                            if tx.send(out).await.is_err() {
                                return;
                            }
                        }
                        warn!(subject = %subject, "NATS subscription ended, resubscribing");
                    }
                    Err(e) => {
                        warn!(subject = %subject, error = %e, "NATS subscribe failed, retrying");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        rx
    }

    fn publish(&self, subject: &str, payload: Vec<u8>) {
        let client = self.client.clone();
        let subject = subject.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.publish(subject.clone(), payload.into()).await {
                warn!(subject = %subject, error = %e, "NATS publish failed");
            }
        });
    }
}
