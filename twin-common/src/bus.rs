//! MQTT helpers shared by the publishers and the coordinator's listener

use crate::config::MqttConf;
use crate::models::HealthEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub fn mqtt_options(conf: &MqttConf, host: &str, client_id: &str) -> MqttOptions {
    let mut opts = MqttOptions::new(client_id, host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keepalive_seconds.max(5)));
    opts.set_clean_session(true);
    if let (Some(user), Some(pass)) = (&conf.user, &conf.password) {
        opts.set_credentials(user, pass);
    }
    opts
}

#[async_trait]
pub trait HealthPublisher: Send + Sync {
    async fn publish_event(&self, prefix: &str, event: &HealthEvent) -> Result<()>;
}

/// Publisher with its event loop driven on a background task.
pub struct MqttHealthPublisher {
    client: AsyncClient,
    driver: JoinHandle<()>,
}

impl MqttHealthPublisher {
    pub fn connect(opts: MqttOptions) -> Self {
        let broker = format!("{}:{}", opts.broker_address().0, opts.broker_address().1);
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => info!(%broker, "mqtt connected"),
                    Ok(_) => {}
                    Err(e) => {
                        error!(%broker, error = %e, "mqtt connection error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
        Self { client, driver }
    }

    pub async fn disconnect(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "mqtt disconnect");
        }
        // let the driver flush the DISCONNECT packet
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.driver.abort();
    }
}

#[async_trait]
impl HealthPublisher for MqttHealthPublisher {
    async fn publish_event(&self, prefix: &str, event: &HealthEvent) -> Result<()> {
        let topic = event.topic(prefix);
        let payload = serde_json::to_vec(&event.payload()).context("Failed to encode health payload")?;
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .with_context(|| format!("Failed to publish on {topic}"))?;
        Ok(())
    }
}
