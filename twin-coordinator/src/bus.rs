// Bus listener: decodes health events and hands them to the coordinator

use crate::health::BusHealth;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};
use twin_common::models::health_filter;
use twin_common::HealthEvent;

/// Subscribe to `<prefix>/#` and forward every decodable event into `tx`.
/// The subscription is renewed on every CONNACK so broker restarts are survived.
pub fn spawn_bus_listener(
    opts: MqttOptions,
    prefix: String,
    tx: mpsc::Sender<HealthEvent>,
    health: BusHealth,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let filter = health_filter(&prefix);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = client.try_disconnect();
                    health.mark_disconnected();
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        health.mark_connected();
                        match client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                            Ok(()) => info!(%filter, "subscribed to health events"),
                            Err(e) => warn!(%filter, error = %e, "subscribe failed"),
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        match HealthEvent::from_message(&prefix, &p.topic, &p.payload) {
                            Ok(ev) => {
                                if tx.send(ev).await.is_err() {
                                    debug!("coordinator inbox closed");
                                    break;
                                }
                            }
                            Err(e) => debug!(topic = %p.topic, error = %e, "ignoring bus message"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error");
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
    })
}
