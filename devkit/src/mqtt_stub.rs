/*!
Mock health bus for tests without a broker

Records every published health event and can be told to fail, so probe
loops can be exercised against a broker outage.
*/

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::Arc;
use twin_common::bus::HealthPublisher;
use twin_common::models::health_topic;
use twin_common::{HealthEvent, HealthStatus};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Default)]
pub struct MockBus {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failing: Arc<Mutex<bool>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish returns an error.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Published messages decoded back into events.
    pub fn health_events(&self, prefix: &str) -> Vec<HealthEvent> {
        self.published_messages
            .lock()
            .iter()
            .filter_map(|m| HealthEvent::from_message(prefix, &m.topic, &m.payload).ok())
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

#[async_trait]
impl HealthPublisher for MockBus {
    async fn publish_event(&self, prefix: &str, event: &HealthEvent) -> Result<()> {
        if *self.failing.lock() {
            anyhow::bail!("mock broker unavailable");
        }
        let message = MockMessage {
            topic: event.topic(prefix),
            payload: serde_json::to_vec(&event.payload())?,
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        log::info!("[MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().push(message);
        Ok(())
    }
}

/// Builders for raw health messages, as a probe on the wire would send them.
pub struct HealthMessageBuilder;

impl HealthMessageBuilder {
    pub fn topic(prefix: &str, source: &str, target: &str) -> String {
        health_topic(prefix, source, target)
    }

    pub fn payload(status: HealthStatus, time: &str) -> Value {
        serde_json::json!({ "status": status.as_str(), "time": time })
    }

    pub fn now(status: HealthStatus) -> Value {
        Self::payload(status, &chrono::Utc::now().to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_bus_records_and_decodes() {
        let bus = MockBus::new();
        let ev = HealthEvent::new("sensor", "broker", HealthStatus::Down);
        bus.publish_event("health", &ev).await.unwrap();

        let messages = bus.find_messages_by_topic("health/sensor/broker");
        assert_eq!(messages.len(), 1);
        let payload: Option<Value> = bus.get_last_json_message("health/sensor/broker").unwrap();
        assert_eq!(payload.unwrap()["status"], "DOWN");
        assert_eq!(bus.health_events("health"), vec![ev]);
    }

    #[tokio::test]
    async fn test_failing_bus_rejects_publish() {
        let bus = MockBus::new();
        bus.set_failing(true);
        let ev = HealthEvent::new("sensor", "broker", HealthStatus::Up);
        assert!(bus.publish_event("health", &ev).await.is_err());
        assert!(bus.get_published_messages().is_empty());
    }

    #[test]
    fn test_message_builder_matches_wire_format() {
        let body = HealthMessageBuilder::payload(HealthStatus::Down, "2024-01-01T00:00:00");
        let raw = serde_json::to_vec(&body).unwrap();
        let topic = HealthMessageBuilder::topic("health", "sensor", "broker");
        let ev = HealthEvent::from_message("health", &topic, &raw).unwrap();
        assert_eq!(ev.status, HealthStatus::Down);
    }
}
