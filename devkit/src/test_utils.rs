/*!
Test Harness pour le bridge systemctl-mqtt

Facilite l'écriture de tests avec:
- Setup automatique du mock MQTT
- Construction des topics du bridge pour un hostname donné
- Assertions sur les messages publiés
*/

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use crate::mqtt_stub::MockMqttClient;

/// Harness de test complet pour le bridge
pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    hostname: String,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    /// Crée un nouveau harness pour un hostname donné
    pub fn new<S: Into<String>>(hostname: S) -> Self {
        env_logger::try_init().ok(); // init logging pour tests
        Self {
            mqtt_client: MockMqttClient::new(),
            hostname: hostname.into(),
            expectations: Vec::new(),
        }
    }

    /// Topic complet sous le préfixe du bridge: `systemctl/<hostname>/<suffix>`
    pub fn topic(&self, suffix: &str) -> String {
        format!("systemctl/{}/{}", self.hostname, suffix)
    }

    pub fn status_topic(&self) -> String {
        self.topic("status")
    }

    pub fn discovery_topic(&self) -> String {
        format!("homeassistant/device/{}/config", self.hostname)
    }

    /// Simule une commande entrante (payload ignoré par le bridge)
    pub fn send_command(&self, suffix: &str) -> Result<()> {
        self.mqtt_client.simulate_incoming(self.topic(suffix), b"1".to_vec())
    }

    /// Ajoute une expectation: N messages attendus sur un topic
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Vérifie toutes les expectations configurées
    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();
            if actual != expectation.expected_count {
                anyhow::bail!(
                    "expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual
                );
            }
        }
        Ok(())
    }

    /// Attend qu'un message soit publié sur un topic
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Option<Vec<u8>> {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(msg) = self.mqtt_client.find_messages_by_topic(topic).last() {
                return Some(msg.payload.clone());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Assert qu'un champ JSON du dernier message a une valeur donnée
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.mqtt_client.get_last_json_message::<Value>(topic)? else {
            anyhow::bail!("no message on topic {topic}");
        };
        let Some(actual) = get_nested_field(&msg, field_path) else {
            anyhow::bail!("field '{field_path}' not found in latest message on {topic}");
        };
        if actual != expected {
            anyhow::bail!("field '{field_path}' mismatch: expected {expected:?}, got {actual:?}");
        }
        Ok(())
    }

    /// Stats sur les messages collectés
    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.mqtt_client.get_subscriptions(),
        }
    }

    /// Reset le harness pour un nouveau test
    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.expectations.clear();
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::QoS;
    use systemctl_mqtt::mqtt::MqttPublisher;

    #[tokio::test]
    async fn test_harness_topics_and_expectations() {
        let mut harness = TestHarness::new("h1");
        assert_eq!(harness.topic("poweroff"), "systemctl/h1/poweroff");
        assert_eq!(harness.status_topic(), "systemctl/h1/status");
        assert_eq!(harness.discovery_topic(), "homeassistant/device/h1/config");

        harness.expect_messages("systemctl/h1/status", 1);
        harness
            .mqtt_client
            .publish("systemctl/h1/status", QoS::AtLeastOnce, true, b"online".to_vec())
            .await
            .unwrap();
        harness.verify_expectations().unwrap();

        let stats = harness.get_stats();
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.topic_counts["systemctl/h1/status"], 1);
    }

    #[tokio::test]
    async fn test_assert_field_equals_on_json_payload() {
        let harness = TestHarness::new("h1");
        let config = serde_json::json!({"device": {"name": "h1"}});
        harness
            .mqtt_client
            .publish(
                "homeassistant/device/h1/config",
                QoS::AtMostOnce,
                false,
                serde_json::to_vec(&config).unwrap(),
            )
            .await
            .unwrap();

        harness
            .assert_field_equals(
                "homeassistant/device/h1/config",
                "device.name",
                &serde_json::json!("h1"),
            )
            .unwrap();
        assert!(harness
            .assert_field_equals(
                "homeassistant/device/h1/config",
                "device.missing",
                &serde_json::json!("x"),
            )
            .is_err());
    }
}
