/*!
Mock MQTT Client pour développement sans broker

Implémente la même capacité publish/subscribe que la session réelle du
bridge. Enregistre tous les messages publiés et permet de simuler la
réception de commandes.
*/

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;

use systemctl_mqtt::mqtt::MqttPublisher;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock compatible avec la session MQTT du bridge
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration d'un channel pour recevoir les messages simulés
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Simule la réception d'un message entrant (pour tests)
    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        if let Some(sender) = self.message_sender.lock().unwrap().as_ref() {
            sender
                .send(message.clone())
                .map_err(|e| anyhow::anyhow!("send error: {e}"))?;
        }
        log::info!("📨 [MOCK] Simulated incoming: {}", message.topic);
        Ok(())
    }

    /// Récupère tous les messages publiés, dans l'ordre (pour assertions)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Récupère les abonnements (pour assertions)
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Trouve les messages publiés sur un topic donné
    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Reset tous les messages enregistrés
    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

#[async_trait]
impl MqttPublisher for MockMqttClient {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        let message = MockMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        };
        log::info!(
            "📤 [MOCK] Published to {}: {} bytes",
            message.topic,
            message.payload.len()
        );
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        log::info!("📥 [MOCK] Subscribed to {topic}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_client_publish_subscribe() {
        let client = MockMqttClient::new();

        client
            .subscribe("systemctl/h1/poweroff", QoS::AtLeastOnce)
            .await
            .unwrap();
        assert_eq!(client.get_subscriptions(), vec!["systemctl/h1/poweroff"]);

        client
            .publish("systemctl/h1/status", QoS::AtLeastOnce, true, b"online".to_vec())
            .await
            .unwrap();

        let messages = client.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "systemctl/h1/status");
        assert_eq!(messages[0].payload, b"online");
        assert!(messages[0].retain);
    }

    #[tokio::test]
    async fn test_json_message_parsing() {
        let client = MockMqttClient::new();

        let config = serde_json::json!({
            "device": { "identifiers": ["h1"], "name": "h1" }
        });
        client
            .publish(
                "homeassistant/device/h1/config",
                QoS::AtMostOnce,
                false,
                serde_json::to_vec(&config).unwrap(),
            )
            .await
            .unwrap();

        let parsed: Option<serde_json::Value> = client
            .get_last_json_message("homeassistant/device/h1/config")
            .unwrap();
        assert_eq!(parsed.unwrap()["device"]["name"], "h1");
    }

    #[tokio::test]
    async fn test_simulated_incoming_reaches_receiver() {
        let client = MockMqttClient::new();
        let mut receiver = client.setup_receiver();

        client
            .simulate_incoming("systemctl/h1/poweroff", b"1".to_vec())
            .unwrap();

        let message = receiver.recv().await.unwrap();
        assert_eq!(message.topic, "systemctl/h1/poweroff");
        assert_eq!(message.payload, b"1");
    }
}
