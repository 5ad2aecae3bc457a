/*!
# DevKit systemctl-mqtt - Stubs et Utilitaires de Test

Bibliothèque facilitant les tests du bridge sans broker MQTT réel:
- Stub MQTT enregistrant publications et abonnements
- Harness de test avec assertions sur les topics échangés
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::MockMqttClient;
pub use test_utils::TestHarness;
