//! Bridge supervisor
//!
//! Owns every long-lived resource: the system-bus connection, the logind and
//! systemd proxies, the shutdown inhibitor, the MQTT session and the unit
//! monitors. A single select loop serialises all work, so inbound MQTT
//! handlers never run concurrently and the on-connect announcement sequence
//! (birth, subscriptions, discovery) is strictly ordered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use rumqttc::QoS;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::actions::{Action, ActionRegistry};
use crate::config::Settings;
use crate::dbus::login_manager::{self, LoginManagerProxy, ShutdownLock};
use crate::dbus::service_manager::{self, ServiceManagerProxy};
use crate::dbus::system_bus;
use crate::homeassistant;
use crate::monitor::{self, PublishGuard, UnitState};
use crate::mqtt::{self, encode_bool, InboundMessage, MqttPublisher, SessionEvent};

const SESSION_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 64;

/// Run the bridge until a termination signal arrives or a fatal error occurs.
pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let connection = system_bus()
        .await
        .context("failed to connect to the system D-Bus")?;
    let login = LoginManagerProxy::new(&connection)
        .await
        .context("failed to create login manager proxy")?;
    let service = ServiceManagerProxy::new(&connection)
        .await
        .context("failed to create service manager proxy")?;

    let mut shutdown_lock = ShutdownLock::new(login.clone());
    if let Err(e) = shutdown_lock.acquire().await {
        warn!("{e:#}; continuing without shutdown inhibitor");
    }
    let mut prepare_for_shutdown = login
        .receive_prepare_for_shutdown()
        .await
        .context("failed to subscribe to the PrepareForShutdown signal")?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (session_tx, mut session_events) = mpsc::channel(CHANNEL_CAPACITY);
    let (client, session_task) = mqtt::spawn_session(settings.clone(), session_tx, cancel_rx.clone());

    let registry = ActionRegistry::new(&settings);
    // Keep one sender here so the channel stays open with zero monitors.
    let (state_tx, mut unit_states) = mpsc::channel(CHANNEL_CAPACITY);
    for unit in &settings.monitored_units {
        tokio::spawn(monitor::watch_unit(
            connection.clone(),
            unit.clone(),
            state_tx.clone(),
            cancel_rx.clone(),
        ));
    }

    let mut guard = PublishGuard::new();
    let mut last_known: HashMap<String, String> = HashMap::new();
    let mut session_up = false;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    loop {
        tokio::select! {
            event = session_events.recv() => match event {
                None => anyhow::bail!("MQTT session task stopped unexpectedly"),
                Some(SessionEvent::Connected) => {
                    session_up = true;
                    guard.reset();
                    let preparing = match login.preparing_for_shutdown().await {
                        Ok(active) => Some(active),
                        Err(e) => {
                            error!("failed to read logind's PreparingForShutdown property: {e}");
                            None
                        }
                    };
                    announce(&client, &settings, &registry, preparing).await?;
                    for (unit, active_state) in last_known.clone() {
                        publish_unit_state(&client, &settings, &mut guard, &unit, &active_state).await;
                    }
                }
                Some(SessionEvent::Message(message)) => {
                    handle_message(&message, &registry, &login, &service, &settings).await;
                }
            },
            state = unit_states.recv() => {
                if let Some(UnitState { unit, active_state }) = state {
                    last_known.insert(unit.clone(), active_state.clone());
                    if session_up {
                        publish_unit_state(&client, &settings, &mut guard, &unit, &active_state).await;
                    }
                }
            },
            received = prepare_for_shutdown.next() => match received {
                Some(received) => match received.args() {
                    Ok(args) => {
                        let active = *args.start();
                        if let Err(e) = publish_preparing_for_shutdown(&client, &settings, active).await {
                            warn!("{e:#}");
                        }
                        if active {
                            // Let the pending shutdown proceed promptly.
                            shutdown_lock.release();
                        } else if !shutdown_lock.held() {
                            // Shutdown was cancelled; a fresh lock covers the
                            // next sequence.
                            if let Err(e) = shutdown_lock.acquire().await {
                                error!("{e:#}");
                            }
                        }
                    }
                    Err(e) => warn!("failed to decode PrepareForShutdown signal: {e}"),
                },
                None => anyhow::bail!("lost the PrepareForShutdown signal stream; D-Bus connection closed?"),
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    // Draining is best-effort: the status topic goes offline first, then the
    // discovery document is retracted, then the session closes.
    if session_up {
        if let Err(e) = retire(&client, &settings).await {
            warn!("failed to publish offline announcement: {e:#}");
        }
    }
    if let Err(e) = client.disconnect().await {
        debug!("failed to send MQTT disconnect: {e}");
    }
    let _ = cancel_tx.send(true);
    if tokio::time::timeout(SESSION_SHUTDOWN_GRACE, session_task)
        .await
        .is_err()
    {
        warn!("MQTT session task did not stop in time");
    }
    shutdown_lock.release();
    Ok(())
}

/// On-connect announcement: retained birth before anything else, then the
/// subscription set, then the discovery document, then the current
/// preparing-for-shutdown state when it could be read.
pub async fn announce<P: MqttPublisher>(
    client: &P,
    settings: &Settings,
    registry: &ActionRegistry,
    preparing_for_shutdown: Option<bool>,
) -> Result<()> {
    client
        .publish(&settings.status_topic(), QoS::AtLeastOnce, true, b"online".to_vec())
        .await
        .context("failed to publish birth message")?;
    for topic in registry.topics() {
        info!("subscribing to {topic}");
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    let discovery_topic = homeassistant::discovery_topic(settings);
    let config = homeassistant::device_config(settings);
    let payload = serde_json::to_vec(&config).context("failed to encode discovery config")?;
    debug!("publishing home assistant config on {discovery_topic}");
    client
        .publish(&discovery_topic, QoS::AtMostOnce, false, payload)
        .await
        .context("failed to publish discovery config")?;
    if let Some(active) = preparing_for_shutdown {
        publish_preparing_for_shutdown(client, settings, active).await?;
    }
    Ok(())
}

/// Orderly shutdown announcement: retained offline status, then the empty
/// payload retracting the discovery document.
pub async fn retire<P: MqttPublisher>(client: &P, settings: &Settings) -> Result<()> {
    client
        .publish(&settings.status_topic(), QoS::AtLeastOnce, true, b"offline".to_vec())
        .await
        .context("failed to publish offline status")?;
    client
        .publish(
            &homeassistant::discovery_topic(settings),
            QoS::AtMostOnce,
            false,
            Vec::new(),
        )
        .await
        .context("failed to retract discovery config")?;
    Ok(())
}

pub async fn publish_preparing_for_shutdown<P: MqttPublisher>(
    client: &P,
    settings: &Settings,
    active: bool,
) -> Result<()> {
    let topic = settings.preparing_for_shutdown_topic();
    let payload = encode_bool(active);
    info!("publishing {payload:?} on {topic}");
    client
        .publish(&topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
        .await
        .context("failed to publish preparing-for-shutdown")
}

async fn publish_unit_state<P: MqttPublisher>(
    client: &P,
    settings: &Settings,
    guard: &mut PublishGuard,
    unit: &str,
    active_state: &str,
) {
    if !guard.should_publish(unit, active_state) {
        return;
    }
    let topic = settings.unit_active_state_topic(unit);
    debug!("publishing {active_state:?} on {topic}");
    match client
        .publish(&topic, QoS::AtLeastOnce, true, active_state.as_bytes().to_vec())
        .await
    {
        Ok(()) => guard.record(unit, active_state),
        Err(e) => warn!("failed to publish ActiveState of {unit}: {e:#}"),
    }
}

async fn handle_message(
    message: &InboundMessage,
    registry: &ActionRegistry,
    login: &LoginManagerProxy<'_>,
    service: &ServiceManagerProxy<'_>,
    settings: &Settings,
) {
    if message.retain {
        info!("ignoring retained message on topic {}", message.topic);
        return;
    }
    let Some(action) = registry.get(&message.topic) else {
        warn!("unexpected topic {}", message.topic);
        return;
    };
    debug!("received message on topic {}, triggering {action}", message.topic);
    match action {
        Action::SchedulePoweroff => {
            login_manager::schedule_poweroff(login, settings.poweroff_delay).await;
        }
        Action::Suspend => login_manager::suspend(login).await,
        Action::LockAllSessions => login_manager::lock_all_sessions(login).await,
        Action::StartUnit(unit) => service_manager::start_unit(service, unit).await,
        Action::StopUnit(unit) => service_manager::stop_unit(service, unit).await,
        Action::RestartUnit(unit) => service_manager::restart_unit(service, unit).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devkit::MockMqttClient;

    fn settings() -> Settings {
        Settings {
            mqtt_host: "mqtt-broker.local".to_string(),
            mqtt_port: 8883,
            mqtt_disable_tls: false,
            mqtt_username: None,
            mqtt_password: None,
            discovery_prefix: "homeassistant".to_string(),
            discovery_object_id: "h1".to_string(),
            poweroff_delay: Duration::from_secs(4),
            monitored_units: vec!["ssh.service".to_string()],
            controlled_units: vec!["foo.service".to_string()],
            hostname: "h1".to_string(),
        }
    }

    #[tokio::test]
    async fn announce_publishes_birth_before_anything_else() {
        let client = MockMqttClient::new();
        let settings = settings();
        let registry = ActionRegistry::new(&settings);

        announce(&client, &settings, &registry, Some(false)).await.unwrap();

        let published = client.get_published_messages();
        assert_eq!(published[0].topic, "systemctl/h1/status");
        assert_eq!(published[0].payload, b"online");
        assert!(published[0].retain);

        assert_eq!(published[1].topic, "homeassistant/device/h1/config");
        assert!(!published[1].retain);
        let config: serde_json::Value = serde_json::from_slice(&published[1].payload).unwrap();
        assert_eq!(config["device"]["name"], "h1");

        assert_eq!(published[2].topic, "systemctl/h1/preparing-for-shutdown");
        assert_eq!(published[2].payload, b"false");
        assert!(!published[2].retain);
        assert_eq!(published.len(), 3);

        let subscriptions = client.get_subscriptions();
        assert_eq!(subscriptions.len(), registry.len());
        assert!(subscriptions.contains(&"systemctl/h1/poweroff".to_string()));
        assert!(subscriptions.contains(&"systemctl/h1/unit/system/foo.service/restart".to_string()));
    }

    #[tokio::test]
    async fn announce_without_shutdown_state_skips_the_topic() {
        let client = MockMqttClient::new();
        let settings = settings();
        let registry = ActionRegistry::new(&settings);

        announce(&client, &settings, &registry, None).await.unwrap();

        assert!(client
            .find_messages_by_topic("systemctl/h1/preparing-for-shutdown")
            .is_empty());
    }

    #[tokio::test]
    async fn retire_publishes_offline_then_retracts_discovery() {
        let client = MockMqttClient::new();
        let settings = settings();

        retire(&client, &settings).await.unwrap();

        let published = client.get_published_messages();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "systemctl/h1/status");
        assert_eq!(published[0].payload, b"offline");
        assert!(published[0].retain);
        assert_eq!(published[1].topic, "homeassistant/device/h1/config");
        assert!(published[1].payload.is_empty());
        assert!(!published[1].retain);
    }

    #[tokio::test]
    async fn unit_state_publishes_are_deduplicated() {
        let client = MockMqttClient::new();
        let settings = settings();
        let mut guard = PublishGuard::new();

        for state in ["activating", "active", "active", "failed"] {
            publish_unit_state(&client, &settings, &mut guard, "ssh.service", state).await;
        }

        let published =
            client.find_messages_by_topic("systemctl/h1/unit/system/ssh.service/active-state");
        let payloads: Vec<_> = published.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(payloads, vec![b"activating".to_vec(), b"active".to_vec(), b"failed".to_vec()]);
        assert!(published.iter().all(|m| m.retain));
    }

    #[tokio::test]
    async fn reconnect_reemits_unit_state_after_guard_reset() {
        let client = MockMqttClient::new();
        let settings = settings();
        let mut guard = PublishGuard::new();

        publish_unit_state(&client, &settings, &mut guard, "ssh.service", "active").await;
        publish_unit_state(&client, &settings, &mut guard, "ssh.service", "active").await;
        guard.reset();
        publish_unit_state(&client, &settings, &mut guard, "ssh.service", "active").await;

        let published =
            client.find_messages_by_topic("systemctl/h1/unit/system/ssh.service/active-state");
        assert_eq!(published.len(), 2);
    }

    #[tokio::test]
    async fn discovery_document_is_inspectable_through_the_harness() {
        let mut harness = devkit::TestHarness::new("h1");
        let settings = settings();
        let registry = ActionRegistry::new(&settings);

        announce(&harness.mqtt_client, &settings, &registry, None).await.unwrap();

        harness
            .assert_field_equals(
                &harness.discovery_topic(),
                "device.name",
                &serde_json::json!("h1"),
            )
            .unwrap();
        harness
            .assert_field_equals(
                &harness.discovery_topic(),
                "availability",
                &serde_json::json!([{
                    "topic": "systemctl/h1/status",
                    "payload_available": "online",
                    "payload_not_available": "offline",
                }]),
            )
            .unwrap();
        harness.expect_messages(&harness.status_topic(), 1);
        harness.verify_expectations().unwrap();
    }

    #[tokio::test]
    async fn preparing_for_shutdown_is_not_retained() {
        let client = MockMqttClient::new();
        let settings = settings();

        publish_preparing_for_shutdown(&client, &settings, true).await.unwrap();

        let published = client.find_messages_by_topic("systemctl/h1/preparing-for-shutdown");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, b"true");
        assert!(!published[0].retain);
        assert_eq!(published[0].qos, QoS::AtLeastOnce);
    }
}
