//! MQTT session
//!
//! One background task owns the rumqttc event loop: it reports CONNACKs and
//! inbound publishes to the supervisor over a bounded channel and retries
//! lost connections forever with jittered exponential backoff. Publishing
//! goes through the [`MqttPublisher`] capability so components never touch
//! the session itself.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, Outgoing, QoS, Transport};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Settings;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(32);
const EVENT_CHANNEL_CAPACITY: usize = 64;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// `"true"` / `"false"`, the payload encoding shared by the
/// preparing-for-shutdown topic and the discovery document.
pub fn encode_bool(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Narrow publish/subscribe capability handed to the supervisor.
///
/// Implemented by the live [`AsyncClient`] and by `devkit::MockMqttClient`
/// for broker-less tests.
#[async_trait]
pub trait MqttPublisher: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
}

#[async_trait]
impl MqttPublisher for AsyncClient {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        AsyncClient::publish(self, topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        AsyncClient::subscribe(self, topic, qos).await?;
        Ok(())
    }
}

/// What the session task reports to the supervisor.
#[derive(Debug)]
pub enum SessionEvent {
    /// CONNACK received; birth, subscriptions and discovery must be replayed.
    Connected,
    Message(InboundMessage),
}

#[derive(Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Exponential reconnect backoff: 1 s doubling to 32 s, ±20 % jitter.
pub(crate) struct Backoff {
    current: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self {
            current: BACKOFF_INITIAL,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = BACKOFF_INITIAL;
    }

    /// Next delay to sleep before another connect attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(BACKOFF_MAX);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(jitter)
    }
}

/// Connection options per the session contract: clean session, 60 s
/// keepalive, TLS with hostname verification unless disabled, retained
/// `offline` last will on the status topic.
pub fn session_options(settings: &Settings) -> MqttOptions {
    let mut options = MqttOptions::new(settings.client_id(), &settings.mqtt_host, settings.mqtt_port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    if !settings.mqtt_disable_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    if let Some(username) = &settings.mqtt_username {
        options.set_credentials(
            username.clone(),
            settings.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options.set_last_will(LastWill::new(
        settings.status_topic(),
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));
    options
}

/// Spawn the session task. The returned client is valid immediately;
/// publishes issued while disconnected are queued by rumqttc.
pub fn spawn_session(
    settings: Arc<Settings>,
    events: mpsc::Sender<SessionEvent>,
    cancel: watch::Receiver<bool>,
) -> (AsyncClient, JoinHandle<()>) {
    let options = session_options(&settings);
    let (client, eventloop) = AsyncClient::new(options, EVENT_CHANNEL_CAPACITY);
    info!(
        "connecting to MQTT broker {}:{} (TLS {})",
        settings.mqtt_host,
        settings.mqtt_port,
        if settings.mqtt_disable_tls {
            "disabled"
        } else {
            "enabled"
        }
    );
    let handle = tokio::spawn(session_loop(settings, eventloop, events, cancel));
    (client, handle)
}

async fn session_loop(
    settings: Arc<Settings>,
    mut eventloop: rumqttc::EventLoop,
    events: mpsc::Sender<SessionEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();
    let mut connected = false;
    loop {
        if *cancel.borrow() {
            drain(&mut eventloop).await;
            break;
        }
        let polled = if connected {
            tokio::select! {
                result = eventloop.poll() => Some(result),
                _ = cancel.changed() => None,
            }
        } else {
            tokio::select! {
                result = tokio::time::timeout(CONNECT_TIMEOUT, eventloop.poll()) => match result {
                    Ok(inner) => Some(inner),
                    Err(_) => {
                        warn!("MQTT connect attempt timed out after {CONNECT_TIMEOUT:?}");
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.changed() => {}
                        }
                        continue;
                    }
                },
                _ = cancel.changed() => None,
            }
        };
        match polled {
            None => {
                drain(&mut eventloop).await;
                break;
            }
            Some(Ok(Event::Incoming(Incoming::ConnAck(_)))) => {
                debug!(
                    "connected to MQTT broker {}:{}",
                    settings.mqtt_host, settings.mqtt_port
                );
                connected = true;
                backoff.reset();
                if events.send(SessionEvent::Connected).await.is_err() {
                    break;
                }
            }
            Some(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                };
                if events.send(SessionEvent::Message(message)).await.is_err() {
                    break;
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                if connected {
                    error!("MQTT connection lost: {e}");
                } else {
                    warn!("MQTT connect failed: {e}");
                }
                connected = false;
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => {}
                }
            }
        }
    }
    debug!("MQTT session task stopped");
}

/// Requests issued through the client (the offline status, the discovery
/// retraction, DISCONNECT) only reach the wire when the event loop polls.
/// Keep polling until the DISCONNECT frame has been written, so cancellation
/// cannot drop the draining publishes still sitting in the request channel.
async fn drain(eventloop: &mut rumqttc::EventLoop) {
    let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("MQTT connection closed while draining: {e}");
                    break;
                }
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("timed out draining MQTT session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_encoding() {
        assert_eq!(encode_bool(true), "true");
        assert_eq!(encode_bool(false), "false");
    }

    #[test]
    fn backoff_doubles_to_cap_with_bounded_jitter() {
        let mut backoff = Backoff::new();
        for expected_secs in [1.0_f64, 2.0, 4.0, 8.0, 16.0, 32.0, 32.0, 32.0] {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(
                delay >= expected_secs * 0.8 - 1e-9 && delay <= expected_secs * 1.2 + 1e-9,
                "delay {delay} outside jitter window around {expected_secs}"
            );
        }
    }

    #[test]
    fn backoff_reset_restarts_at_one_second() {
        let mut backoff = Backoff::new();
        for _ in 0..4 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay().as_secs_f64();
        assert!((0.8..=1.2).contains(&delay));
    }
}
