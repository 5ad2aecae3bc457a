//! Per-unit ActiveState monitor
//!
//! One task per monitored unit: resolve the unit object, report the current
//! ActiveState, then forward every PropertiesChanged value to the
//! supervisor. The supervisor owns the per-session [`PublishGuard`] so a
//! value equal to the last one published on the current MQTT session is
//! suppressed, and everything is re-emitted after a reconnect.

use std::collections::HashMap;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{debug, error, warn};

use crate::dbus::service_manager::{ServiceManagerProxy, SystemdUnitProxy};
use crate::dbus::DBUS_CALL_TIMEOUT;

const UNIT_RESOLVE_RETRY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitState {
    pub unit: String,
    pub active_state: String,
}

/// Suppresses republication of an unchanged ActiveState within one MQTT
/// session. `record` only after the publish was handed to the session.
#[derive(Debug, Default)]
pub struct PublishGuard {
    last_published: HashMap<String, String>,
}

impl PublishGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_publish(&self, unit: &str, active_state: &str) -> bool {
        self.last_published.get(unit).map(String::as_str) != Some(active_state)
    }

    pub fn record(&mut self, unit: &str, active_state: &str) {
        self.last_published
            .insert(unit.to_string(), active_state.to_string());
    }

    /// Forget everything; called on reconnect so current states are
    /// re-emitted on the fresh session.
    pub fn reset(&mut self) {
        self.last_published.clear();
    }
}

/// Follow one unit until cancelled, sending state reports to the supervisor.
pub async fn watch_unit(
    connection: zbus::Connection,
    unit: String,
    events: mpsc::Sender<UnitState>,
    mut cancel: watch::Receiver<bool>,
) {
    let manager = match ServiceManagerProxy::new(&connection).await {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to create service manager proxy for {unit}: {e}");
            return;
        }
    };

    // GetUnit fails while the unit is not loaded; keep trying.
    let path = loop {
        if *cancel.borrow() {
            return;
        }
        match tokio::time::timeout(DBUS_CALL_TIMEOUT, manager.get_unit(&unit)).await {
            Ok(Ok(path)) => break path,
            Ok(Err(e)) => warn!("failed to resolve unit {unit}: {e}; retrying"),
            Err(_) => warn!("timed out resolving unit {unit}; retrying"),
        }
        tokio::select! {
            _ = tokio::time::sleep(UNIT_RESOLVE_RETRY) => {}
            _ = cancel.changed() => return,
        }
    };
    debug!("resolved unit {unit} at {}", path.as_str());

    let unit_proxy = match SystemdUnitProxy::builder(&connection).path(path) {
        Ok(builder) => match builder.build().await {
            Ok(proxy) => proxy,
            Err(e) => {
                error!("failed to create unit proxy for {unit}: {e}");
                return;
            }
        },
        Err(e) => {
            error!("invalid object path for unit {unit}: {e}");
            return;
        }
    };

    match unit_proxy.active_state().await {
        Ok(active_state) => {
            if send_state(&events, &unit, active_state).await.is_err() {
                return;
            }
        }
        Err(e) => warn!("failed to read ActiveState of {unit}: {e}"),
    }

    let mut changes = unit_proxy.receive_active_state_changed().await;
    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            change = changes.next() => match change {
                Some(change) => match change.get().await {
                    Ok(active_state) => {
                        if send_state(&events, &unit, active_state).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("failed to decode ActiveState change of {unit}: {e}"),
                },
                None => {
                    warn!("ActiveState stream for {unit} ended");
                    return;
                }
            },
        }
    }
}

async fn send_state(
    events: &mpsc::Sender<UnitState>,
    unit: &str,
    active_state: String,
) -> Result<(), mpsc::error::SendError<UnitState>> {
    debug!("unit {unit} is {active_state}");
    events
        .send(UnitState {
            unit: unit.to_string(),
            active_state,
        })
        .await
}
