//! Inbound topic → action registry
//!
//! Built once at boot from the configuration. Every subscribed topic maps to
//! exactly one action; payloads are ignored (pressing a Home Assistant button
//! publishes an arbitrary payload). Topics under the bridge prefix without a
//! binding are logged and dropped.

use std::collections::HashMap;
use std::fmt;

use crate::config::Settings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SchedulePoweroff,
    Suspend,
    LockAllSessions,
    StartUnit(String),
    StopUnit(String),
    RestartUnit(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::SchedulePoweroff => write!(f, "schedule poweroff"),
            Action::Suspend => write!(f, "suspend"),
            Action::LockAllSessions => write!(f, "lock all sessions"),
            Action::StartUnit(unit) => write!(f, "start unit {unit}"),
            Action::StopUnit(unit) => write!(f, "stop unit {unit}"),
            Action::RestartUnit(unit) => write!(f, "restart unit {unit}"),
        }
    }
}

pub struct ActionRegistry {
    by_topic: HashMap<String, Action>,
}

impl ActionRegistry {
    pub fn new(settings: &Settings) -> Self {
        let prefix = settings.topic_prefix();
        let mut by_topic = HashMap::new();
        by_topic.insert(format!("{prefix}/poweroff"), Action::SchedulePoweroff);
        by_topic.insert(format!("{prefix}/suspend"), Action::Suspend);
        by_topic.insert(format!("{prefix}/lock-all-sessions"), Action::LockAllSessions);
        for unit in &settings.controlled_units {
            by_topic.insert(
                format!("{prefix}/unit/system/{unit}/start"),
                Action::StartUnit(unit.clone()),
            );
            by_topic.insert(
                format!("{prefix}/unit/system/{unit}/stop"),
                Action::StopUnit(unit.clone()),
            );
            by_topic.insert(
                format!("{prefix}/unit/system/{unit}/restart"),
                Action::RestartUnit(unit.clone()),
            );
        }
        Self { by_topic }
    }

    pub fn get(&self, topic: &str) -> Option<&Action> {
        self.by_topic.get(topic)
    }

    /// Topics to subscribe on every (re)connect.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.by_topic.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(controlled: &[&str]) -> Settings {
        Settings {
            mqtt_host: "mqtt-broker.local".to_string(),
            mqtt_port: 8883,
            mqtt_disable_tls: false,
            mqtt_username: None,
            mqtt_password: None,
            discovery_prefix: "homeassistant".to_string(),
            discovery_object_id: "h1".to_string(),
            poweroff_delay: Duration::from_secs(4),
            monitored_units: vec![],
            controlled_units: controlled.iter().map(|u| u.to_string()).collect(),
            hostname: "h1".to_string(),
        }
    }

    #[test]
    fn power_actions_always_bound() {
        let registry = ActionRegistry::new(&settings(&[]));
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.get("systemctl/h1/poweroff"),
            Some(&Action::SchedulePoweroff)
        );
        assert_eq!(registry.get("systemctl/h1/suspend"), Some(&Action::Suspend));
        assert_eq!(
            registry.get("systemctl/h1/lock-all-sessions"),
            Some(&Action::LockAllSessions)
        );
    }

    #[test]
    fn controlled_units_get_lifecycle_bindings() {
        let registry = ActionRegistry::new(&settings(&["foo.service"]));
        assert_eq!(registry.len(), 6);
        assert_eq!(
            registry.get("systemctl/h1/unit/system/foo.service/restart"),
            Some(&Action::RestartUnit("foo.service".to_string()))
        );
        assert_eq!(
            registry.get("systemctl/h1/unit/system/foo.service/start"),
            Some(&Action::StartUnit("foo.service".to_string()))
        );
        assert_eq!(
            registry.get("systemctl/h1/unit/system/foo.service/stop"),
            Some(&Action::StopUnit("foo.service".to_string()))
        );
    }

    #[test]
    fn uncontrolled_unit_has_no_binding() {
        let registry = ActionRegistry::new(&settings(&["foo.service"]));
        assert_eq!(
            registry.get("systemctl/h1/unit/system/bar.service/restart"),
            None
        );
        assert_eq!(registry.get("systemctl/other/poweroff"), None);
    }
}
