//! Home Assistant MQTT discovery
//!
//! One device-level discovery document announces every entity this bridge
//! exposes: power buttons, the preparing-for-shutdown binary sensor and one
//! state sensor / restart button per configured unit. Publishing an empty
//! payload to the same topic retracts the whole device.
//! https://www.home-assistant.io/integrations/mqtt/#mqtt-discovery

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{Settings, PROGRAM_NAME};
use crate::mqtt::encode_bool;

/// Characters accepted in `--homeassistant-discovery-object-id`.
pub const OBJECT_ID_ALLOWED_CHARS: &str = "a-zA-Z0-9_-";

/// Discovery document for one device and its components.
#[derive(Debug, Serialize)]
pub struct DeviceConfig {
    pub device: Device,
    pub origin: Origin,
    pub availability: Vec<Availability>,
    pub components: BTreeMap<String, Component>,
}

#[derive(Debug, Serialize)]
pub struct Device {
    pub identifiers: Vec<String>,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct Origin {
    pub name: String,
    pub sw_version: String,
    pub support_url: String,
}

#[derive(Debug, Serialize)]
pub struct Availability {
    pub topic: String,
    pub payload_available: String,
    pub payload_not_available: String,
}

#[derive(Debug, Serialize)]
pub struct Component {
    pub platform: String,
    pub unique_id: String,
    pub object_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
}

/// Topic carrying the discovery document (and its empty-payload retraction).
pub fn discovery_topic(settings: &Settings) -> String {
    format!(
        "{}/device/{}/config",
        settings.discovery_prefix, settings.discovery_object_id
    )
}

/// Default `--homeassistant-discovery-object-id`: the hostname with every
/// character outside [`OBJECT_ID_ALLOWED_CHARS`] removed.
pub fn default_discovery_object_id(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

pub fn validate_discovery_object_id(object_id: &str) -> bool {
    !object_id.is_empty()
        && object_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Entity ids allow only `[a-z0-9_]`; everything else becomes `_`.
pub fn sanitize_entity_id(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the discovery document for the configured entity set.
pub fn device_config(settings: &Settings) -> DeviceConfig {
    let hostname = &settings.hostname;
    let unique_id_prefix = format!("{}-{}", PROGRAM_NAME, hostname);
    let mut components = BTreeMap::new();

    for suffix in ["poweroff", "suspend", "lock-all-sessions"] {
        components.insert(
            format!("logind/{suffix}"),
            Component {
                platform: "button".to_string(),
                unique_id: format!("{unique_id_prefix}-logind-{suffix}"),
                object_id: sanitize_entity_id(&format!("{hostname}_logind_{suffix}")),
                // home assistant prepends the device name
                name: suffix.replace('-', " "),
                command_topic: Some(format!("{}/{suffix}", settings.topic_prefix())),
                state_topic: None,
                payload_on: None,
                payload_off: None,
            },
        );
    }

    components.insert(
        "logind/preparing-for-shutdown".to_string(),
        Component {
            platform: "binary_sensor".to_string(),
            unique_id: format!("{unique_id_prefix}-logind-preparing-for-shutdown"),
            object_id: sanitize_entity_id(&format!("{hostname}_logind_preparing_for_shutdown")),
            name: "preparing for shutdown".to_string(),
            command_topic: None,
            state_topic: Some(settings.preparing_for_shutdown_topic()),
            payload_on: Some(encode_bool(true).to_string()),
            payload_off: Some(encode_bool(false).to_string()),
        },
    );

    for unit in &settings.monitored_units {
        components.insert(
            format!("unit/system/{unit}/active-state"),
            Component {
                platform: "sensor".to_string(),
                unique_id: format!("{unique_id_prefix}-unit-system-{unit}-active-state"),
                object_id: sanitize_entity_id(&format!("{hostname}_unit_system_{unit}_active_state")),
                name: format!("{unit} active state"),
                command_topic: None,
                state_topic: Some(settings.unit_active_state_topic(unit)),
                payload_on: None,
                payload_off: None,
            },
        );
    }

    for unit in &settings.controlled_units {
        components.insert(
            format!("unit/system/{unit}/restart"),
            Component {
                platform: "button".to_string(),
                unique_id: format!("{unique_id_prefix}-unit-system-{unit}-restart"),
                object_id: sanitize_entity_id(&format!("{hostname}_unit_system_{unit}_restart")),
                name: format!("restart {unit}"),
                command_topic: Some(format!(
                    "{}/unit/system/{unit}/restart",
                    settings.topic_prefix()
                )),
                state_topic: None,
                payload_on: None,
                payload_off: None,
            },
        );
    }

    DeviceConfig {
        device: Device {
            identifiers: vec![hostname.clone()],
            name: hostname.clone(),
        },
        origin: Origin {
            name: env!("CARGO_PKG_NAME").to_string(),
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
            support_url: env!("CARGO_PKG_REPOSITORY").to_string(),
        },
        availability: vec![Availability {
            topic: settings.status_topic(),
            payload_available: "online".to_string(),
            payload_not_available: "offline".to_string(),
        }],
        components,
    }
}
