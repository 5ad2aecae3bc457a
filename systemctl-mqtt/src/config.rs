//! Immutable runtime settings
//!
//! Everything the bridge needs is captured once at boot:
//! - MQTT broker endpoint, TLS flag and credentials
//! - Home Assistant discovery prefix / object id
//! - poweroff delay and the monitored/controlled unit sets
//! - the local hostname, from which every topic is derived

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

/// Name reported to the broker (client id prefix) and to logind (inhibitor "who").
pub const PROGRAM_NAME: &str = "systemctl-mqtt";

pub const MQTT_DEFAULT_PORT: u16 = 1883;
pub const MQTT_DEFAULT_TLS_PORT: u16 = 8883;

#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_disable_tls: bool,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub discovery_prefix: String,
    pub discovery_object_id: String,
    pub poweroff_delay: Duration,
    pub monitored_units: Vec<String>,
    pub controlled_units: Vec<String>,
    pub hostname: String,
}

impl Settings {
    /// Root of every topic this bridge owns.
    pub fn topic_prefix(&self) -> String {
        format!("systemctl/{}", self.hostname)
    }

    /// Birth/last-will topic, retained `online`/`offline`.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.topic_prefix())
    }

    pub fn preparing_for_shutdown_topic(&self) -> String {
        format!("{}/preparing-for-shutdown", self.topic_prefix())
    }

    pub fn unit_active_state_topic(&self, unit: &str) -> String {
        format!("{}/unit/system/{}/active-state", self.topic_prefix(), unit)
    }

    /// Unique per process, not an identity: the broker only uses it to tell
    /// concurrent sessions apart.
    pub fn client_id(&self) -> String {
        format!("{}-{}-{}", PROGRAM_NAME, self.hostname, std::process::id())
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            anyhow::bail!("could not determine local hostname");
        }
        if self.mqtt_password.is_some() && self.mqtt_username.is_none() {
            anyhow::bail!("missing MQTT username");
        }
        if !crate::homeassistant::validate_discovery_object_id(&self.discovery_object_id) {
            anyhow::bail!(
                "invalid home assistant discovery object id {:?} (length >= 1, allowed characters: {})\n\
                 change --homeassistant-discovery-object-id",
                self.discovery_object_id,
                crate::homeassistant::OBJECT_ID_ALLOWED_CHARS,
            );
        }
        Ok(())
    }
}

/// Local hostname, lowercased. Captured once at startup and never re-read.
pub fn hostname() -> String {
    gethostname::gethostname()
        .to_string_lossy()
        .to_lowercase()
}

/// Read an MQTT password from a file, stripping one trailing newline.
///
/// The file content is treated as opaque; only a single `\r\n` or `\n`
/// left behind by an editor is removed.
pub fn read_password_file(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read MQTT password file {}", path.display()))?;
    if let Some(stripped) = raw.strip_suffix("\r\n") {
        Ok(stripped.to_string())
    } else if let Some(stripped) = raw.strip_suffix('\n') {
        Ok(stripped.to_string())
    } else {
        Ok(raw)
    }
}
