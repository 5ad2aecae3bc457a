//! systemctl-mqtt - MQTT client triggering & reporting shutdown on
//! systemd-based systems
//!
//! The bridge subscribes to `systemctl/<hostname>/…` command topics,
//! forwards them to logind/systemd over the system D-Bus, and reports
//! shutdown preparation and unit state changes back over MQTT, announcing
//! everything to Home Assistant via MQTT discovery.

pub mod actions;
pub mod bridge;
pub mod config;
pub mod dbus;
pub mod homeassistant;
pub mod monitor;
pub mod mqtt;
