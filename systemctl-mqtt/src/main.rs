//! Command line entry point: parse arguments, set up logging, run the bridge.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use systemctl_mqtt::config::{self, Settings, MQTT_DEFAULT_PORT, MQTT_DEFAULT_TLS_PORT};
use systemctl_mqtt::{bridge, homeassistant};

#[derive(Debug, Parser)]
#[command(
    name = "systemctl-mqtt",
    version,
    about = "MQTT client triggering & reporting shutdown on systemd-based systems"
)]
struct Args {
    #[arg(long)]
    mqtt_host: String,

    /// Default 8883 (1883 with --mqtt-disable-tls).
    #[arg(long)]
    mqtt_port: Option<u16>,

    #[arg(long)]
    mqtt_disable_tls: bool,

    #[arg(long)]
    mqtt_username: Option<String>,

    #[arg(long, conflicts_with = "mqtt_password_file")]
    mqtt_password: Option<String>,

    /// Stripping trailing newline.
    #[arg(long, value_name = "PATH")]
    mqtt_password_file: Option<PathBuf>,

    /// Home Assistant's prefix for discovery topics.
    #[arg(long, default_value = "homeassistant")]
    homeassistant_discovery_prefix: String,

    /// Part of the discovery topic (default: the hostname).
    #[arg(long)]
    homeassistant_discovery_object_id: Option<String>,

    #[arg(long, default_value_t = 4.0)]
    poweroff_delay_seconds: f64,

    /// Publish the unit's ActiveState; may be passed multiple times.
    #[arg(long = "monitor-system-unit", value_name = "UNIT")]
    monitor_system_unit: Vec<String>,

    /// Expose start/stop/restart for the unit; may be passed multiple times.
    #[arg(long = "control-system-unit", value_name = "UNIT")]
    control_system_unit: Vec<String>,

    #[arg(
        long,
        default_value = "info",
        value_parser = ["debug", "info", "warning", "error", "critical"]
    )]
    log_level: String,
}

fn init_logging(log_level: &str) {
    // tracing has no critical level; warning/critical map onto warn/error.
    let level = match log_level {
        "warning" => "warn",
        "critical" => "error",
        other => other,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

fn settings_from_args(args: Args) -> Result<Settings> {
    let hostname = config::hostname();
    let mqtt_port = args.mqtt_port.unwrap_or(if args.mqtt_disable_tls {
        MQTT_DEFAULT_PORT
    } else {
        MQTT_DEFAULT_TLS_PORT
    });
    let mqtt_password = match args.mqtt_password_file {
        Some(path) => Some(config::read_password_file(&path)?),
        None => args.mqtt_password,
    };
    let poweroff_delay = Duration::try_from_secs_f64(args.poweroff_delay_seconds)
        .context("invalid --poweroff-delay-seconds")?;
    let settings = Settings {
        mqtt_host: args.mqtt_host,
        mqtt_port,
        mqtt_disable_tls: args.mqtt_disable_tls,
        mqtt_username: args.mqtt_username,
        mqtt_password,
        discovery_prefix: args.homeassistant_discovery_prefix,
        discovery_object_id: args
            .homeassistant_discovery_object_id
            .unwrap_or_else(|| homeassistant::default_discovery_object_id(&hostname)),
        poweroff_delay,
        monitored_units: args.monitor_system_unit,
        controlled_units: args.control_system_unit,
        hostname,
    };
    settings.validate()?;
    Ok(settings)
}

// Everything multiplexes onto one event loop; no work in this process needs
// a second scheduler thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);
    let settings = settings_from_args(args)?;
    bridge::run(settings).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mqtt_host_is_required() {
        assert!(Args::try_parse_from(["systemctl-mqtt"]).is_err());
    }

    #[test]
    fn port_default_depends_on_tls() {
        let args = Args::parse_from(["systemctl-mqtt", "--mqtt-host", "broker"]);
        let settings = settings_from_args(args).unwrap();
        assert_eq!(settings.mqtt_port, MQTT_DEFAULT_TLS_PORT);
        assert!(!settings.mqtt_disable_tls);

        let args =
            Args::parse_from(["systemctl-mqtt", "--mqtt-host", "broker", "--mqtt-disable-tls"]);
        let settings = settings_from_args(args).unwrap();
        assert_eq!(settings.mqtt_port, MQTT_DEFAULT_PORT);
        assert!(settings.mqtt_disable_tls);

        let args = Args::parse_from([
            "systemctl-mqtt",
            "--mqtt-host",
            "broker",
            "--mqtt-port",
            "1884",
        ]);
        assert_eq!(settings_from_args(args).unwrap().mqtt_port, 1884);
    }

    #[test]
    fn password_flag_conflicts_with_password_file() {
        assert!(Args::try_parse_from([
            "systemctl-mqtt",
            "--mqtt-host",
            "broker",
            "--mqtt-password",
            "secret",
            "--mqtt-password-file",
            "/run/secrets/mqtt",
        ])
        .is_err());
    }

    #[test]
    fn unit_flags_are_repeatable() {
        let args = Args::parse_from([
            "systemctl-mqtt",
            "--mqtt-host",
            "broker",
            "--monitor-system-unit",
            "ssh.service",
            "--monitor-system-unit",
            "docker.service",
            "--control-system-unit",
            "foo.service",
        ]);
        let settings = settings_from_args(args).unwrap();
        assert_eq!(settings.monitored_units, vec!["ssh.service", "docker.service"]);
        assert_eq!(settings.controlled_units, vec!["foo.service"]);
    }

    #[test]
    fn poweroff_delay_rejects_negative_values() {
        let args = Args::parse_from([
            "systemctl-mqtt",
            "--mqtt-host",
            "broker",
            "--poweroff-delay-seconds=-1",
        ]);
        assert!(settings_from_args(args).is_err());
    }

    #[test]
    fn password_without_username_is_rejected() {
        let args = Args::parse_from([
            "systemctl-mqtt",
            "--mqtt-host",
            "broker",
            "--mqtt-password",
            "secret",
        ]);
        assert!(settings_from_args(args).is_err());
    }

    #[test]
    fn explicit_object_id_overrides_hostname_default() {
        let args = Args::parse_from([
            "systemctl-mqtt",
            "--mqtt-host",
            "broker",
            "--homeassistant-discovery-object-id",
            "node-1",
        ]);
        assert_eq!(settings_from_args(args).unwrap().discovery_object_id, "node-1");
    }
}
