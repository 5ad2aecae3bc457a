//! System-bus proxies for logind and systemd
//!
//! Typed zbus wrappers over `org.freedesktop.login1` and
//! `org.freedesktop.systemd1`. Authorization failures never tear the bridge
//! down; they are answered with a one-shot polkit hint naming the action id
//! and the current user so the operator can install a rule.

pub mod login_manager;
pub mod service_manager;

use std::time::Duration;

use tracing::error;

/// Upper bound on any single D-Bus method call issued by the bridge.
pub(crate) const DBUS_CALL_TIMEOUT: Duration = Duration::from_secs(25);

const INTERACTIVE_AUTH_REQUIRED: &str =
    "org.freedesktop.DBus.Error.InteractiveAuthorizationRequired";

/// Open the system bus. `DBUS_SYSTEM_BUS_ADDRESS` is honoured, the default
/// is `unix:path=/var/run/dbus/system_bus_socket`.
pub async fn system_bus() -> zbus::Result<zbus::Connection> {
    zbus::Connection::system().await
}

pub(crate) fn is_interactive_auth_required(err: &zbus::Error) -> bool {
    matches!(err, zbus::Error::MethodError(name, _, _)
        if name.as_str() == INTERACTIVE_AUTH_REQUIRED)
}

fn current_username() -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::effective())
        .ok()
        .flatten()
        .map(|user| user.name)
}

/// Tell the operator which polkit rule would authorize the failed action.
pub(crate) fn log_polkit_hint(action_label: &str, action_id: &str) {
    error!(
        "failed to {}: interactive authorization required\n\n\
         create /etc/polkit-1/rules.d/50-systemctl-mqtt.rules and insert the following rule:\n\
         polkit.addRule(function(action, subject) {{\n    \
             if(action.id === \"{}\" && subject.user === \"{}\") {{\n        \
                 return polkit.Result.YES;\n    \
             }}\n\
         }});",
        action_label,
        action_id,
        current_username().unwrap_or_else(|| "USERNAME".to_string()),
    );
}
