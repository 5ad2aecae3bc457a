//! systemd service manager proxy
//!
//! https://www.freedesktop.org/software/systemd/man/latest/org.freedesktop.systemd1.html
//!
//! Unit lifecycle calls always use mode `"replace"`. Failures are logged and
//! swallowed; a broken unit must not take the bridge down with it.

use tracing::{info, warn};
use zbus::proxy;
use zbus::zvariant::OwnedObjectPath;

use crate::dbus::{is_interactive_auth_required, log_polkit_hint, DBUS_CALL_TIMEOUT};

const UNIT_START_MODE: &str = "replace";

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
pub trait ServiceManager {
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    /// Resolve a loaded unit's object path.
    fn get_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;
}

/// Per-unit object, resolved through [`ServiceManagerProxy::get_unit`].
#[proxy(
    interface = "org.freedesktop.systemd1.Unit",
    default_service = "org.freedesktop.systemd1"
)]
pub trait SystemdUnit {
    /// One of active/reloading/inactive/failed/activating/deactivating;
    /// unknown values pass through verbatim.
    #[zbus(property)]
    fn active_state(&self) -> zbus::Result<String>;
}

pub async fn start_unit(proxy: &ServiceManagerProxy<'_>, unit: &str) {
    info!("starting unit {unit}");
    run_lifecycle_call(proxy.start_unit(unit, UNIT_START_MODE), "start", unit).await;
}

pub async fn stop_unit(proxy: &ServiceManagerProxy<'_>, unit: &str) {
    info!("stopping unit {unit}");
    run_lifecycle_call(proxy.stop_unit(unit, UNIT_START_MODE), "stop", unit).await;
}

pub async fn restart_unit(proxy: &ServiceManagerProxy<'_>, unit: &str) {
    info!("restarting unit {unit}");
    run_lifecycle_call(proxy.restart_unit(unit, UNIT_START_MODE), "restart", unit).await;
}

async fn run_lifecycle_call(
    call: impl std::future::Future<Output = zbus::Result<OwnedObjectPath>>,
    verb: &str,
    unit: &str,
) {
    match tokio::time::timeout(DBUS_CALL_TIMEOUT, call).await {
        Err(_) => warn!("timed out trying to {verb} unit {unit}"),
        Ok(Err(e)) if is_interactive_auth_required(&e) => {
            log_polkit_hint(
                &format!("{verb} unit {unit}"),
                "org.freedesktop.systemd1.manage-units",
            );
        }
        Ok(Err(e)) => warn!("failed to {verb} unit {unit}: {e}"),
        Ok(Ok(job)) => info!("{verb} of {unit} queued as {}", job.as_str()),
    }
}
