//! logind proxy and the shutdown inhibitor lock
//!
//! https://freedesktop.org/wiki/Software/systemd/logind/
//!
//! The delay inhibitor gives this process a bounded window to report
//! `preparing-for-shutdown` over MQTT before the kernel proceeds; dropping
//! the returned fd is what lets the shutdown continue.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use zbus::proxy;
use zbus::zvariant::OwnedFd;

use crate::config::PROGRAM_NAME;
use crate::dbus::{is_interactive_auth_required, log_polkit_hint, DBUS_CALL_TIMEOUT};

#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
pub trait LoginManager {
    /// `Inhibit(s s s s) → h`; the returned fd holds the lock until closed.
    fn inhibit(&self, what: &str, who: &str, why: &str, mode: &str) -> zbus::Result<OwnedFd>;

    /// `ScheduleShutdown(s t)`; time is microseconds since the Unix epoch.
    fn schedule_shutdown(&self, kind: &str, usec: u64) -> zbus::Result<()>;

    fn suspend(&self, interactive: bool) -> zbus::Result<()>;

    fn lock_sessions(&self) -> zbus::Result<()>;

    /// `ListInhibitors() → a(ssssuu)`: (what, who, why, mode, uid, pid).
    fn list_inhibitors(&self) -> zbus::Result<Vec<(String, String, String, String, u32, u32)>>;

    #[zbus(property)]
    fn preparing_for_shutdown(&self) -> zbus::Result<bool>;

    #[zbus(signal)]
    fn prepare_for_shutdown(&self, start: bool) -> zbus::Result<()>;
}

/// When logind should execute a shutdown requested now with `delay`.
pub(crate) fn shutdown_time_usec(now: SystemTime, delay: Duration) -> u64 {
    (now + delay)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Ask logind to power off after the configured delay. Each call reschedules:
/// a second request slides the shutdown time forward.
pub async fn schedule_poweroff(proxy: &LoginManagerProxy<'_>, delay: Duration) {
    let now = SystemTime::now();
    let when_usec = shutdown_time_usec(now, delay);
    let when = chrono::DateTime::<chrono::Local>::from(now + delay);
    info!("scheduling poweroff for {}", when.format("%Y-%m-%d %H:%M:%S"));
    match tokio::time::timeout(DBUS_CALL_TIMEOUT, proxy.schedule_shutdown("poweroff", when_usec))
        .await
    {
        Err(_) => warn!("timed out scheduling poweroff"),
        Ok(Err(e)) if is_interactive_auth_required(&e) => {
            log_polkit_hint("schedule poweroff", "org.freedesktop.login1.power-off");
        }
        Ok(Err(e)) => error!("failed to schedule poweroff: {e}"),
        Ok(Ok(())) => log_shutdown_inhibitors(proxy).await,
    }
}

pub async fn suspend(proxy: &LoginManagerProxy<'_>) {
    info!("suspending system");
    match tokio::time::timeout(DBUS_CALL_TIMEOUT, proxy.suspend(false)).await {
        Err(_) => warn!("timed out requesting suspend"),
        Ok(Err(e)) if is_interactive_auth_required(&e) => {
            log_polkit_hint("suspend", "org.freedesktop.login1.suspend");
        }
        Ok(Err(e)) => error!("failed to suspend: {e}"),
        Ok(Ok(())) => {}
    }
}

pub async fn lock_all_sessions(proxy: &LoginManagerProxy<'_>) {
    info!("instruct all sessions to activate screen locks");
    match tokio::time::timeout(DBUS_CALL_TIMEOUT, proxy.lock_sessions()).await {
        Err(_) => warn!("timed out locking sessions"),
        Ok(Err(e)) if is_interactive_auth_required(&e) => {
            log_polkit_hint("lock all sessions", "org.freedesktop.login1.lock-sessions");
        }
        Ok(Err(e)) => error!("failed to lock all sessions: {e}"),
        Ok(Ok(())) => {}
    }
}

/// Debug aid after scheduling a shutdown: list who else is holding
/// shutdown inhibitors.
async fn log_shutdown_inhibitors(proxy: &LoginManagerProxy<'_>) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let inhibitors = match tokio::time::timeout(DBUS_CALL_TIMEOUT, proxy.list_inhibitors()).await {
        Ok(Ok(inhibitors)) => inhibitors,
        Ok(Err(e)) => {
            warn!("failed to fetch shutdown inhibitors: {e}");
            return;
        }
        Err(_) => {
            warn!("timed out fetching shutdown inhibitors");
            return;
        }
    };
    let mut found = false;
    for (what, who, why, mode, uid, pid) in inhibitors {
        if what.contains("shutdown") {
            found = true;
            debug!("detected shutdown inhibitor {who} (pid={pid}, uid={uid}, mode={mode}): {why}");
        }
    }
    if !found {
        debug!("no shutdown inhibitor locks found");
    }
}

/// Delay-mode shutdown inhibitor: held for the whole session, released
/// exactly once. Releasing twice is a no-op.
pub struct ShutdownLock {
    proxy: LoginManagerProxy<'static>,
    fd: Option<OwnedFd>,
}

impl ShutdownLock {
    pub fn new(proxy: LoginManagerProxy<'static>) -> Self {
        Self { proxy, fd: None }
    }

    pub fn held(&self) -> bool {
        self.fd.is_some()
    }

    /// Acquire the lock if not already held.
    pub async fn acquire(&mut self) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let fd = tokio::time::timeout(
            DBUS_CALL_TIMEOUT,
            self.proxy
                .inhibit("shutdown", PROGRAM_NAME, "Report shutdown via MQTT", "delay"),
        )
        .await
        .context("timed out acquiring shutdown inhibitor lock")?
        .context("failed to acquire shutdown inhibitor lock")?;
        self.fd = Some(fd);
        debug!("acquired shutdown inhibitor lock");
        Ok(())
    }

    /// Drop the fd, letting a pending shutdown proceed.
    pub fn release(&mut self) {
        if self.fd.take().is_some() {
            debug!("released shutdown inhibitor lock");
        }
    }
}
