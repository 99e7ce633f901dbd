//! Process restart on fatal connectivity loss.
//!
//! The open desktops are carried into the next process as
//! `--relaunch-desktops=<id>` flags (one per desktop) and reopened at boot.
//! The restart is abrupt: in-flight operations are not drained.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::CoordinatorResult;
use crate::registry::{DesktopId, DesktopRegistry};
use crate::signals::{topics, SignalBus, SubscriptionHandle};

pub const RELAUNCH_FLAG_PREFIX: &str = "--relaunch-";
const REASON_FLAG: &str = "--relaunch-reason=";
const DESKTOPS_FLAG: &str = "--relaunch-desktops=";

pub const REASON_TOKEN_LOST: &str = "token-lost";
pub const REASON_SERVER_RESTART: &str = "server-restart";

/// Rebuilds the argument list of the next process: previous `--relaunch-*`
/// flags are dropped, the reason is appended, and one desktops flag per id
/// (none at all when `desktops` is empty).
pub fn build_relaunch_args<S: AsRef<str>>(current: &[String], reason: &str, desktops: &[S]) -> Vec<String> {
    let mut args: Vec<String> = current
        .iter()
        .filter(|arg| !arg.starts_with(RELAUNCH_FLAG_PREFIX))
        .cloned()
        .collect();
    args.push(format!("{}{}", REASON_FLAG, reason));
    args.extend(
        desktops
            .iter()
            .map(|id| format!("{}{}", DESKTOPS_FLAG, id.as_ref())),
    );
    args
}

/// What the previous process asked this one to restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaunchSnapshot {
    pub reason: Option<String>,
    pub desktops: Vec<DesktopId>,
}

impl RelaunchSnapshot {
    /// Accepts repeated desktops flags as well as comma separated lists.
    /// Ids that do not parse are skipped.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshot = Self::default();
        for arg in args {
            let arg = arg.as_ref();
            if let Some(reason) = arg.strip_prefix(REASON_FLAG) {
                snapshot.reason = Some(reason.to_string());
            } else if let Some(list) = arg.strip_prefix(DESKTOPS_FLAG) {
                for raw in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    match DesktopId::parse(raw) {
                        Some(id) if !snapshot.desktops.contains(&id) => snapshot.desktops.push(id),
                        Some(_) => {}
                        None => warn!("Ignoring invalid relaunch desktop id {}", raw),
                    }
                }
            }
        }
        snapshot
    }

    pub fn is_relaunch(&self) -> bool {
        self.reason.is_some()
    }
}

/// Starts the next process. Implementations do not return on success.
pub trait Relauncher: Send + Sync {
    fn relaunch(&self, args: Vec<String>) -> std::io::Result<()>;
}

/// Spawns the current executable and exits this process.
pub struct ProcessRelauncher {
    exe: PathBuf,
}

impl ProcessRelauncher {
    pub fn current() -> std::io::Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
        })
    }
}

impl Relauncher for ProcessRelauncher {
    fn relaunch(&self, args: Vec<String>) -> std::io::Result<()> {
        info!("Relaunching {:?} with {:?}", self.exe, args);
        std::process::Command::new(&self.exe).args(&args).spawn()?;
        std::process::exit(0);
    }
}

pub struct RelaunchController {
    registry: Arc<DesktopRegistry>,
    relauncher: Arc<dyn Relauncher>,
    /// Arguments after the program name.
    args: Vec<String>,
    triggered: AtomicBool,
}

impl RelaunchController {
    pub fn new(registry: Arc<DesktopRegistry>, relauncher: Arc<dyn Relauncher>, args: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            relauncher,
            args,
            triggered: AtomicBool::new(false),
        })
    }

    pub fn has_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Snapshots the open desktops and restarts. Only the first successful
    /// call per process does anything; returns whether this call did. A
    /// failed spawn re-arms the trigger.
    pub fn trigger(&self, reason: &str) -> CoordinatorResult<bool> {
        if self.triggered.swap(true, Ordering::AcqRel) {
            debug!("Relaunch already triggered, ignoring {}", reason);
            return Ok(false);
        }

        // Diagnostic read, no lock: the process is going away either way.
        let desktops = self.registry.open_desktop_ids();
        let args = build_relaunch_args(&self.args, reason, &desktops);
        warn!("Relaunching ({}) with {} open desktop(s)", reason, desktops.len());
        if let Err(e) = self.relauncher.relaunch(args) {
            self.triggered.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(true)
    }

    /// Subscribes to the relaunch triggers. Keep the handles alive for as
    /// long as relaunching should stay armed.
    pub fn watch(self: &Arc<Self>, bus: &SignalBus) -> Vec<SubscriptionHandle> {
        let on_token_lost = {
            let controller = self.clone();
            bus.subscribe(topics::TRANSPORT_TOKEN_LOST, move |_| {
                let controller = controller.clone();
                async move {
                    controller.fire(REASON_TOKEN_LOST);
                }
            })
        };

        let on_identity_changed = {
            let controller = self.clone();
            bus.subscribe(topics::SERVER_IDENTITY_CHANGED, move |signal| {
                let controller = controller.clone();
                async move {
                    let passive = signal
                        .payload
                        .get("passive")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if passive {
                        debug!("Passive server identity change, not relaunching");
                        return;
                    }
                    controller.fire(REASON_SERVER_RESTART);
                }
            })
        };

        vec![on_token_lost, on_identity_changed]
    }

    fn fire(&self, reason: &str) {
        if let Err(e) = self.trigger(reason) {
            error!("Relaunch failed: {}", e);
        }
    }
}
