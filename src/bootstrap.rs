//! Startup sequence: assets, first window, then the first desktop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::{AuthStatus, UserInfo};
use crate::coordinator::Coordinator;
use crate::error::{AssetError, CoordinatorResult};
use crate::registry::{DesktopId, OpenOutcome, OpenSessionRequest, WindowId};
use crate::relaunch::RelaunchSnapshot;

/// Where windows load the UI from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    Url(String),
    /// A bundler dev server on localhost.
    DevServer { port: u16 },
}

impl AssetLocation {
    pub fn url(&self) -> String {
        match self {
            AssetLocation::Url(url) => url.clone(),
            AssetLocation::DevServer { port } => format!("http://localhost:{}", port),
        }
    }
}

/// Blocks until the UI assets can be served.
#[async_trait]
pub trait AssetResolver: Send + Sync {
    async fn resolve(&self) -> Result<AssetLocation, AssetError>;
}

/// Production build shipped next to the binary.
pub struct StaticAssets {
    index: PathBuf,
}

impl StaticAssets {
    pub fn new(index: impl Into<PathBuf>) -> Self {
        Self { index: index.into() }
    }
}

#[async_trait]
impl AssetResolver for StaticAssets {
    async fn resolve(&self) -> Result<AssetLocation, AssetError> {
        if !self.index.exists() {
            return Err(AssetError::NotReady(format!("{:?} does not exist", self.index)));
        }
        Ok(AssetLocation::Url(format!("file://{}", self.index.display())))
    }
}

/// Bundler dev server on localhost. Resolves once it answers.
pub struct DevServerAssets {
    port: u16,
    attempts: u32,
}

impl DevServerAssets {
    pub fn new(port: u16) -> Self {
        Self { port, attempts: 20 }
    }
}

#[async_trait]
impl AssetResolver for DevServerAssets {
    async fn resolve(&self) -> Result<AssetLocation, AssetError> {
        let location = AssetLocation::DevServer { port: self.port };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| AssetError::NotReady(e.to_string()))?;

        // Backoff: 50, 100, 200 ... capped at 1s
        let mut delay_ms = 50;
        for _ in 0..self.attempts {
            if let Ok(response) = client.get(location.url()).send().await {
                if response.status().is_success() {
                    info!("Dev server ready on port {}", self.port);
                    return Ok(location);
                }
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms = (delay_ms * 2).min(1000);
        }
        Err(AssetError::NotReady(format!(
            "dev server on port {} did not answer after {} attempts",
            self.port, self.attempts
        )))
    }
}

/// Application side of desktop configuration.
#[async_trait]
pub trait DesktopConfigurator: Send + Sync {
    /// Turns a user into the desktop to open in `window_id`. `None` when the
    /// user backed out.
    async fn configure(&self, window_id: &WindowId, user: &UserInfo) -> CoordinatorResult<Option<OpenSessionRequest>>;

    async fn navigate_to_context(&self, desktop_id: &DesktopId, context_id: &str) -> CoordinatorResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootOutcome {
    /// Desktops carried over from the previous process.
    Restored(Vec<OpenOutcome>),
    Opened(OpenOutcome),
    /// The login was cancelled or the configurator backed out; the first
    /// window is gone.
    Cancelled,
    /// The login failed; the first window stays up so it can retry.
    LoginFailed(WindowId),
}

pub struct Bootstrap {
    coordinator: Arc<Coordinator>,
    assets: Arc<dyn AssetResolver>,
    configurator: Option<Arc<dyn DesktopConfigurator>>,
    snapshot: RelaunchSnapshot,
}

impl Bootstrap {
    pub fn new(
        coordinator: Arc<Coordinator>,
        assets: Arc<dyn AssetResolver>,
        configurator: Option<Arc<dyn DesktopConfigurator>>,
        snapshot: RelaunchSnapshot,
    ) -> Self {
        Self {
            coordinator,
            assets,
            configurator,
            snapshot,
        }
    }

    /// Boots and then waits until every window is closed.
    pub async fn run(&self) -> CoordinatorResult<BootOutcome> {
        let outcome = self.start().await?;
        info!("Boot finished: {:?}", outcome);
        self.coordinator.registry().wait_all_closed().await;
        info!("All windows closed");
        Ok(outcome)
    }

    pub async fn start(&self) -> CoordinatorResult<BootOutcome> {
        let registry = self.coordinator.registry();

        info!("Waiting for UI assets");
        let location = self.assets.resolve().await?;
        registry.set_url(location.url());
        info!("UI assets at {}", location.url());

        let window_id = registry.open_blank_window().await?;

        if !self.snapshot.desktops.is_empty() {
            let restored = self.restore(&window_id).await;
            if !restored.is_empty() {
                return Ok(BootOutcome::Restored(restored));
            }
            warn!("No desktop could be restored, booting normally");
        }

        if self.coordinator.config().use_configurator {
            self.configure_with_login(&window_id).await
        } else {
            self.open_direct(&window_id).await
        }
    }

    /// Reopens the relaunch snapshot silently; the first desktop adopts the
    /// first window.
    async fn restore(&self, window_id: &WindowId) -> Vec<OpenOutcome> {
        let reason = self.snapshot.reason.as_deref().unwrap_or("unknown");
        info!("Restoring {} desktop(s) after relaunch ({})", self.snapshot.desktops.len(), reason);

        let username = os_username();
        let mut target = Some(window_id.clone());
        let mut restored = Vec::new();
        for desktop_id in &self.snapshot.desktops {
            let mut request = OpenSessionRequest::new(desktop_id.mandate(), desktop_id.session(), username.clone());
            if let Some(window_id) = &target {
                request = request.in_window(window_id.clone());
            }
            match self.coordinator.registry().open_session(request).await {
                Ok(outcome) => {
                    if target.as_ref() == Some(&outcome.window_id) {
                        target = None;
                    }
                    restored.push(outcome);
                }
                Err(e) => warn!("Could not restore {}: {}", desktop_id, e),
            }
        }
        restored
    }

    async fn configure_with_login(&self, window_id: &WindowId) -> CoordinatorResult<BootOutcome> {
        let Some(configurator) = &self.configurator else {
            warn!("Configurator mode without a configurator, opening the default desktop");
            return self.open_direct(window_id).await;
        };

        let login = self.coordinator.login(Some(window_id)).await?;
        let user = match (login.status, login.info) {
            (AuthStatus::Renewed, Some(user)) => user,
            (AuthStatus::Cancelled, _) => return Ok(BootOutcome::Cancelled),
            _ => return Ok(BootOutcome::LoginFailed(window_id.clone())),
        };

        self.configure(configurator.as_ref(), window_id, &user).await
    }

    async fn configure(
        &self,
        configurator: &dyn DesktopConfigurator,
        window_id: &WindowId,
        user: &UserInfo,
    ) -> CoordinatorResult<BootOutcome> {
        let Some(request) = configurator.configure(window_id, user).await? else {
            info!("Configuration abandoned, closing {}", window_id);
            self.coordinator.registry().discard_window(window_id).await?;
            return Ok(BootOutcome::Cancelled);
        };

        let outcome = self
            .coordinator
            .registry()
            .open_session(request.in_window(window_id.clone()))
            .await?;

        if let Some(context_id) = &self.coordinator.config().context_id {
            if let Err(e) = configurator.navigate_to_context(&outcome.desktop_id, context_id).await {
                warn!("Could not navigate {} to {}: {}", outcome.desktop_id, context_id, e);
            }
        }
        Ok(BootOutcome::Opened(outcome))
    }

    /// No login. A configurator, when present, still picks the desktop.
    async fn open_direct(&self, window_id: &WindowId) -> CoordinatorResult<BootOutcome> {
        let username = os_username();
        if let Some(configurator) = &self.configurator {
            let user = UserInfo {
                subject: username.clone(),
                name: Some(username),
                expires_at: None,
                data: json!({}),
            };
            return self.configure(configurator.as_ref(), window_id, &user).await;
        }

        let config = self.coordinator.config();
        let request = OpenSessionRequest::new(config.default_mandate.clone(), config.main_app.clone(), username)
            .in_window(window_id.clone());
        let outcome = self.coordinator.registry().open_session(request).await?;
        Ok(BootOutcome::Opened(outcome))
    }
}

fn os_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string())
}
