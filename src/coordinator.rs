use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auth::{AuthManager, AuthProvider, AuthStatus, LoginOutcome, RefreshTokenStore};
use crate::client_session::{ClientSession, ClientSettings, SortDirection};
use crate::config::ClientConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::locks::ResourceLockTable;
use crate::registry::{DesktopId, DesktopRegistry, OpenOutcome, OpenSessionRequest, WindowId};
use crate::relaunch::{RelaunchController, Relauncher};
use crate::shell::{checked_url, ExternalOpener};
use crate::signals::{SignalBus, SubscriptionHandle};
use crate::window::{WidgetRef, WindowBounds, WindowHost};

/// Payload of the `open_session` command. The mandate falls back to the
/// configured default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionArgs {
    #[serde(default)]
    pub mandate: Option<String>,
    pub session: String,
    pub username: String,
    #[serde(default)]
    pub configuration: Value,
    #[serde(default)]
    pub root_widget: Option<WidgetRef>,
    #[serde(default)]
    pub target_window: Option<WindowId>,
}

impl OpenSessionArgs {
    fn into_request(self, default_mandate: &str) -> OpenSessionRequest {
        OpenSessionRequest {
            mandate: self.mandate.unwrap_or_else(|| default_mandate.to_string()),
            session: self.session,
            username: self.username,
            configuration: self.configuration,
            root_widget: self.root_widget,
            target_window: self.target_window,
        }
    }
}

/// Collaborators the coordinator is built from.
pub struct CoordinatorParts {
    /// Shared with the host, which publishes window events on it.
    pub bus: SignalBus,
    pub host: Arc<dyn WindowHost>,
    pub auth_provider: Arc<dyn AuthProvider>,
    pub relauncher: Arc<dyn Relauncher>,
    pub opener: Arc<dyn ExternalOpener>,
    pub client_session: Option<Arc<ClientSession>>,
    /// Process arguments after the program name.
    pub args: Vec<String>,
}

/// The one long-lived service per process. Every command enters here.
pub struct Coordinator {
    config: ClientConfig,
    bus: SignalBus,
    registry: Arc<DesktopRegistry>,
    auth: AuthManager,
    client_session: Option<Arc<ClientSession>>,
    relaunch: Arc<RelaunchController>,
    opener: Arc<dyn ExternalOpener>,
    _relaunch_triggers: Vec<SubscriptionHandle>,
}

impl Coordinator {
    pub fn new(config: ClientConfig, parts: CoordinatorParts) -> Arc<Self> {
        let bus = parts.bus;
        let registry = DesktopRegistry::new(
            parts.host,
            ResourceLockTable::new(),
            bus.clone(),
            config.lab.lab_config(),
            parts.client_session.clone(),
        );
        let auth = AuthManager::new(
            parts.auth_provider,
            RefreshTokenStore::new(config.paths().refresh_token()),
            config.auth.login_target.clone(),
        );
        let relaunch = RelaunchController::new(registry.clone(), parts.relauncher, parts.args);
        let relaunch_triggers = relaunch.watch(&bus);

        info!("Coordinator ready for {}", config.main_app);
        Arc::new(Self {
            config,
            bus,
            registry,
            auth,
            client_session: parts.client_session,
            relaunch,
            opener: parts.opener,
            _relaunch_triggers: relaunch_triggers,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<DesktopRegistry> {
        &self.registry
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn relaunch(&self) -> &Arc<RelaunchController> {
        &self.relaunch
    }

    pub fn client_session(&self) -> Option<&Arc<ClientSession>> {
        self.client_session.as_ref()
    }

    fn require_client_session(&self) -> CoordinatorResult<&Arc<ClientSession>> {
        self.client_session
            .as_ref()
            .ok_or(CoordinatorError::NoClientSession)
    }

    pub async fn open_session(&self, args: OpenSessionArgs) -> CoordinatorResult<OpenOutcome> {
        let request = args.into_request(&self.config.default_mandate);
        self.registry.open_session(request).await
    }

    pub async fn close_session(&self, window_id: &WindowId, desktop_id: &str) -> CoordinatorResult<()> {
        let desktop_id = DesktopId::parse(desktop_id)
            .ok_or_else(|| CoordinatorError::InvalidDesktopId(desktop_id.to_string()))?;
        let closed = self.registry.close_session(window_id, &desktop_id).await?;
        debug!("close_session {} {}: {}", window_id, desktop_id, closed);
        Ok(())
    }

    /// Stores the best supported match for `locale` and returns it.
    pub fn change_locale(&self, locale: &str, client_session_id: Option<&str>) -> CoordinatorResult<String> {
        let session = self.require_client_session()?;
        if let Some(requested) = client_session_id {
            if requested != session.id().as_str() {
                warn!(
                    "change_locale for client session {} but {} is open, applying to the open one",
                    requested,
                    session.id()
                );
            }
        }
        let chosen = session.set_locale(locale)?;
        info!("Locale set to {} (asked {})", chosen, locale);
        Ok(chosen)
    }

    pub fn get_locale(&self) -> Option<String> {
        self.client_session.as_ref().and_then(|session| session.locale())
    }

    /// Runs the login state machine. A cancelled login closes the window
    /// that asked for it.
    pub async fn login(&self, requester: Option<&WindowId>) -> CoordinatorResult<LoginOutcome> {
        let outcome = self.auth.login().await;
        if outcome.status == AuthStatus::Cancelled {
            if let Some(window_id) = requester {
                info!("Login cancelled, closing {}", window_id);
                self.registry.discard_window(window_id).await?;
            }
        }
        Ok(outcome)
    }

    /// `login` for the window showing `desktop_id`.
    pub async fn login_for_desktop(&self, desktop_id: &str) -> CoordinatorResult<LoginOutcome> {
        let desktop_id = DesktopId::parse(desktop_id)
            .ok_or_else(|| CoordinatorError::InvalidDesktopId(desktop_id.to_string()))?;
        let window_id = self.registry.window_for(&desktop_id);
        self.login(window_id.as_ref()).await
    }

    pub fn logout(&self) -> CoordinatorResult<()> {
        let removed = self.auth.logout()?;
        info!("Logged out (credential removed: {})", removed);
        Ok(())
    }

    pub fn open_external(&self, url: &str) -> CoordinatorResult<()> {
        let url = checked_url(url)?;
        self.opener.open_url(&url)?;
        Ok(())
    }

    pub fn save_window_bounds(&self, window_id: &WindowId, bounds: WindowBounds) -> CoordinatorResult<bool> {
        Ok(self.require_client_session()?.save_window_bounds(window_id, bounds)?)
    }

    pub fn client_settings(&self) -> CoordinatorResult<ClientSettings> {
        Ok(self.require_client_session()?.snapshot())
    }

    pub fn set_view_columns_order(&self, view_id: &str, column_ids: Vec<String>) -> CoordinatorResult<()> {
        Ok(self.require_client_session()?.set_view_columns_order(view_id, column_ids)?)
    }

    pub fn set_view_column_width(&self, view_id: &str, column_id: &str, width: f64) -> CoordinatorResult<()> {
        Ok(self.require_client_session()?.set_view_column_width(view_id, column_id, width)?)
    }

    pub fn set_view_column_sorting(
        &self,
        view_id: &str,
        column_id: &str,
        direction: SortDirection,
    ) -> CoordinatorResult<()> {
        Ok(self
            .require_client_session()?
            .set_view_column_sorting(view_id, column_id, direction)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{token::encode_for_test, Grant};
    use crate::test_support::{FakeAuthProvider, FakeHost, FakeOpener, FakeRelauncher, HostCall};
    use serde_json::json;
    use std::path::PathBuf;

    struct Fixture {
        coordinator: Arc<Coordinator>,
        host: FakeHost,
        auth: FakeAuthProvider,
        opener: FakeOpener,
        _dir: tempfile::TempDir,
    }

    fn fixture(with_session: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            app_root: Some(dir.path().to_path_buf()),
            ..ClientConfig::default()
        };
        let client_session = with_session.then(|| {
            Arc::new(
                ClientSession::open(
                    &config.paths().client_sessions(),
                    &config.main_app,
                    config.supported_locales.clone(),
                )
                .unwrap(),
            )
        });
        let host = FakeHost::new();
        let auth = FakeAuthProvider::new();
        let opener = FakeOpener::new();
        let coordinator = Coordinator::new(
            config,
            CoordinatorParts {
                bus: SignalBus::new(),
                host: Arc::new(host.clone()),
                auth_provider: Arc::new(auth.clone()),
                relauncher: Arc::new(FakeRelauncher::new()),
                opener: Arc::new(opener.clone()),
                client_session,
                args: Vec::new(),
            },
        );
        Fixture {
            coordinator,
            host,
            auth,
            opener,
            _dir: dir,
        }
    }

    fn args(session: &str) -> OpenSessionArgs {
        OpenSessionArgs {
            mandate: None,
            session: session.to_string(),
            username: "alice".to_string(),
            configuration: Value::Null,
            root_widget: None,
            target_window: None,
        }
    }

    #[tokio::test]
    async fn test_open_uses_default_mandate_and_close_by_string_id() {
        let f = fixture(false);
        let outcome = f.coordinator.open_session(args("s1")).await.unwrap();
        assert_eq!(outcome.desktop_id, DesktopId::derive("local", "s1"));

        f.coordinator
            .close_session(&outcome.window_id, outcome.desktop_id.as_str())
            .await
            .unwrap();
        // closing again is a no-op
        f.coordinator
            .close_session(&outcome.window_id, outcome.desktop_id.as_str())
            .await
            .unwrap();
        assert!(f.coordinator.registry().open_desktop_ids().is_empty());

        let err = f
            .coordinator
            .close_session(&outcome.window_id, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidDesktopId(_)));
    }

    #[tokio::test]
    async fn test_cancelled_login_closes_requesting_window() {
        let f = fixture(false);
        f.auth.on_interactive(|_| Grant::cancelled());
        let window = f.coordinator.registry().open_blank_window().await.unwrap();

        let outcome = f.coordinator.login(Some(&window)).await.unwrap();
        assert_eq!(outcome.status, AuthStatus::Cancelled);
        assert_eq!(f.coordinator.registry().window_count(), 0);
        assert!(f.host.calls_for(&window).contains(&HostCall::Close));
    }

    #[tokio::test]
    async fn test_renewed_login_keeps_window() {
        let f = fixture(false);
        f.auth.on_interactive(|nonce| {
            Grant::granted(
                encode_for_test(json!({ "sub": "u-1", "nonce": nonce })),
                Some("refresh".to_string()),
            )
        });
        let window = f.coordinator.registry().open_blank_window().await.unwrap();

        let outcome = f.coordinator.login(Some(&window)).await.unwrap();
        assert_eq!(outcome.status, AuthStatus::Renewed);
        assert_eq!(f.coordinator.registry().window_count(), 1);

        f.coordinator.logout().unwrap();
        let refresh: PathBuf = f.coordinator.config().paths().refresh_token();
        assert!(!refresh.exists());
    }

    #[tokio::test]
    async fn test_locale_and_bounds_need_a_client_session() {
        let f = fixture(false);
        assert!(matches!(
            f.coordinator.change_locale("fr-CH", None),
            Err(CoordinatorError::NoClientSession)
        ));
        assert_eq!(f.coordinator.get_locale(), None);

        let f = fixture(true);
        assert_eq!(f.coordinator.change_locale("fr", None).unwrap(), "fr-CH");
        assert_eq!(f.coordinator.get_locale().as_deref(), Some("fr-CH"));
    }

    #[tokio::test]
    async fn test_window_bounds_follow_the_slot() {
        let f = fixture(true);
        let outcome = f.coordinator.open_session(args("s1")).await.unwrap();
        let bounds = WindowBounds {
            x: 10,
            y: 20,
            width: 1024,
            height: 768,
            maximized: false,
        };
        assert!(f.coordinator.save_window_bounds(&outcome.window_id, bounds).unwrap());
        f.coordinator
            .close_session(&outcome.window_id, outcome.desktop_id.as_str())
            .await
            .unwrap();

        // the next window takes the freed slot and gets its bounds back
        let next = f.coordinator.open_session(args("s2")).await.unwrap();
        assert_eq!(f.host.spec_for(&next.window_id).unwrap().bounds, Some(bounds));
    }

    #[test]
    fn test_open_external_checks_scheme() {
        let f = fixture(false);
        f.coordinator.open_external("https://example.com").unwrap();
        assert!(f.coordinator.open_external("file:///etc/hosts").is_err());
        assert_eq!(f.opener.opened(), vec!["https://example.com/".to_string()]);
    }
}
