use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::app::{APP_ID, CONFIG_FILE_NAME};
use crate::window::LabConfig;

/// Client configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Application whose desktops this shell opens (also the per-app
    /// settings namespace)
    pub main_app: String,

    /// Context navigated to once a configured desktop is mounted
    pub context_id: Option<String>,

    /// Run the configurator (login -> configure -> open) instead of opening
    /// the default desktop directly
    pub use_configurator: bool,

    /// Mandate used in direct mode
    pub default_mandate: String,

    /// Root of `var/` (refresh credential, client sessions)
    pub app_root: Option<PathBuf>,

    pub supported_locales: Vec<String>,

    /// tracing level name
    pub log_level: String,

    pub lab: LabSettings,

    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabSettings {
    pub feeds: Vec<String>,
    pub theme_context: String,
    pub fullscreen: bool,
    pub default_width: u32,
    pub default_height: u32,
}

/// Identity provider endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub issuer: String,
    pub client_id: String,
    /// Authorization page shown in the browser
    pub login_target: String,
    pub scopes: Vec<String>,
    /// Seconds to wait for the browser redirect before giving up
    pub login_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            main_app: "portal".to_string(),
            context_id: None,
            use_configurator: false,
            default_mandate: "local".to_string(),
            app_root: None,
            supported_locales: vec!["en-US".to_string(), "fr-CH".to_string(), "de-CH".to_string()],
            log_level: "info".to_string(),
            lab: LabSettings::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Default for LabSettings {
    fn default() -> Self {
        let lab = LabConfig::default();
        Self {
            feeds: lab.feeds,
            theme_context: "default".to_string(),
            fullscreen: false,
            default_width: 1280,
            default_height: 800,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "https://id.labdesk.local/realms/labdesk/protocol/openid-connect".to_string(),
            client_id: APP_ID.to_string(),
            login_target: "https://id.labdesk.local/realms/labdesk/protocol/openid-connect/auth".to_string(),
            scopes: vec!["openid".to_string(), "profile".to_string(), "offline_access".to_string()],
            login_timeout_secs: 300,
        }
    }
}

impl LabSettings {
    pub fn lab_config(&self) -> LabConfig {
        LabConfig {
            feeds: self.feeds.clone(),
            theme_contexts: vec![self.theme_context.clone()],
            fullscreen: self.fullscreen,
        }
    }
}

impl AuthConfig {
    pub fn token_endpoint(&self) -> String {
        format!("{}/token", self.issuer.trim_end_matches('/'))
    }

    pub fn userinfo_endpoint(&self) -> String {
        format!("{}/userinfo", self.issuer.trim_end_matches('/'))
    }
}

impl ClientConfig {
    /// Load from the default location. Missing or unreadable files give the
    /// defaults.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => {
                warn!("No config directory on this platform, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!("No client config at {:?}, using defaults", path);
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded client config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Malformed client config {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read client config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// `<config_dir>/<APP_ID>/client.config.json`
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_ID).join(CONFIG_FILE_NAME))
    }

    pub fn paths(&self) -> AppPaths {
        let root = self
            .app_root
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join(APP_ID)))
            .unwrap_or_else(|| std::env::temp_dir().join(APP_ID));
        AppPaths::new(root)
    }
}

/// On-disk layout under the application root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn refresh_token(&self) -> PathBuf {
        self.root.join("var").join("passport").join("refresh.tkn")
    }

    pub fn client_sessions(&self) -> PathBuf {
        self.root.join("var").join("client-sessions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from(&dir.path().join("client.config.json"));
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.config.json");
        std::fs::write(
            &path,
            r#"{ "main_app": "crm", "use_configurator": true, "auth": { "client_id": "crm-desktop" } }"#,
        )
        .unwrap();

        let config = ClientConfig::load_from(&path);
        assert_eq!(config.main_app, "crm");
        assert!(config.use_configurator);
        assert_eq!(config.auth.client_id, "crm-desktop");
        assert_eq!(config.auth.login_timeout_secs, 300);
        assert_eq!(config.lab, LabSettings::default());
    }

    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(ClientConfig::load_from(&path), ClientConfig::default());
    }

    #[test]
    fn test_app_paths() {
        let config = ClientConfig {
            app_root: Some(PathBuf::from("/opt/labdesk")),
            ..ClientConfig::default()
        };
        let paths = config.paths();
        assert_eq!(paths.refresh_token(), PathBuf::from("/opt/labdesk/var/passport/refresh.tkn"));
        assert_eq!(paths.client_sessions(), PathBuf::from("/opt/labdesk/var/client-sessions"));
    }

    #[test]
    fn test_endpoints_trim_trailing_slash() {
        let auth = AuthConfig {
            issuer: "https://id.example/oidc/".to_string(),
            ..AuthConfig::default()
        };
        assert_eq!(auth.token_endpoint(), "https://id.example/oidc/token");
        assert_eq!(auth.userinfo_endpoint(), "https://id.example/oidc/userinfo");
    }
}
