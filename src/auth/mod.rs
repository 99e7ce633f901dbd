//! Login state machine.
//!
//! ```text
//! NoCredential -> AttemptingRefresh -> Renewed
//!                                   -> RefreshFailed -> InteractiveLogin -> Renewed | Cancelled | Failed
//! ```
//!
//! A failed refresh never surfaces as an error, it only moves on to the
//! interactive login. Nothing is written to disk unless the attempt ends in
//! `Renewed`.

pub mod http;
pub mod store;
pub mod token;

pub use http::HttpAuthProvider;
pub use store::RefreshTokenStore;
pub use token::AccessToken;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::AuthError;

const NONCE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthPhase {
    NoCredential,
    AttemptingRefresh,
    Renewed,
    RefreshFailed,
    InteractiveLogin,
    Cancelled,
    Failed,
}

/// Terminal result of one login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStatus {
    Renewed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub subject: String,
    pub name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Whatever the provider's user data endpoint returned.
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginOutcome {
    pub info: Option<UserInfo>,
    pub status: AuthStatus,
}

impl LoginOutcome {
    fn without_info(status: AuthStatus) -> Self {
        Self { info: None, status }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatus {
    Granted,
    Rejected,
    /// The user dismissed the interactive flow.
    Cancelled,
}

/// What the identity provider answered to a token request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub status: GrantStatus,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
}

impl Grant {
    pub fn granted(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            status: GrantStatus::Granted,
            refresh_token,
            access_token: Some(access_token.into()),
        }
    }

    pub fn rejected() -> Self {
        Self {
            status: GrantStatus::Rejected,
            refresh_token: None,
            access_token: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: GrantStatus::Cancelled,
            refresh_token: None,
            access_token: None,
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Interactive login. `nonce` must come back in the access credential.
    async fn request_token(&self, nonce: &str, login_target: &str) -> Result<Grant, AuthError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<Grant, AuthError>;

    async fn user_data(&self, access_token: &str) -> Result<Value, AuthError>;
}

pub fn generate_nonce() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect()
}

pub struct AuthManager {
    provider: Arc<dyn AuthProvider>,
    store: RefreshTokenStore,
    login_target: String,
    phase: Mutex<AuthPhase>,
    access: RwLock<Option<AccessToken>>,
}

impl AuthManager {
    pub fn new(provider: Arc<dyn AuthProvider>, store: RefreshTokenStore, login_target: impl Into<String>) -> Self {
        Self {
            provider,
            store,
            login_target: login_target.into(),
            phase: Mutex::new(AuthPhase::NoCredential),
            access: RwLock::new(None),
        }
    }

    pub fn phase(&self) -> AuthPhase {
        *self.phase.lock()
    }

    fn enter(&self, phase: AuthPhase) {
        let mut current = self.phase.lock();
        debug!("Auth {:?} -> {:?}", *current, phase);
        *current = phase;
    }

    /// Current access credential, if the last login renewed one.
    pub fn access_token(&self) -> Option<AccessToken> {
        self.access.read().clone()
    }

    /// Silent refresh first, interactive login when that is not possible.
    pub async fn login(&self) -> LoginOutcome {
        self.enter(AuthPhase::NoCredential);

        let refresh = match self.store.load() {
            Ok(refresh) => refresh,
            Err(e) => {
                warn!("Could not read refresh credential: {}", e);
                None
            }
        };

        if let Some(refresh) = refresh {
            self.enter(AuthPhase::AttemptingRefresh);
            match self.try_refresh(&refresh).await {
                Ok(info) => {
                    self.enter(AuthPhase::Renewed);
                    info!("Session renewed silently for {}", info.subject);
                    return LoginOutcome {
                        info: Some(info),
                        status: AuthStatus::Renewed,
                    };
                }
                Err(reason) => {
                    info!("Refresh failed ({}), falling back to interactive login", reason);
                    self.enter(AuthPhase::RefreshFailed);
                }
            }
        }

        self.interactive().await
    }

    async fn try_refresh(&self, refresh: &str) -> Result<UserInfo, String> {
        let grant = self
            .provider
            .refresh_token(refresh)
            .await
            .map_err(|e| e.to_string())?;
        if grant.status != GrantStatus::Granted {
            return Err(format!("{:?}", grant.status));
        }
        let access = grant
            .access_token
            .as_deref()
            .ok_or_else(|| "no access credential".to_string())
            .and_then(|raw| AccessToken::decode(raw).map_err(|e| e.to_string()))?;
        let info = self.user_info(&access).await.map_err(|e| e.to_string())?;

        // Providers that do not rotate refresh credentials keep the old one.
        if let Some(rotated) = &grant.refresh_token {
            self.store.save(rotated).map_err(|e| e.to_string())?;
        }
        *self.access.write() = Some(access);
        Ok(info)
    }

    async fn interactive(&self) -> LoginOutcome {
        self.enter(AuthPhase::InteractiveLogin);
        let nonce = generate_nonce();

        let grant = match self.provider.request_token(&nonce, &self.login_target).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!("Interactive login failed: {}", e);
                return self.fail();
            }
        };

        match grant.status {
            GrantStatus::Cancelled => {
                self.enter(AuthPhase::Cancelled);
                info!("Interactive login cancelled by the user");
                return LoginOutcome::without_info(AuthStatus::Cancelled);
            }
            GrantStatus::Rejected => {
                warn!("Identity provider rejected the login");
                return self.fail();
            }
            GrantStatus::Granted => {}
        }

        let (Some(raw_access), Some(refresh)) = (grant.access_token.as_deref(), grant.refresh_token.as_deref()) else {
            warn!("Login granted without both credentials");
            return self.fail();
        };
        let access = match AccessToken::decode(raw_access) {
            Ok(access) => access,
            Err(e) => {
                warn!("Login returned a bad access credential: {}", e);
                return self.fail();
            }
        };
        if access.nonce() != Some(nonce.as_str()) {
            warn!("Login nonce mismatch, discarding credentials");
            return self.fail();
        }
        let info = match self.user_info(&access).await {
            Ok(info) => info,
            Err(e) => {
                warn!("Could not fetch user data: {}", e);
                return self.fail();
            }
        };

        if let Err(e) = self.store.save(refresh) {
            warn!("Could not persist refresh credential: {}", e);
            return self.fail();
        }
        *self.access.write() = Some(access);
        self.enter(AuthPhase::Renewed);
        info!("Logged in as {}", info.subject);
        LoginOutcome {
            info: Some(info),
            status: AuthStatus::Renewed,
        }
    }

    fn fail(&self) -> LoginOutcome {
        self.enter(AuthPhase::Failed);
        LoginOutcome::without_info(AuthStatus::Failed)
    }

    async fn user_info(&self, access: &AccessToken) -> Result<UserInfo, AuthError> {
        let data = self.provider.user_data(access.as_str()).await?;
        let name = access.display_name().map(str::to_string).or_else(|| {
            data.get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Ok(UserInfo {
            subject: access.subject().to_string(),
            name,
            expires_at: access.expires_at(),
            data,
        })
    }

    /// Forgets the refresh credential. Safe to call when logged out.
    pub fn logout(&self) -> Result<bool, AuthError> {
        *self.access.write() = None;
        self.enter(AuthPhase::NoCredential);
        self.store.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::encode_for_test;
    use crate::test_support::FakeAuthProvider;
    use serde_json::json;

    fn manager(provider: &FakeAuthProvider, dir: &tempfile::TempDir) -> AuthManager {
        AuthManager::new(
            Arc::new(provider.clone()),
            RefreshTokenStore::new(dir.path().join("var/passport/refresh.tkn")),
            "https://id.example/login",
        )
    }

    #[tokio::test]
    async fn test_valid_refresh_renews_without_interaction() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeAuthProvider::new();
        provider.on_refresh(Grant::granted(
            encode_for_test(json!({ "sub": "u-1", "name": "Alice" })),
            Some("rotated".to_string()),
        ));
        let auth = manager(&provider, &dir);
        RefreshTokenStore::new(dir.path().join("var/passport/refresh.tkn"))
            .save("stored")
            .unwrap();

        let outcome = auth.login().await;
        assert_eq!(outcome.status, AuthStatus::Renewed);
        assert_eq!(outcome.info.unwrap().name.as_deref(), Some("Alice"));
        assert_eq!(provider.interactive_calls(), 0);
        assert_eq!(provider.refreshed_with(), vec!["stored".to_string()]);
        assert_eq!(auth.phase(), AuthPhase::Renewed);
        assert_eq!(auth.store.load().unwrap().as_deref(), Some("rotated"));
    }

    #[tokio::test]
    async fn test_missing_refresh_goes_interactive() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeAuthProvider::new();
        provider.on_interactive(|nonce| {
            Grant::granted(
                encode_for_test(json!({ "sub": "u-2", "nonce": nonce })),
                Some("fresh".to_string()),
            )
        });
        let auth = manager(&provider, &dir);

        let outcome = auth.login().await;
        assert_eq!(outcome.status, AuthStatus::Renewed);
        assert_eq!(provider.interactive_calls(), 1);
        assert!(provider.refreshed_with().is_empty());
        assert_eq!(auth.store.load().unwrap().as_deref(), Some("fresh"));
        assert!(auth.access_token().is_some());
    }

    #[tokio::test]
    async fn test_rejected_refresh_goes_interactive() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeAuthProvider::new();
        provider.on_refresh(Grant::rejected());
        provider.on_interactive(|_| Grant::cancelled());
        let auth = manager(&provider, &dir);
        auth.store.save("stale").unwrap();

        let outcome = auth.login().await;
        assert_eq!(outcome, LoginOutcome::without_info(AuthStatus::Cancelled));
        assert_eq!(provider.interactive_calls(), 1);
        assert_eq!(auth.phase(), AuthPhase::Cancelled);
        // a cancelled attempt leaves the stored credential alone
        assert_eq!(auth.store.load().unwrap().as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn test_nonce_mismatch_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeAuthProvider::new();
        provider.on_interactive(|_| {
            Grant::granted(
                encode_for_test(json!({ "sub": "u-3", "nonce": "someone-else" })),
                Some("fresh".to_string()),
            )
        });
        let auth = manager(&provider, &dir);

        let outcome = auth.login().await;
        assert_eq!(outcome.status, AuthStatus::Failed);
        assert!(outcome.info.is_none());
        assert_eq!(auth.store.load().unwrap(), None);
        assert!(auth.access_token().is_none());
    }

    #[tokio::test]
    async fn test_malformed_credential_fails() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeAuthProvider::new();
        provider.on_interactive(|_| Grant::granted("garbage", Some("fresh".to_string())));
        let auth = manager(&provider, &dir);

        assert_eq!(auth.login().await.status, AuthStatus::Failed);
        assert_eq!(auth.phase(), AuthPhase::Failed);
        assert_eq!(auth.store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn test_logout_deletes_refresh_credential() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FakeAuthProvider::new();
        let auth = manager(&provider, &dir);
        auth.store.save("stored").unwrap();

        assert!(auth.logout().unwrap());
        assert!(!auth.logout().unwrap());
        assert_eq!(auth.store.load().unwrap(), None);
    }

    #[test]
    fn test_nonce_is_random() {
        let a = generate_nonce();
        assert_eq!(a.len(), NONCE_LEN);
        assert_ne!(a, generate_nonce());
    }
}
