//! Recording fakes for the collaborator traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use serde_json::{json, Value};

use crate::auth::{AuthProvider, Grant, UserInfo};
use crate::bootstrap::{AssetLocation, AssetResolver, DesktopConfigurator};
use crate::error::{AssetError, AuthError, CoordinatorResult, ShellError, WindowError};
use crate::registry::{DesktopId, OpenSessionRequest, WindowId};
use crate::relaunch::Relauncher;
use crate::shell::ExternalOpener;
use crate::window::{LabSpec, LabWindow, WidgetRef, WindowHost};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Create,
    Listen(DesktopId),
    Unlisten(DesktopId),
    SetFeed(DesktopId),
    SetRoot(String),
    Focus,
    Close,
}

#[derive(Default)]
struct HostState {
    created: Vec<WindowId>,
    specs: HashMap<WindowId, LabSpec>,
    calls: Vec<(WindowId, HostCall)>,
}

#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
    fail_create: Arc<AtomicBool>,
    fail_set_root: Arc<AtomicBool>,
    fail_close: Arc<AtomicBool>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_set_root(&self, fail: bool) {
        self.fail_set_root.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<WindowId> {
        self.state.lock().created.clone()
    }

    pub fn spec_for(&self, window_id: &WindowId) -> Option<LabSpec> {
        self.state.lock().specs.get(window_id).cloned()
    }

    pub fn calls_for(&self, window_id: &WindowId) -> Vec<HostCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(id, _)| id == window_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    fn record(&self, window_id: &WindowId, call: HostCall) {
        self.state.lock().calls.push((window_id.clone(), call));
    }
}

#[async_trait]
impl WindowHost for FakeHost {
    async fn create_window(&self, spec: LabSpec) -> Result<Arc<dyn LabWindow>, WindowError> {
        // window creation is a suspension point
        tokio::task::yield_now().await;

        let window_id = spec.window_id.clone();
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(WindowError::Create {
                window: window_id,
                reason: "host refused".to_string(),
            });
        }

        {
            let mut state = self.state.lock();
            state.created.push(window_id.clone());
            state.specs.insert(window_id.clone(), spec);
        }
        self.record(&window_id, HostCall::Create);
        Ok(Arc::new(FakeLab {
            id: window_id,
            host: self.clone(),
        }))
    }
}

pub struct FakeLab {
    id: WindowId,
    host: FakeHost,
}

#[async_trait]
impl LabWindow for FakeLab {
    fn id(&self) -> &WindowId {
        &self.id
    }

    async fn listen(&self, desktop_id: &DesktopId) -> Result<(), WindowError> {
        self.host.record(&self.id, HostCall::Listen(desktop_id.clone()));
        Ok(())
    }

    async fn unlisten(&self, desktop_id: &DesktopId) -> Result<(), WindowError> {
        self.host.record(&self.id, HostCall::Unlisten(desktop_id.clone()));
        Ok(())
    }

    async fn set_feed(&self, desktop_id: &DesktopId) -> Result<(), WindowError> {
        self.host.record(&self.id, HostCall::SetFeed(desktop_id.clone()));
        Ok(())
    }

    async fn set_root(
        &self,
        _widget: &WidgetRef,
        widget_id: &str,
        _theme_context: Option<&str>,
    ) -> Result<(), WindowError> {
        tokio::task::yield_now().await;
        if self.host.fail_set_root.load(Ordering::SeqCst) {
            return Err(WindowError::Operation {
                window: self.id.clone(),
                op: "set_root",
                reason: "renderer crashed".to_string(),
            });
        }
        self.host.record(&self.id, HostCall::SetRoot(widget_id.to_string()));
        Ok(())
    }

    async fn focus(&self) -> Result<(), WindowError> {
        self.host.record(&self.id, HostCall::Focus);
        Ok(())
    }

    async fn close(&self) -> Result<(), WindowError> {
        if self.host.fail_close.load(Ordering::SeqCst) {
            return Err(WindowError::Operation {
                window: self.id.clone(),
                op: "close",
                reason: "window is busy".to_string(),
            });
        }
        self.host.record(&self.id, HostCall::Close);
        Ok(())
    }
}

type InteractiveFn = Arc<dyn Fn(&str) -> Grant + Send + Sync>;

#[derive(Clone)]
pub struct FakeAuthProvider {
    refresh: Arc<Mutex<Grant>>,
    interactive: Arc<Mutex<InteractiveFn>>,
    interactive_calls: Arc<AtomicUsize>,
    refreshed_with: Arc<Mutex<Vec<String>>>,
}

impl FakeAuthProvider {
    /// Rejects everything until told otherwise.
    pub fn new() -> Self {
        let reject: InteractiveFn = Arc::new(|_: &str| Grant::rejected());
        Self {
            refresh: Arc::new(Mutex::new(Grant::rejected())),
            interactive: Arc::new(Mutex::new(reject)),
            interactive_calls: Arc::new(AtomicUsize::new(0)),
            refreshed_with: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn on_refresh(&self, grant: Grant) {
        *self.refresh.lock() = grant;
    }

    pub fn on_interactive<F>(&self, f: F)
    where
        F: Fn(&str) -> Grant + Send + Sync + 'static,
    {
        let f: InteractiveFn = Arc::new(f);
        *self.interactive.lock() = f;
    }

    pub fn interactive_calls(&self) -> usize {
        self.interactive_calls.load(Ordering::SeqCst)
    }

    pub fn refreshed_with(&self) -> Vec<String> {
        self.refreshed_with.lock().clone()
    }
}

#[async_trait]
impl AuthProvider for FakeAuthProvider {
    async fn request_token(&self, nonce: &str, _login_target: &str) -> Result<Grant, AuthError> {
        self.interactive_calls.fetch_add(1, Ordering::SeqCst);
        let f = self.interactive.lock().clone();
        Ok(f(nonce))
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<Grant, AuthError> {
        self.refreshed_with.lock().push(refresh_token.to_string());
        Ok(self.refresh.lock().clone())
    }

    async fn user_data(&self, _access_token: &str) -> Result<Value, AuthError> {
        Ok(json!({}))
    }
}

#[derive(Clone, Default)]
pub struct FakeRelauncher {
    launches: Arc<Mutex<Vec<Vec<String>>>>,
    fail_next: Arc<AtomicBool>,
}

impl FakeRelauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<Vec<String>> {
        self.launches.lock().clone()
    }

    /// The next relaunch fails to spawn.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Relauncher for FakeRelauncher {
    fn relaunch(&self, args: Vec<String>) -> std::io::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "executable missing"));
        }
        self.launches.lock().push(args);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeOpener {
    opened: Arc<Mutex<Vec<String>>>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl ExternalOpener for FakeOpener {
    fn open_url(&self, url: &Url) -> Result<(), ShellError> {
        self.opened.lock().push(url.to_string());
        Ok(())
    }
}

pub struct FakeAssets {
    location: AssetLocation,
}

impl FakeAssets {
    pub fn dev_server(port: u16) -> Self {
        Self {
            location: AssetLocation::DevServer { port },
        }
    }
}

#[async_trait]
impl AssetResolver for FakeAssets {
    async fn resolve(&self) -> Result<AssetLocation, AssetError> {
        tokio::task::yield_now().await;
        Ok(self.location.clone())
    }
}

#[derive(Clone)]
pub struct FakeConfigurator {
    answer: Option<OpenSessionRequest>,
    users: Arc<Mutex<Vec<String>>>,
    navigations: Arc<Mutex<Vec<(DesktopId, String)>>>,
}

impl FakeConfigurator {
    /// Answers every `configure` with `answer`.
    pub fn new(answer: Option<OpenSessionRequest>) -> Self {
        Self {
            answer,
            users: Arc::new(Mutex::new(Vec::new())),
            navigations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn configured_users(&self) -> Vec<String> {
        self.users.lock().clone()
    }

    pub fn navigations(&self) -> Vec<(DesktopId, String)> {
        self.navigations.lock().clone()
    }
}

#[async_trait]
impl DesktopConfigurator for FakeConfigurator {
    async fn configure(&self, _window_id: &WindowId, user: &UserInfo) -> CoordinatorResult<Option<OpenSessionRequest>> {
        self.users.lock().push(user.subject.clone());
        Ok(self.answer.clone())
    }

    async fn navigate_to_context(&self, desktop_id: &DesktopId, context_id: &str) -> CoordinatorResult<()> {
        self.navigations
            .lock()
            .push((desktop_id.clone(), context_id.to_string()));
        Ok(())
    }
}
