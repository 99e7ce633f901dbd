//! Desktop session registry.
//!
//! Owns the bidirectional desktop <-> window map and the subscriptions that
//! tear desktops down. Every read-then-write of the map for a key happens
//! under that key's lock from the [`ResourceLockTable`]. Locks are always
//! taken desktop first, then window; `close_window` only takes the window
//! lock, which is why openers re-validate the mapping once they hold it.

mod desktop;

pub use desktop::{
    DesktopId, DesktopSession, OpenKind, OpenOutcome, OpenSessionRequest, WindowId,
};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client_session::ClientSession;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::locks::ResourceLockTable;
use crate::signals::{topics, SignalBus, SubscriptionHandle};
use crate::window::{mount_desktop, LabConfig, LabSpec, LabWindow, WidgetRef, WindowHost};

struct LabEntry {
    window: Arc<dyn LabWindow>,
    closed_subscription: SubscriptionHandle,
}

#[derive(Default)]
struct RegistryState {
    desktop_by_lab: HashMap<WindowId, DesktopId>,
    lab_by_desktop: HashMap<DesktopId, WindowId>,
    labs: HashMap<WindowId, LabEntry>,
    desktops: HashMap<DesktopId, DesktopSession>,
    close_subscriptions: HashMap<DesktopId, SubscriptionHandle>,
}

impl RegistryState {
    /// Drops every trace of `window_id`. Returns the window handle and the
    /// desktop it was showing.
    fn forget_lab(&mut self, window_id: &WindowId) -> (Option<Arc<dyn LabWindow>>, Option<DesktopId>) {
        let entry = self.labs.remove(window_id);
        if let Some(entry) = &entry {
            entry.closed_subscription.cancel();
        }
        let desktop_id = self.desktop_by_lab.remove(window_id);
        if let Some(desktop_id) = &desktop_id {
            if self.lab_by_desktop.get(desktop_id) == Some(window_id) {
                self.lab_by_desktop.remove(desktop_id);
                self.desktops.remove(desktop_id);
                if let Some(handle) = self.close_subscriptions.remove(desktop_id) {
                    handle.cancel();
                }
            }
        }
        (entry.map(|e| e.window), desktop_id)
    }
}

pub struct DesktopRegistry {
    host: Arc<dyn WindowHost>,
    locks: ResourceLockTable,
    bus: SignalBus,
    lab_config: LabConfig,
    theme_context: Option<String>,
    url: RwLock<String>,
    client_session: Option<Arc<ClientSession>>,
    state: Mutex<RegistryState>,
    lab_count: watch::Sender<usize>,
}

impl DesktopRegistry {
    pub fn new(
        host: Arc<dyn WindowHost>,
        locks: ResourceLockTable,
        bus: SignalBus,
        lab_config: LabConfig,
        client_session: Option<Arc<ClientSession>>,
    ) -> Arc<Self> {
        let theme_context = lab_config.theme_contexts.first().cloned();
        Arc::new(Self {
            host,
            locks,
            bus,
            lab_config,
            theme_context,
            url: RwLock::new("about:blank".to_string()),
            client_session,
            state: Mutex::new(RegistryState::default()),
            lab_count: watch::channel(0).0,
        })
    }

    /// URL every new window loads.
    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.write() = url.into();
    }

    pub fn url(&self) -> String {
        self.url.read().clone()
    }

    fn publish_count(&self, state: &RegistryState) {
        self.lab_count.send_replace(state.labs.len());
    }

    /// Creates and registers a window. Caller holds the window lock.
    async fn create_lab(self: &Arc<Self>, window_id: &WindowId) -> CoordinatorResult<Arc<dyn LabWindow>> {
        let bounds = self.client_session.as_ref().and_then(|session| {
            let (slot, bounds) = session.claim_window_slot(window_id);
            debug!("Window {} uses slot {}", window_id, slot);
            bounds
        });

        let spec = LabSpec {
            window_id: window_id.clone(),
            url: self.url(),
            feeds: self.lab_config.feeds_for(window_id),
            config: self.lab_config.clone(),
            bounds,
        };

        let window = match self.host.create_window(spec).await {
            Ok(window) => window,
            Err(e) => {
                warn!("Failed to create window {}: {}", window_id, e);
                self.release_slot(window_id);
                return Err(e.into());
            }
        };

        let closed_subscription = self.subscribe_lab_closed(window_id);
        let mut state = self.state.lock();
        state.labs.insert(
            window_id.clone(),
            LabEntry {
                window: window.clone(),
                closed_subscription,
            },
        );
        self.publish_count(&state);
        info!("Created window {}", window_id);
        Ok(window)
    }

    fn subscribe_lab_closed(self: &Arc<Self>, window_id: &WindowId) -> SubscriptionHandle {
        let registry = Arc::downgrade(self);
        let window_id = window_id.clone();
        self.bus
            .subscribe(topics::lab_closed(&window_id), move |_| {
                let registry = registry.clone();
                let window_id = window_id.clone();
                async move {
                    if let Some(registry) = registry.upgrade() {
                        registry.close_window(&window_id).await;
                    }
                }
            })
    }

    fn release_slot(&self, window_id: &WindowId) {
        if let Some(session) = &self.client_session {
            session.release_window_slot(window_id);
        }
    }

    /// Opens the first window of the process, not yet showing a desktop.
    pub async fn open_blank_window(self: &Arc<Self>) -> CoordinatorResult<WindowId> {
        let window_id = WindowId::generate();
        let _lab_guard = self.locks.lock(window_id.as_str()).await;
        self.create_lab(&window_id).await?;
        Ok(window_id)
    }

    /// Focuses the window already showing this desktop, or binds the desktop
    /// to a window (adopting `target_window` when it is free, creating one
    /// otherwise) and mounts it.
    pub async fn open_session(self: &Arc<Self>, request: OpenSessionRequest) -> CoordinatorResult<OpenOutcome> {
        let desktop_id = request.desktop_id();
        let _desktop_guard = self.locks.lock(desktop_id.as_str()).await;

        let existing = self.state.lock().lab_by_desktop.get(&desktop_id).cloned();
        if let Some(window_id) = existing {
            let _lab_guard = self.locks.lock(window_id.as_str()).await;
            let window = {
                let state = self.state.lock();
                match state.lab_by_desktop.get(&desktop_id) {
                    Some(current) if *current == window_id => {
                        state.labs.get(&window_id).map(|lab| lab.window.clone())
                    }
                    _ => None,
                }
            };
            match window {
                Some(window) => {
                    window.focus().await?;
                    info!("Desktop {} already open in {}, focused", desktop_id, window_id);
                    return Ok(OpenOutcome {
                        desktop_id,
                        window_id,
                        kind: OpenKind::Focused,
                    });
                }
                None => debug!("Window {} went away before focus, reopening {}", window_id, desktop_id),
            }
        }

        let (window_id, window, kind) = self.bind_window(&desktop_id, &request).await?;

        let root = request.root_widget.clone().unwrap_or_else(WidgetRef::desktop);
        if let Err(e) = mount_desktop(window.as_ref(), &desktop_id, &root, self.theme_context.as_deref()).await {
            warn!("Mounting {} in {} failed: {}", desktop_id, window_id, e);
            self.rollback_bind(&window_id, &desktop_id, kind).await;
            return Err(e.into());
        }

        {
            let mut state = self.state.lock();
            if let Some(session) = state.desktops.get_mut(&desktop_id) {
                session.root_widget = Some(root);
            }
        }
        self.register_close_subscription(&desktop_id);

        info!("Desktop {} opened in {} ({:?})", desktop_id, window_id, kind);
        Ok(OpenOutcome {
            desktop_id,
            window_id,
            kind,
        })
    }

    /// Picks the window for a new desktop and records the mapping while
    /// holding that window's lock.
    async fn bind_window(
        self: &Arc<Self>,
        desktop_id: &DesktopId,
        request: &OpenSessionRequest,
    ) -> CoordinatorResult<(WindowId, Arc<dyn LabWindow>, OpenKind)> {
        if let Some(target) = &request.target_window {
            let lab_guard = self.locks.lock(target.as_str()).await;
            let free = {
                let state = self.state.lock();
                match state.labs.get(target) {
                    Some(lab) if !state.desktop_by_lab.contains_key(target) => Some(lab.window.clone()),
                    _ => None,
                }
            };
            if let Some(window) = free {
                self.record_binding(target, desktop_id, request);
                drop(lab_guard);
                return Ok((target.clone(), window, OpenKind::Adopted));
            }
            debug!("Window {} is not free, creating a new one for {}", target, desktop_id);
        }

        let window_id = WindowId::generate();
        let _lab_guard = self.locks.lock(window_id.as_str()).await;
        let window = self.create_lab(&window_id).await?;
        self.record_binding(&window_id, desktop_id, request);
        Ok((window_id, window, OpenKind::Created))
    }

    fn record_binding(&self, window_id: &WindowId, desktop_id: &DesktopId, request: &OpenSessionRequest) {
        let mut state = self.state.lock();
        state.desktop_by_lab.insert(window_id.clone(), desktop_id.clone());
        state.lab_by_desktop.insert(desktop_id.clone(), window_id.clone());
        state.desktops.insert(
            desktop_id.clone(),
            DesktopSession {
                desktop_id: desktop_id.clone(),
                mandate: request.mandate.clone(),
                username: request.username.clone(),
                window_id: Some(window_id.clone()),
                root_widget: None,
                configuration: request.configuration.clone(),
            },
        );
    }

    /// Undoes a binding whose mount failed. Created windows are closed,
    /// adopted ones only lose the desktop.
    async fn rollback_bind(&self, window_id: &WindowId, desktop_id: &DesktopId, kind: OpenKind) {
        let _lab_guard = self.locks.lock(window_id.as_str()).await;
        let window = {
            let mut state = self.state.lock();
            if kind == OpenKind::Created {
                let (window, _) = state.forget_lab(window_id);
                self.publish_count(&state);
                window
            } else {
                state.desktop_by_lab.remove(window_id);
                state.lab_by_desktop.remove(desktop_id);
                state.desktops.remove(desktop_id);
                None
            }
        };
        if let Some(window) = window {
            self.release_slot(window_id);
            if let Err(e) = window.close().await {
                warn!("Failed to close window {} after rollback: {}", window_id, e);
            }
        }
    }

    /// Replaces any previous teardown subscription of `desktop_id`.
    fn register_close_subscription(self: &Arc<Self>, desktop_id: &DesktopId) {
        let previous = self.state.lock().close_subscriptions.remove(desktop_id);
        if let Some(previous) = previous {
            debug!("Dropping previous close subscription of {}", desktop_id);
            previous.cancel();
        }

        let registry = Arc::downgrade(self);
        let id = desktop_id.clone();
        let handle = self.bus.subscribe(topics::desktop_closed(desktop_id), move |_| {
            let registry = registry.clone();
            let desktop_id = id.clone();
            async move {
                if let Some(registry) = registry.upgrade() {
                    registry.on_desktop_closed(&desktop_id).await;
                }
            }
        });
        self.state
            .lock()
            .close_subscriptions
            .insert(desktop_id.clone(), handle);
    }

    async fn on_desktop_closed(self: &Arc<Self>, desktop_id: &DesktopId) {
        // Taking the handle is the guard against a second delivery.
        let Some(handle) = self.state.lock().close_subscriptions.remove(desktop_id) else {
            debug!("Desktop {} close already handled", desktop_id);
            return;
        };
        handle.cancel();

        let window_id = self.state.lock().lab_by_desktop.get(desktop_id).cloned();
        let Some(window_id) = window_id else {
            return;
        };
        info!("Desktop {} asked to close, closing {}", desktop_id, window_id);
        if let Err(e) = self.close_session(&window_id, desktop_id).await {
            warn!("Closing desktop {} failed: {}", desktop_id, e);
            if self.window_for(desktop_id).is_some() {
                self.register_close_subscription(desktop_id);
            }
        }
    }

    /// Closes the window showing `desktop_id`. Returns `false` when there was
    /// nothing left to close.
    pub async fn close_session(&self, window_id: &WindowId, desktop_id: &DesktopId) -> CoordinatorResult<bool> {
        let _desktop_guard = self.locks.lock(desktop_id.as_str()).await;
        let _lab_guard = self.locks.lock(window_id.as_str()).await;

        let window = {
            let state = self.state.lock();
            let bound = state.desktop_by_lab.get(window_id) == Some(desktop_id);
            if bound {
                state.labs.get(window_id).map(|lab| lab.window.clone())
            } else {
                None
            }
        };
        let Some(window) = window else {
            debug!("Desktop {} is not open in {}, nothing to close", desktop_id, window_id);
            return Ok(false);
        };

        if let Err(e) = window.unlisten(desktop_id).await {
            debug!("Unlisten of {} on {} failed: {}", desktop_id, window_id, e);
        }
        // forget_lab drops the close subscription, so a failed close leaves it armed.
        window.close().await?;

        {
            let mut state = self.state.lock();
            state.forget_lab(window_id);
            self.publish_count(&state);
        }
        self.release_slot(window_id);
        info!("Closed desktop {} and window {}", desktop_id, window_id);
        Ok(true)
    }

    /// Forgets a window the host already tore down.
    pub async fn close_window(&self, window_id: &WindowId) {
        let _lab_guard = self.locks.lock(window_id.as_str()).await;
        let forgotten = {
            let mut state = self.state.lock();
            let (window, desktop_id) = state.forget_lab(window_id);
            self.publish_count(&state);
            window.map(|_| desktop_id)
        };
        match forgotten {
            Some(desktop_id) => {
                self.release_slot(window_id);
                info!("Window {} closed (desktop {:?})", window_id, desktop_id);
            }
            None => debug!("Window {} already forgotten", window_id),
        }
    }

    /// Closes a window whatever it shows; used when a login is cancelled.
    pub async fn discard_window(&self, window_id: &WindowId) -> CoordinatorResult<()> {
        let bound = self.state.lock().desktop_by_lab.get(window_id).cloned();
        if let Some(desktop_id) = bound {
            self.close_session(window_id, &desktop_id).await?;
            return Ok(());
        }

        let _lab_guard = self.locks.lock(window_id.as_str()).await;
        let window = {
            let mut state = self.state.lock();
            if state.desktop_by_lab.contains_key(window_id) {
                return Err(CoordinatorError::UnknownWindow(window_id.clone()));
            }
            let (window, _) = state.forget_lab(window_id);
            self.publish_count(&state);
            window
        };
        let Some(window) = window else {
            return Ok(());
        };
        self.release_slot(window_id);
        window.close().await?;
        info!("Discarded window {}", window_id);
        Ok(())
    }

    /// Diagnostic read of the open desktops, sorted.
    pub fn open_desktop_ids(&self) -> Vec<DesktopId> {
        let mut ids: Vec<DesktopId> = self.state.lock().lab_by_desktop.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn window_for(&self, desktop_id: &DesktopId) -> Option<WindowId> {
        self.state.lock().lab_by_desktop.get(desktop_id).cloned()
    }

    pub fn desktop_for(&self, window_id: &WindowId) -> Option<DesktopId> {
        self.state.lock().desktop_by_lab.get(window_id).cloned()
    }

    pub fn session(&self, desktop_id: &DesktopId) -> Option<DesktopSession> {
        self.state.lock().desktops.get(desktop_id).cloned()
    }

    pub fn window_count(&self) -> usize {
        self.state.lock().labs.len()
    }

    pub fn has_close_subscription(&self, desktop_id: &DesktopId) -> bool {
        self.state.lock().close_subscriptions.contains_key(desktop_id)
    }

    /// Resolves once no window is left.
    pub async fn wait_all_closed(&self) {
        let mut count = self.lab_count.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = count.wait_for(|n| *n == 0).await;
    }
}
