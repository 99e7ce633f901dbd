//! Window handle ("lab") abstraction.
//!
//! The GUI host owns the real windows; the coordinator only sees the
//! [`LabWindow`] protocol. A desktop is mounted with `listen -> set_feed ->
//! set_root` and dismounted with `unlisten` before the window is closed.
//! Hosts announce that a window is gone by publishing
//! [`crate::signals::topics::lab_closed`] on the signal bus.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WindowError;
use crate::registry::{DesktopId, WindowId};

/// Static feed list and presentation flags shared by every lab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabConfig {
    pub feeds: Vec<String>,
    pub theme_contexts: Vec<String>,
    pub fullscreen: bool,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            feeds: vec!["workshop".to_string(), "nabu".to_string(), "tx".to_string()],
            theme_contexts: vec!["default".to_string()],
            fullscreen: false,
        }
    }
}

impl LabConfig {
    /// Feed list for one window: its own feed first, then the static feeds.
    pub fn feeds_for(&self, window_id: &WindowId) -> Vec<String> {
        std::iter::once(window_id.to_string())
            .chain(self.feeds.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub maximized: bool,
}

/// Everything the host needs to create one window.
#[derive(Debug, Clone)]
pub struct LabSpec {
    pub window_id: WindowId,
    pub url: String,
    pub feeds: Vec<String>,
    pub config: LabConfig,
    pub bounds: Option<WindowBounds>,
}

/// Opaque root widget descriptor handed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetRef {
    pub widget: String,
    #[serde(default)]
    pub props: Value,
}

impl WidgetRef {
    pub fn new(widget: impl Into<String>) -> Self {
        Self {
            widget: widget.into(),
            props: Value::Null,
        }
    }

    pub fn desktop() -> Self {
        Self::new("desktop")
    }
}

#[async_trait]
pub trait LabWindow: Send + Sync {
    fn id(&self) -> &WindowId;

    async fn listen(&self, desktop_id: &DesktopId) -> Result<(), WindowError>;

    async fn unlisten(&self, desktop_id: &DesktopId) -> Result<(), WindowError>;

    async fn set_feed(&self, desktop_id: &DesktopId) -> Result<(), WindowError>;

    async fn set_root(
        &self,
        widget: &WidgetRef,
        widget_id: &str,
        theme_context: Option<&str>,
    ) -> Result<(), WindowError>;

    async fn focus(&self) -> Result<(), WindowError>;

    async fn close(&self) -> Result<(), WindowError>;
}

#[async_trait]
pub trait WindowHost: Send + Sync {
    async fn create_window(&self, spec: LabSpec) -> Result<Arc<dyn LabWindow>, WindowError>;
}

/// Mounts a desktop in a window in protocol order.
pub async fn mount_desktop(
    window: &dyn LabWindow,
    desktop_id: &DesktopId,
    root: &WidgetRef,
    theme_context: Option<&str>,
) -> Result<(), WindowError> {
    window.listen(desktop_id).await?;
    window.set_feed(desktop_id).await?;
    window.set_root(root, desktop_id.as_str(), theme_context).await
}
