//! Tauri implementation of the window host and the shell opener.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use serde_json::json;
use tauri::{AppHandle, Emitter, EventTarget, WebviewUrl, WebviewWindow, WebviewWindowBuilder, WindowEvent};
use tauri_plugin_shell::ShellExt;
use tracing::{debug, info};

use crate::app::APP_NAME;
use crate::error::{ShellError, WindowError};
use crate::registry::{DesktopId, WindowId};
use crate::shell::ExternalOpener;
use crate::signals::{topics, SignalBus};
use crate::window::{LabSpec, LabWindow, WidgetRef, WindowHost};

pub struct TauriWindowHost {
    app: AppHandle,
    bus: SignalBus,
    default_size: (u32, u32),
}

impl TauriWindowHost {
    pub fn new(app: AppHandle, bus: SignalBus, default_size: (u32, u32)) -> Self {
        Self {
            app,
            bus,
            default_size,
        }
    }
}

#[async_trait]
impl WindowHost for TauriWindowHost {
    async fn create_window(&self, spec: LabSpec) -> Result<Arc<dyn LabWindow>, WindowError> {
        let create_error = |reason: String| WindowError::Create {
            window: spec.window_id.clone(),
            reason,
        };

        let url: tauri::Url = spec.url.parse().map_err(|e| create_error(format!("bad url {}: {}", spec.url, e)))?;
        let label = spec.window_id.label();
        // The UI reads its window id and feeds from here before mounting.
        let init = format!(
            "window.__LAB__ = {};",
            json!({ "id": spec.window_id, "feeds": spec.feeds, "config": spec.config })
        );

        let mut builder = WebviewWindowBuilder::new(&self.app, &label, WebviewUrl::External(url))
            .title(APP_NAME)
            .initialization_script(&init)
            .fullscreen(spec.config.fullscreen);
        builder = match spec.bounds {
            Some(bounds) => builder
                .inner_size(bounds.width as f64, bounds.height as f64)
                .position(bounds.x as f64, bounds.y as f64)
                .maximized(bounds.maximized),
            None => builder.inner_size(self.default_size.0 as f64, self.default_size.1 as f64),
        };
        let window = builder.build().map_err(|e| create_error(e.to_string()))?;

        let bus = self.bus.clone();
        let topic = topics::lab_closed(&spec.window_id);
        let window_id = spec.window_id.clone();
        window.on_window_event(move |event| {
            if let WindowEvent::Destroyed = event {
                // Window events fire on the main thread, outside the runtime.
                let bus = bus.clone();
                let topic = topic.clone();
                let payload = json!({ "windowId": window_id });
                tauri::async_runtime::spawn(async move {
                    bus.emit(&topic, payload).await;
                });
            }
        });

        info!("Created window {} ({})", spec.window_id, label);
        Ok(Arc::new(TauriLab {
            id: spec.window_id,
            label,
            window,
        }))
    }
}

pub struct TauriLab {
    id: WindowId,
    label: String,
    window: WebviewWindow,
}

impl TauriLab {
    fn send(&self, op: &'static str, payload: serde_json::Value) -> Result<(), WindowError> {
        debug!("{} <- {}", self.id, op);
        self.window
            .emit_to(
                EventTarget::WebviewWindow {
                    label: self.label.clone(),
                },
                &format!("lab:{}", op),
                payload,
            )
            .map_err(|e| self.op_error(op, e))
    }

    fn op_error(&self, op: &'static str, e: tauri::Error) -> WindowError {
        WindowError::Operation {
            window: self.id.clone(),
            op,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl LabWindow for TauriLab {
    fn id(&self) -> &WindowId {
        &self.id
    }

    async fn listen(&self, desktop_id: &DesktopId) -> Result<(), WindowError> {
        self.send("listen", json!({ "desktopId": desktop_id }))
    }

    async fn unlisten(&self, desktop_id: &DesktopId) -> Result<(), WindowError> {
        self.send("unlisten", json!({ "desktopId": desktop_id }))
    }

    async fn set_feed(&self, desktop_id: &DesktopId) -> Result<(), WindowError> {
        self.send("set-feed", json!({ "desktopId": desktop_id }))
    }

    async fn set_root(
        &self,
        widget: &WidgetRef,
        widget_id: &str,
        theme_context: Option<&str>,
    ) -> Result<(), WindowError> {
        self.send(
            "set-root",
            json!({ "widget": widget, "widgetId": widget_id, "themeContext": theme_context }),
        )
    }

    async fn focus(&self) -> Result<(), WindowError> {
        self.window.set_focus().map_err(|e| self.op_error("focus", e))
    }

    async fn close(&self) -> Result<(), WindowError> {
        self.window.close().map_err(|e| self.op_error("close", e))
    }
}

pub struct TauriOpener {
    app: AppHandle,
}

impl TauriOpener {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl ExternalOpener for TauriOpener {
    #[allow(deprecated)]
    fn open_url(&self, url: &Url) -> Result<(), ShellError> {
        self.app
            .shell()
            .open(url.as_str(), None)
            .map_err(|e| ShellError::Open {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}
