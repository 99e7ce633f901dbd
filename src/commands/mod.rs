use std::sync::Arc;

use tauri::State;
use tracing::info;

use crate::auth::LoginOutcome;
use crate::client_session::{ClientSettings, SortDirection};
use crate::coordinator::{Coordinator, OpenSessionArgs};
use crate::registry::{OpenOutcome, WindowId};
use crate::window::WindowBounds;

type Shell<'a> = State<'a, Arc<Coordinator>>;

#[tauri::command]
pub async fn open_session(state: Shell<'_>, args: OpenSessionArgs) -> Result<OpenOutcome, String> {
    info!("open_session command called for session {}", args.session);
    state.open_session(args).await.map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn close_session(state: Shell<'_>, window_id: String, desktop_id: String) -> Result<(), String> {
    info!("close_session command called for {}", desktop_id);
    state
        .close_session(&WindowId::from(window_id), &desktop_id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn change_locale(
    state: Shell<'_>,
    locale: String,
    client_session_id: Option<String>,
) -> Result<String, String> {
    state
        .change_locale(&locale, client_session_id.as_deref())
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_locale(state: Shell<'_>) -> Option<String> {
    state.get_locale()
}

/// Without a desktop id the login is not tied to a window.
#[tauri::command]
pub async fn login(state: Shell<'_>, desktop_id: Option<String>) -> Result<LoginOutcome, String> {
    info!("login command called");
    let outcome = match desktop_id {
        Some(desktop_id) => state.login_for_desktop(&desktop_id).await,
        None => state.login(None).await,
    };
    outcome.map_err(|e| e.to_string())
}

#[tauri::command]
pub fn logout(state: Shell<'_>) -> Result<(), String> {
    info!("logout command called");
    state.logout().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn open_external(state: Shell<'_>, url: String) -> Result<(), String> {
    state.open_external(&url).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn save_window_bounds(state: Shell<'_>, window_id: String, bounds: WindowBounds) -> Result<bool, String> {
    state
        .save_window_bounds(&WindowId::from(window_id), bounds)
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_client_settings(state: Shell<'_>) -> Result<ClientSettings, String> {
    state.client_settings().map_err(|e| e.to_string())
}

#[tauri::command]
pub fn set_view_columns_order(state: Shell<'_>, view_id: String, column_ids: Vec<String>) -> Result<(), String> {
    state
        .set_view_columns_order(&view_id, column_ids)
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn set_view_column_width(state: Shell<'_>, view_id: String, column_id: String, width: f64) -> Result<(), String> {
    state
        .set_view_column_width(&view_id, &column_id, width)
        .map_err(|e| e.to_string())
}

#[tauri::command]
pub fn set_view_column_sorting(
    state: Shell<'_>,
    view_id: String,
    column_id: String,
    direction: SortDirection,
) -> Result<(), String> {
    state
        .set_view_column_sorting(&view_id, &column_id, direction)
        .map_err(|e| e.to_string())
}
