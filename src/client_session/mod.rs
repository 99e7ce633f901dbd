//! Client session: machine + application scoped preferences.
//!
//! One settings file per installation, independent of any window. Holds
//! locale, zoom, theme, per-view column layout, recent colors and window
//! bounds per window slot. The private part (which window owns which slot)
//! only lives in memory.

pub mod discovery;
pub mod statedb;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub use discovery::{ClientSessionId, CLIENT_SESSION_SCHEMA_VERSION};
pub use statedb::{SettingsStore, StateDb};

use crate::error::StoreError;
use crate::registry::WindowId;
use crate::window::WindowBounds;

const GLOBAL_NAMESPACE: &str = "global";
const SESSION_KEY: &str = "session";
const MAX_LAST_COLORS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSorting {
    pub column_id: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewSettings {
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub widths: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sorting: Option<ColumnSorting>,
}

/// Runtime-only settings, recomputed every start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrivateSettings {
    pub window_slots: BTreeMap<WindowId, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSettings {
    pub id: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub views: BTreeMap<String, ViewSettings>,
    #[serde(default)]
    pub last_colors: Vec<String>,
    #[serde(default)]
    pub prototype_mode: bool,
    /// Bounds per window slot.
    #[serde(default)]
    pub windows: BTreeMap<u32, WindowBounds>,
    #[serde(skip)]
    pub private: PrivateSettings,
}

fn default_zoom() -> f64 {
    1.0
}

impl ClientSettings {
    pub fn new(id: &ClientSessionId) -> Self {
        Self {
            id: id.to_string(),
            locale: None,
            zoom: default_zoom(),
            theme: None,
            views: BTreeMap::new(),
            last_colors: Vec::new(),
            prototype_mode: false,
            windows: BTreeMap::new(),
            private: PrivateSettings::default(),
        }
    }

    /// First touch of a view creates the empty skeleton.
    fn view_mut(&mut self, view_id: &str) -> &mut ViewSettings {
        self.views.entry(view_id.to_string()).or_default()
    }

    pub fn set_view_columns_order(&mut self, view_id: &str, column_ids: Vec<String>) {
        self.view_mut(view_id).order = column_ids;
    }

    pub fn set_view_column_width(&mut self, view_id: &str, column_id: &str, width: f64) {
        self.view_mut(view_id)
            .widths
            .insert(column_id.to_string(), width);
    }

    pub fn set_view_column_sorting(&mut self, view_id: &str, column_id: &str, direction: SortDirection) {
        self.view_mut(view_id).sorting = Some(ColumnSorting {
            column_id: column_id.to_string(),
            direction,
        });
    }

    pub fn push_last_color(&mut self, color: &str) {
        self.last_colors.retain(|c| c != color);
        self.last_colors.insert(0, color.to_string());
        self.last_colors.truncate(MAX_LAST_COLORS);
    }

    /// Gives `window_id` the lowest free slot, or the one it already has.
    pub fn allocate_window_slot(&mut self, window_id: &WindowId) -> u32 {
        if let Some(slot) = self.private.window_slots.get(window_id) {
            return *slot;
        }
        let taken: Vec<u32> = self.private.window_slots.values().copied().collect();
        let slot = (0..).find(|s| !taken.contains(s)).unwrap_or_default();
        self.private.window_slots.insert(window_id.clone(), slot);
        slot
    }

    pub fn release_window_slot(&mut self, window_id: &WindowId) -> Option<u32> {
        self.private.window_slots.remove(window_id)
    }

    pub fn window_bounds(&self, window_id: &WindowId) -> Option<WindowBounds> {
        let slot = self.private.window_slots.get(window_id)?;
        self.windows.get(slot).copied()
    }

    /// Returns `false` when the window owns no slot.
    pub fn set_window_bounds(&mut self, window_id: &WindowId, bounds: WindowBounds) -> bool {
        match self.private.window_slots.get(window_id) {
            Some(slot) => {
                self.windows.insert(*slot, bounds);
                true
            }
            None => false,
        }
    }
}

/// Picks the supported locale closest to `requested`: exact match first,
/// then same language, otherwise `requested` itself.
pub fn best_locale(requested: &str, supported: &[String]) -> String {
    if let Some(exact) = supported.iter().find(|l| l.eq_ignore_ascii_case(requested)) {
        return exact.clone();
    }
    let language = requested.split(['-', '_']).next().unwrap_or(requested);
    supported
        .iter()
        .find(|l| {
            l.split(['-', '_'])
                .next()
                .is_some_and(|lang| lang.eq_ignore_ascii_case(language))
        })
        .cloned()
        .unwrap_or_else(|| requested.to_string())
}

/// Reads and writes versioned session files in one directory.
#[derive(Debug, Clone)]
pub struct ClientSessionStore {
    dir: PathBuf,
}

impl ClientSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, id: &ClientSessionId) -> PathBuf {
        self.dir.join(id.file_name(CLIENT_SESSION_SCHEMA_VERSION))
    }

    fn open_namespace(&self, id: &ClientSessionId, namespace: &str) -> Result<StateDb, StoreError> {
        StateDb::open(&self.path(id), namespace)
    }

    /// `None` when no settings were ever saved for `id`.
    pub fn load(&self, id: &ClientSessionId) -> Result<Option<ClientSettings>, StoreError> {
        if !self.path(id).exists() {
            return Ok(None);
        }
        let db = self.open_namespace(id, GLOBAL_NAMESPACE)?;
        match db.load_state(SESSION_KEY)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Private settings are never written.
    pub fn save(&self, id: &ClientSessionId, settings: &ClientSettings) -> Result<(), StoreError> {
        let db = self.open_namespace(id, GLOBAL_NAMESPACE)?;
        db.save_state(SESSION_KEY, &serde_json::to_value(settings)?)
    }
}

/// The live client session of this process.
pub struct ClientSession {
    id: ClientSessionId,
    global: StateDb,
    app: StateDb,
    settings: Mutex<ClientSettings>,
    supported_locales: Vec<String>,
}

impl ClientSession {
    /// Reuses the session found in `dir` or creates a fresh one.
    pub fn open(
        dir: &Path,
        app_namespace: &str,
        supported_locales: Vec<String>,
    ) -> Result<Self, StoreError> {
        let store = ClientSessionStore::new(dir);
        let id = discovery::discover(dir).unwrap_or_else(ClientSessionId::generate);

        let (settings, fresh) = match store.load(&id)? {
            Some(settings) => (settings, false),
            None => (ClientSettings::new(&id), true),
        };

        let global = store.open_namespace(&id, GLOBAL_NAMESPACE)?;
        let app = store.open_namespace(&id, app_namespace)?;
        let session = Self {
            id,
            global,
            app,
            settings: Mutex::new(settings),
            supported_locales,
        };
        if fresh {
            session.save()?;
            info!("Created client session {}", session.id);
        } else {
            info!("Restored client session {}", session.id);
        }
        Ok(session)
    }

    pub fn id(&self) -> &ClientSessionId {
        &self.id
    }

    pub fn snapshot(&self) -> ClientSettings {
        self.settings.lock().clone()
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let value = serde_json::to_value(&*self.settings.lock())?;
        self.global.save_state(SESSION_KEY, &value)
    }

    fn update<T>(&self, f: impl FnOnce(&mut ClientSettings) -> T) -> Result<T, StoreError> {
        let out = f(&mut *self.settings.lock());
        self.save()?;
        Ok(out)
    }

    /// Stores the best supported match and returns it.
    pub fn set_locale(&self, locale: &str) -> Result<String, StoreError> {
        let best = best_locale(locale, &self.supported_locales);
        debug!("Locale {} resolved to {}", locale, best);
        let stored = best.clone();
        self.update(move |s| s.locale = Some(stored))?;
        Ok(best)
    }

    pub fn locale(&self) -> Option<String> {
        self.settings.lock().locale.clone()
    }

    pub fn set_zoom(&self, zoom: f64) -> Result<(), StoreError> {
        self.update(|s| s.zoom = zoom)
    }

    pub fn set_theme(&self, theme: &str) -> Result<(), StoreError> {
        self.update(|s| s.theme = Some(theme.to_string()))
    }

    pub fn set_prototype_mode(&self, enabled: bool) -> Result<(), StoreError> {
        self.update(|s| s.prototype_mode = enabled)
    }

    pub fn push_last_color(&self, color: &str) -> Result<(), StoreError> {
        self.update(|s| s.push_last_color(color))
    }

    pub fn set_view_columns_order(&self, view_id: &str, column_ids: Vec<String>) -> Result<(), StoreError> {
        self.update(|s| s.set_view_columns_order(view_id, column_ids))
    }

    pub fn set_view_column_width(&self, view_id: &str, column_id: &str, width: f64) -> Result<(), StoreError> {
        self.update(|s| s.set_view_column_width(view_id, column_id, width))
    }

    pub fn set_view_column_sorting(
        &self,
        view_id: &str,
        column_id: &str,
        direction: SortDirection,
    ) -> Result<(), StoreError> {
        self.update(|s| s.set_view_column_sorting(view_id, column_id, direction))
    }

    /// Slot allocation is private state, nothing is written.
    pub fn claim_window_slot(&self, window_id: &WindowId) -> (u32, Option<WindowBounds>) {
        let mut settings = self.settings.lock();
        let slot = settings.allocate_window_slot(window_id);
        (slot, settings.window_bounds(window_id))
    }

    pub fn release_window_slot(&self, window_id: &WindowId) -> Option<u32> {
        self.settings.lock().release_window_slot(window_id)
    }

    pub fn save_window_bounds(&self, window_id: &WindowId, bounds: WindowBounds) -> Result<bool, StoreError> {
        self.update(|s| s.set_window_bounds(window_id, bounds))
    }

    pub fn save_app_settings(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.app.save_state(key, value)
    }

    pub fn load_app_settings(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.app.load_state(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid_settings(id: &ClientSessionId) -> ClientSettings {
        let mut settings = ClientSettings::new(id);
        settings.locale = Some("fr-CH".to_string());
        settings.zoom = 1.25;
        settings.set_view_columns_order("grid", vec!["a".to_string(), "b".to_string()]);
        settings.set_view_column_width("grid", "a", 120.0);
        settings.set_view_column_sorting("grid", "a", SortDirection::Asc);
        settings
    }

    #[test]
    fn test_round_trip_strips_private_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientSessionStore::new(dir.path());
        let id = ClientSessionId::from("machine-1");

        let mut settings = grid_settings(&id);
        settings.allocate_window_slot(&WindowId::from("laboratory@1"));
        store.save(&id, &settings).unwrap();

        let loaded = store.load(&id).unwrap().unwrap();
        assert!(loaded.private.window_slots.is_empty());

        let mut expected = settings.clone();
        expected.private = PrivateSettings::default();
        assert_eq!(loaded, expected);
        let grid = &loaded.views["grid"];
        assert_eq!(grid.order, vec!["a", "b"]);
        assert_eq!(grid.widths["a"], 120.0);
        assert_eq!(
            grid.sorting,
            Some(ColumnSorting {
                column_id: "a".to_string(),
                direction: SortDirection::Asc
            })
        );
    }

    #[test]
    fn test_serialized_shape() {
        let settings = grid_settings(&ClientSessionId::from("m"));
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(value["locale"], "fr-CH");
        assert_eq!(
            value["views"]["grid"]["sorting"],
            json!({ "columnId": "a", "direction": "asc" })
        );
        assert!(value.get("private").is_none());
    }

    #[test]
    fn test_missing_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientSessionStore::new(dir.path());
        assert!(store.load(&ClientSessionId::from("nobody")).unwrap().is_none());
    }

    #[test]
    fn test_partial_view_update_keeps_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let session = ClientSession::open(dir.path(), "portal", Vec::new()).unwrap();
        session
            .set_view_columns_order("grid", vec!["a".to_string(), "b".to_string()])
            .unwrap();
        session.set_view_column_sorting("grid", "b", SortDirection::Desc).unwrap();
        session.set_view_column_width("grid", "a", 80.0).unwrap();

        let loaded = ClientSessionStore::new(dir.path())
            .load(session.id())
            .unwrap()
            .unwrap();
        let grid = &loaded.views["grid"];
        assert_eq!(grid.order, vec!["a", "b"]);
        assert_eq!(grid.widths["a"], 80.0);
        assert_eq!(grid.sorting.as_ref().unwrap().column_id, "b");
    }

    #[test]
    fn test_first_touch_creates_empty_skeleton() {
        let mut settings = ClientSettings::new(&ClientSessionId::from("m"));
        settings.set_view_column_width("list", "name", 200.0);
        let list = &settings.views["list"];
        assert!(list.order.is_empty());
        assert!(list.sorting.is_none());
        assert_eq!(list.widths.len(), 1);
    }

    #[test]
    fn test_reopen_reuses_discovered_session() {
        let dir = tempfile::tempdir().unwrap();
        let first_id = {
            let session = ClientSession::open(dir.path(), "portal", Vec::new()).unwrap();
            session.set_zoom(1.5).unwrap();
            session.id().clone()
        };

        let session = ClientSession::open(dir.path(), "portal", Vec::new()).unwrap();
        assert_eq!(session.id(), &first_id);
        assert_eq!(session.snapshot().zoom, 1.5);
    }

    #[test]
    fn test_best_locale() {
        let supported = vec!["fr-CH".to_string(), "de-CH".to_string(), "en-US".to_string()];
        assert_eq!(best_locale("fr-ch", &supported), "fr-CH");
        assert_eq!(best_locale("fr-FR", &supported), "fr-CH");
        assert_eq!(best_locale("it-CH", &supported), "it-CH");
        assert_eq!(best_locale("de", &supported), "de-CH");
    }

    #[test]
    fn test_set_locale_persists_best_match() {
        let dir = tempfile::tempdir().unwrap();
        let session =
            ClientSession::open(dir.path(), "portal", vec!["fr-CH".to_string()]).unwrap();
        assert_eq!(session.set_locale("fr").unwrap(), "fr-CH");
        assert_eq!(session.locale().as_deref(), Some("fr-CH"));
    }

    #[test]
    fn test_window_slots_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let session = ClientSession::open(dir.path(), "portal", Vec::new()).unwrap();
        let first = WindowId::from("laboratory@1");
        let second = WindowId::from("laboratory@2");

        assert_eq!(session.claim_window_slot(&first), (0, None));
        assert_eq!(session.claim_window_slot(&second).0, 1);

        let bounds = WindowBounds { x: 10, y: 20, width: 800, height: 600, maximized: false };
        assert!(session.save_window_bounds(&first, bounds).unwrap());

        // a new window inherits the slot, and the bounds, of a closed one
        session.release_window_slot(&first);
        let third = WindowId::from("laboratory@3");
        assert_eq!(session.claim_window_slot(&third), (0, Some(bounds)));
        assert!(!session.save_window_bounds(&first, bounds).unwrap());
    }

    #[test]
    fn test_last_colors_are_most_recent_first() {
        let mut settings = ClientSettings::new(&ClientSessionId::from("m"));
        for i in 0..12 {
            settings.push_last_color(&format!("#{:06}", i));
        }
        settings.push_last_color("#000005");
        assert_eq!(settings.last_colors.len(), MAX_LAST_COLORS);
        assert_eq!(settings.last_colors[0], "#000005");
    }

    #[test]
    fn test_app_settings_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let session = ClientSession::open(dir.path(), "portal", Vec::new()).unwrap();
        session.save_app_settings("session", &json!({ "tabs": 3 })).unwrap();
        assert_eq!(session.load_app_settings("session").unwrap(), Some(json!({ "tabs": 3 })));
        // the global record is untouched by the app namespace
        assert_eq!(session.snapshot().zoom, 1.0);
    }
}
