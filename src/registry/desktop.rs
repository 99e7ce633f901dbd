use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::window::WidgetRef;

const DESKTOP_PREFIX: &str = "desktop";
const LAB_PREFIX: &str = "laboratory";

/// Identity of one logical user workspace, derived from mandate + session.
///
/// Shape is `desktop@<mandate>@<session>`; `@` and `%` in the mandate are
/// percent-escaped so the first separator after the prefix is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DesktopId(String);

impl DesktopId {
    /// Same inputs always produce the same id.
    pub fn derive(mandate: &str, session: &str) -> Self {
        let mandate = mandate.replace('%', "%25").replace('@', "%40");
        Self(format!("{}@{}@{}", DESKTOP_PREFIX, mandate, session))
    }

    /// Accepts ids produced by [`DesktopId::derive`], e.g. from relaunch args.
    pub fn parse(raw: &str) -> Option<Self> {
        match split_desktop_id(raw) {
            Some((mandate, session)) if !mandate.is_empty() && !session.is_empty() => {
                Some(Self(raw.to_string()))
            }
            _ => None,
        }
    }

    fn parts(&self) -> (&str, &str) {
        split_desktop_id(&self.0).unwrap_or(("", ""))
    }

    pub fn mandate(&self) -> Cow<'_, str> {
        let raw = self.parts().0;
        if raw.contains('%') {
            Cow::Owned(raw.replace("%40", "@").replace("%25", "%"))
        } else {
            Cow::Borrowed(raw)
        }
    }

    pub fn session(&self) -> &str {
        self.parts().1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DesktopId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn split_desktop_id(raw: &str) -> Option<(&str, &str)> {
    raw.strip_prefix(DESKTOP_PREFIX)?
        .strip_prefix('@')?
        .split_once('@')
}

impl TryFrom<String> for DesktopId {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("invalid desktop id `{}`", raw))
    }
}

impl From<DesktopId> for String {
    fn from(id: DesktopId) -> Self {
        id.0
    }
}

impl fmt::Display for DesktopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(String);

impl WindowId {
    pub fn generate() -> Self {
        Self(format!("{}@{}", LAB_PREFIX, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host-safe label (alphanumerics, `-`, `_`, `:` and `/` only).
    pub fn label(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '/') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WindowId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WindowId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One open (or opening) desktop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesktopSession {
    pub desktop_id: DesktopId,
    pub mandate: String,
    pub username: String,
    /// `None` while the desktop waits for its window.
    pub window_id: Option<WindowId>,
    pub root_widget: Option<WidgetRef>,
    pub configuration: Value,
}

/// Arguments of `open-session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub mandate: String,
    pub session: String,
    pub username: String,
    #[serde(default)]
    pub configuration: Value,
    #[serde(default)]
    pub root_widget: Option<WidgetRef>,
    /// An unbound window (e.g. the login window) to adopt instead of
    /// creating a new one.
    #[serde(default)]
    pub target_window: Option<WindowId>,
}

impl OpenSessionRequest {
    pub fn new(mandate: impl Into<String>, session: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            mandate: mandate.into(),
            session: session.into(),
            username: username.into(),
            configuration: Value::Null,
            root_widget: None,
            target_window: None,
        }
    }

    pub fn in_window(mut self, window_id: WindowId) -> Self {
        self.target_window = Some(window_id);
        self
    }

    pub fn desktop_id(&self) -> DesktopId {
        DesktopId::derive(&self.mandate, &self.session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenKind {
    Created,
    Adopted,
    Focused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOutcome {
    pub desktop_id: DesktopId,
    pub window_id: WindowId,
    pub kind: OpenKind,
}
