use std::fmt;
use std::path::Path;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Bump when the persisted settings shape changes incompatibly. Files of
/// other versions are left on disk and never reused.
pub const CLIENT_SESSION_SCHEMA_VERSION: u32 = 2;

static SESSION_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^client-session@([A-Za-z0-9-]+)-v(\d+)\.db$").expect("session file pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientSessionId(String);

impl ClientSessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn file_name(&self, version: u32) -> String {
        format!("client-session@{}-v{}.db", self.0, version)
    }
}

impl From<&str> for ClientSessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ClientSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Splits a session file name into its id and schema version.
pub fn parse_file_name(name: &str) -> Option<(ClientSessionId, u32)> {
    let caps = SESSION_FILE.captures(name)?;
    let version = caps.get(2)?.as_str().parse().ok()?;
    Some((ClientSessionId(caps.get(1)?.as_str().to_string()), version))
}

/// Finds the session of the current schema version in `dir`. When several
/// match, the most recently modified one wins.
pub fn discover(dir: &Path) -> Option<ClientSessionId> {
    if !dir.exists() {
        return None;
    }

    let mut found: Vec<(SystemTime, ClientSessionId)> = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
        let name = entry.file_name().to_string_lossy();
        let Some((id, version)) = parse_file_name(&name) else {
            continue;
        };
        if version != CLIENT_SESSION_SCHEMA_VERSION {
            debug!("Ignoring client session {} (schema v{})", id, version);
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((modified, id));
    }

    if found.len() > 1 {
        warn!("{} client sessions found in {:?}, using the newest", found.len(), dir);
    }
    found.into_iter().max_by_key(|(modified, _)| *modified).map(|(_, id)| id)
}
