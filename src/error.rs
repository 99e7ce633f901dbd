use thiserror::Error;

use crate::registry::WindowId;

/// Failures reported by the GUI host collaborator.
#[derive(Debug, Error)]
pub enum WindowError {
    #[error("failed to create window {window}: {reason}")]
    Create { window: WindowId, reason: String },
    #[error("window {window} rejected `{op}`: {reason}")]
    Operation {
        window: WindowId,
        op: &'static str,
        reason: String,
    },
}

/// Failures of the on-disk settings store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("settings payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the identity provider or decoding its credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("identity provider unreachable: {0}")]
    Transport(String),
    #[error("malformed credential: {0}")]
    MalformedCredential(String),
    #[error("credential store io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Transport(err.to_string())
    }
}

/// Failures handing a URL to the desktop shell.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("refusing to open `{0}`")]
    UnsupportedUrl(String),
    #[error("shell could not open `{url}`: {reason}")]
    Open { url: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("asset server did not become ready: {0}")]
    NotReady(String),
}

/// Everything a top-level command can surface to its caller.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("no window {0} is registered")]
    UnknownWindow(WindowId),
    #[error("no client session is open")]
    NoClientSession,
    #[error("invalid desktop id `{0}`")]
    InvalidDesktopId(String),
    #[error("relaunch failed: {0}")]
    Relaunch(#[from] std::io::Error),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
