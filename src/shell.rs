use reqwest::Url;

use crate::error::ShellError;

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "mailto"];

/// Hands URLs to the operating system (browser, mail client).
pub trait ExternalOpener: Send + Sync {
    fn open_url(&self, url: &Url) -> Result<(), ShellError>;
}

/// Parses `raw` and rejects schemes the shell must not launch.
pub fn checked_url(raw: &str) -> Result<Url, ShellError> {
    let url = Url::parse(raw).map_err(|_| ShellError::UnsupportedUrl(raw.to_string()))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(ShellError::UnsupportedUrl(raw.to_string()));
    }
    Ok(url)
}
