use std::fmt;
use std::time::Duration;

use http::Uri;

use super::types::{WebSocketBufferConfig, WebSocketError, WebSocketResult};

/// Env var holding the websocket base url, e.g. `ws://127.0.0.1:8000`.
pub const BASE_URL_ENV: &str = "TOPIC_WS_BASE_URL";
/// Env var overriding the binding status poll interval in milliseconds.
pub const STATUS_POLL_ENV: &str = "TOPIC_WS_STATUS_POLL_MS";

const DEFAULT_STATUS_POLL: Duration = Duration::from_secs(1);

/// One logical connection target: a path on the configured base url plus the bearer
/// token attached to the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    path: String,
    token: String,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: token.into(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("path", &self.path)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Transport configuration shared by every client built from it.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Scheme + authority the endpoint paths are resolved against. `None` means no
    /// connection can be made.
    pub base_url: Option<String>,
    pub buffers: WebSocketBufferConfig,
    /// How often bindings sample the connection state.
    pub status_poll_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            buffers: WebSocketBufferConfig::default(),
            status_poll_interval: DEFAULT_STATUS_POLL,
        }
    }
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// Build from `TOPIC_WS_BASE_URL` / `TOPIC_WS_STATUS_POLL_MS`; unset or unparsable
    /// values fall back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = std::env::var(BASE_URL_ENV) {
            if !base.trim().is_empty() {
                config.base_url = Some(base);
            }
        }
        if let Some(ms) = std::env::var(STATUS_POLL_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            config.status_poll_interval = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    pub fn resolve(&self, path: &str) -> WebSocketResult<String> {
        resolve_url(self.base_url.as_deref(), path)
    }
}

/// Resolve `path` against `base`, producing a full `ws://` or `wss://` url.
pub fn resolve_url(base: Option<&str>, path: &str) -> WebSocketResult<String> {
    let unresolvable = |reason: &str| WebSocketError::UnresolvableUrl {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let base = base
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .ok_or_else(|| unresolvable("no base url configured"))?;
    let path = path.trim();
    if path.is_empty() {
        return Err(unresolvable("empty path"));
    }

    let url = if path.starts_with('/') {
        format!("{}{}", base.trim_end_matches('/'), path)
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    };

    let uri: Uri = url
        .parse()
        .map_err(|err: http::uri::InvalidUri| unresolvable(&err.to_string()))?;
    match uri.scheme_str() {
        Some("ws") | Some("wss") => {}
        _ => return Err(unresolvable("scheme must be ws or wss")),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(unresolvable("missing host"));
    }
    Ok(url)
}
