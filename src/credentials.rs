//! Where bindings get their bearer token from.

use std::fmt;

use parking_lot::RwLock;

/// Env var read by [`EnvCredentials::default`].
pub const TOKEN_ENV: &str = "TOPIC_WS_TOKEN";

/// Source of the bearer token attached to every handshake.
///
/// Read once per connect, so a store may change its answer between binds.
/// Blank tokens count as absent.
pub trait CredentialStore: Send + Sync + 'static {
    fn token(&self) -> Option<String>;
}

impl<F> CredentialStore for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// In-memory token, settable at runtime (e.g. after a login round trip).
#[derive(Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

impl CredentialStore for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .as_ref()
            .filter(|t| !t.trim().is_empty())
            .cloned()
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("present", &self.token.read().is_some())
            .finish()
    }
}

/// Reads the token from an environment variable on every connect.
#[derive(Clone, Debug)]
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(TOKEN_ENV)
    }
}

impl CredentialStore for EnvCredentials {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}
