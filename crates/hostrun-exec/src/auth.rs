//! Connection endpoint and authentication settings

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::keys::KeySource;

/// Network endpoint of a target host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    22
}

impl Endpoint {
    /// Create new endpoint on the default SSH port
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port` form used for logging and socket resolution
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Credentials used to authenticate the transport
#[derive(Clone, Default)]
pub struct AuthConfig {
    /// Login user
    pub username: String,
    /// Password, tried when no key is configured or key auth is rejected
    pub password: Option<Zeroizing<String>>,
    /// Private key material
    pub key: Option<KeySource>,
    /// Passphrase protecting the private key
    pub key_passphrase: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    /// Create auth config for a user with no secrets yet
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    /// Set login password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    /// Set private key source
    #[must_use]
    pub fn with_key(mut self, key: KeySource) -> Self {
        self.key = Some(key);
        self
    }

    /// Set the passphrase protecting the private key
    #[must_use]
    pub fn with_key_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.key_passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = Endpoint::new("10.0.0.5");
        assert_eq!(endpoint.port, 22);
        assert_eq!(endpoint.with_port(2222).address(), "10.0.0.5:2222");
    }

    #[test]
    fn test_auth_debug_hides_password() {
        let auth = AuthConfig::new("deploy").with_password("hunter2");
        let rendered = format!("{auth:?}");
        assert!(rendered.contains("deploy"));
        assert!(!rendered.contains("hunter2"));
    }
}
