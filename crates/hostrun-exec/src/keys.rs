//! SSH private key resolution

use std::env;
use std::path::{Path, PathBuf};

use russh::keys::PrivateKey;
use tracing::debug;
use zeroize::Zeroizing;

/// Where private key material comes from
#[derive(Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
    /// PEM/OpenSSH key text held in memory
    Inline(Zeroizing<String>),
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            KeySource::Env(var) => f.debug_tuple("Env").field(var).finish(),
            KeySource::Inline(_) => f.write_str("Inline(<redacted>)"),
        }
    }
}

impl KeySource {
    /// Load and decode the private key
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be read, has loose permissions,
    /// or fails to decode
    pub fn load(&self, passphrase: Option<&str>) -> Result<PrivateKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                let path = expand_home(path);
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(&path)?;
                debug!(path = %path.display(), "loading private key");
                russh::keys::load_secret_key(&path, passphrase)
                    .map_err(|e| KeyError::Decode(e.to_string()))
            }
            KeySource::Env(var_name) => {
                let encoded =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let decoded = Zeroizing::new(
                    base64_decode(&encoded).map_err(|_| KeyError::InvalidBase64)?,
                );
                let text = std::str::from_utf8(&decoded).map_err(|_| KeyError::InvalidBase64)?;
                decode(text, passphrase)
            }
            KeySource::Inline(text) => decode(text, passphrase),
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("failed to decode private key: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn decode(text: &str, passphrase: Option<&str>) -> Result<PrivateKey, KeyError> {
    russh::keys::decode_secret_key(text, passphrase).map_err(|e| KeyError::Decode(e.to_string()))
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

/// Expand a leading `~/` to the user's home directory
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Ok(home) = env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}
