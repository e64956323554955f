//! SSH shell transport using russh crate

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Disconnect, client};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{AuthConfig, Endpoint};
use crate::error::ExecError;
use crate::stream::{SHELL_PROMPT, ShellStream};
use crate::traits::{Connector, Transport};

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Settings for SSH shells
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Time allowed for TCP connect plus authentication
    pub connect_timeout: Duration,
    /// Time allowed for the shell to acknowledge the installed prompt
    pub ready_timeout: Duration,
    /// Terminal type requested for the PTY
    pub term: String,
    /// PTY width in columns
    pub cols: u32,
    /// PTY height in rows
    pub rows: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(10),
            term: "xterm".to_string(),
            // wide enough that long commands are not wrapped by the PTY
            cols: 4096,
            rows: 64,
        }
    }
}

/// Opens interactive SSH shells
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    /// Create a connector with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector with explicit settings
    #[must_use]
    pub fn with_settings(settings: SshSettings) -> Self {
        Self { settings }
    }

    /// Authenticate on an established handle: key first, then password
    async fn authenticate(
        handle: &mut client::Handle<SshClientHandler>,
        auth: &AuthConfig,
    ) -> Result<(), ExecError> {
        if let Some(key_source) = &auth.key {
            let passphrase = auth.key_passphrase.as_ref().map(|p| p.as_str());
            let key_pair = key_source
                .load(passphrase)
                .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            let auth_res = handle
                .authenticate_publickey(
                    &auth.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

            if auth_res.success() {
                return Ok(());
            }
            warn!(user = %auth.username, "public key rejected");
        }

        if let Some(password) = &auth.password {
            let auth_res = handle
                .authenticate_password(&auth.username, password.as_str())
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

            if auth_res.success() {
                return Ok(());
            }
            return Err(ExecError::AuthenticationFailed(
                "password authentication failed".to_string(),
            ));
        }

        Err(ExecError::AuthenticationFailed(
            "no accepted authentication method".to_string(),
        ))
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip(self, auth), fields(host = %endpoint.host, port = endpoint.port))]
    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: &AuthConfig,
    ) -> Result<Box<dyn Transport>, ExecError> {
        info!(user = %auth.username, "connecting to SSH");

        let config = Arc::new(client::Config::default());
        let mut handle = timeout(
            self.settings.connect_timeout,
            client::connect(
                config,
                (endpoint.host.as_str(), endpoint.port),
                SshClientHandler,
            ),
        )
        .await
        .map_err(|_| {
            ExecError::ConnectionFailed(format!("connect to {} timed out", endpoint.address()))
        })?
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        Self::authenticate(&mut handle, auth).await?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;
        channel
            .request_pty(
                false,
                &self.settings.term,
                self.settings.cols,
                self.settings.rows,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("PTY request failed: {e}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| ExecError::ConnectionFailed(format!("shell request failed: {e}")))?;

        let (reader, writer) = tokio::io::split(channel.into_stream());
        let mut stream = ShellStream::spawn(reader, writer);
        stream
            .prepare("stty -echo", self.settings.ready_timeout)
            .await?;

        let system = stream
            .exchange(
                "uname -s",
                self.settings.ready_timeout,
                &[SHELL_PROMPT.to_string()],
            )
            .await
            .map(|out| out.trim().to_lowercase())
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to detect system family");
                String::new()
            });

        info!(system = %system, "SSH shell ready");

        Ok(Box::new(SshTransport {
            endpoint: endpoint.clone(),
            handle: Some(handle),
            stream,
            system,
        }))
    }
}

/// Interactive shell over one SSH channel
pub struct SshTransport {
    endpoint: Endpoint,
    handle: Option<client::Handle<SshClientHandler>>,
    stream: ShellStream,
    system: String,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("endpoint", &self.endpoint)
            .field("system", &self.system)
            .field("connected", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SshTransport {
    #[instrument(skip(self, command, terminators), fields(host = %self.endpoint.host))]
    async fn run(
        &mut self,
        command: &str,
        timeout_duration: Duration,
        terminators: &[String],
    ) -> Result<String, ExecError> {
        if self.handle.is_none() {
            return Err(ExecError::SessionClosed);
        }
        let result = self
            .stream
            .exchange(command, timeout_duration, terminators)
            .await;
        if let Err(ExecError::Timeout { timeout, .. }) = &result {
            error!(timeout = ?timeout, "no terminator before deadline");
        }
        result
    }

    fn system(&self) -> &str {
        &self.system
    }

    fn shell_prompt(&self) -> &str {
        SHELL_PROMPT
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        if let Some(handle) = self.handle.take() {
            let _ = self.stream.send_line("exit").await;
            handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.endpoint.host, "SSH disconnected");
        } else {
            debug!(host = %self.endpoint.host, "SSH already closed");
        }
        Ok(())
    }

    fn transport_type(&self) -> &'static str {
        "ssh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_request_wide_pty() {
        let settings = SshSettings::default();
        assert!(settings.cols >= 1024);
        assert_eq!(settings.term, "xterm");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = SshConnector::with_settings(SshSettings {
            connect_timeout: Duration::from_secs(2),
            ..SshSettings::default()
        });
        // port 1 on loopback is not an SSH server
        let result = connector
            .connect(
                &Endpoint::new("127.0.0.1").with_port(1),
                &AuthConfig::new("nobody").with_password("x"),
            )
            .await;
        assert!(matches!(result, Err(ExecError::ConnectionFailed(_))));
    }
}
