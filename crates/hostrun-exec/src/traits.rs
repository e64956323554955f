//! Shell transport traits

use std::time::Duration;

use async_trait::async_trait;

use crate::auth::{AuthConfig, Endpoint};
use crate::error::ExecError;

/// A live, stateful shell on one host
///
/// Commands run one at a time; state such as the working directory and
/// exported variables persists between calls.
#[async_trait]
pub trait Transport: Send {
    /// Send `command` and read until any of `terminators` shows up in the
    /// accumulated output or `timeout` elapses
    async fn run(
        &mut self,
        command: &str,
        timeout: Duration,
        terminators: &[String],
    ) -> Result<String, ExecError>;

    /// OS family reported by the remote shell (`linux`, `darwin`, ...)
    fn system(&self) -> &str;

    /// Prompt the shell prints when it is ready for input
    fn shell_prompt(&self) -> &str;

    /// Terminate the shell and release the connection
    async fn close(&mut self) -> Result<(), ExecError>;

    /// Transport kind, for diagnostics
    fn transport_type(&self) -> &'static str;
}

/// Opens transports to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    /// Authenticate and open an interactive shell
    async fn connect(
        &self,
        endpoint: &Endpoint,
        auth: &AuthConfig,
    ) -> Result<Box<dyn Transport>, ExecError>;
}
