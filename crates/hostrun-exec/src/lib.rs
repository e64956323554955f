//! hostrun-exec: Interactive shell transports
//!
//! Provides the `Transport`/`Connector` traits and implementations that drive
//! a long-lived shell over SSH, on the local machine, or from a replay script.

pub mod auth;
pub mod error;
pub mod keys;
pub mod local;
pub mod replay;
pub mod ssh;
pub mod stream;
pub mod traits;

pub use auth::{AuthConfig, Endpoint};
pub use error::ExecError;
pub use keys::{KeyError, KeySource};
pub use local::{LocalConnector, LocalTransport};
pub use replay::{
    REPLAY_FILE, RecordingTransport, ReplayCommand, ReplayConnector, ReplayHistory, ReplayScript,
    ReplayTransport,
};
pub use ssh::{SshConnector, SshSettings, SshTransport};
pub use stream::SHELL_PROMPT;
pub use traits::{Connector, Transport};
