//! hostrun-core: Command sequences over persistent shell sessions
//!
//! Implements the session registry, the command executor with its
//! terminator/validation/extraction pipeline, credential substitution and the
//! `sudo` elevation wrapper, exposed through [`ExecService`].

pub mod classify;
pub mod config;
pub mod credential;
pub mod error;
pub mod executor;
pub mod expand;
pub mod extract;
pub mod model;
pub mod os;
pub mod registry;
pub mod service;
pub mod session;
pub mod superuser;

pub use config::EngineConfig;
pub use credential::{Credential, CredentialResolver, CredentialStore, FileCredentialStore};
pub use error::{CoreError, RunFailure};
pub use executor::{Executor, Plan, StepState};
pub use expand::{MapExpander, NoopExpander, VariableExpander};
pub use model::{
    CloseSessionRequest, CommandLog, Execution, ExecutionOptions, Extract, ExtractRequest,
    ExtractableCommand, OpenSessionRequest, OpenSessionResponse, RunRequest, RunResponse, Scheme,
    Target, TargetAddress,
};
pub use os::{DaemonType, OperatingSystem, OperatingSystemTarget, SystemPath};
pub use registry::{SessionRegistry, SharedSession};
pub use service::ExecService;
pub use session::TerminalSession;
pub use superuser::{SUDO_CREDENTIAL_KEY, elevate};
