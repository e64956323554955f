//! Public entry points: open, run, extract, close

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use hostrun_exec::AuthConfig;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::credential::{CredentialResolver, CredentialStore, FileCredentialStore};
use crate::error::{CoreError, RunFailure};
use crate::executor::Executor;
use crate::expand::{NoopExpander, VariableExpander};
use crate::model::{
    CloseSessionRequest, ExtractRequest, ExtractableCommand, OpenSessionRequest,
    OpenSessionResponse, RunRequest, RunResponse, Target, TargetAddress,
};
use crate::os::{DaemonType, OperatingSystem};
use crate::registry::{SessionRegistry, SharedSession};
use crate::superuser::elevate;

/// Session-level settings applied by `open`
#[derive(Debug, Default)]
struct SessionInit<'a> {
    env: Option<&'a BTreeMap<String, String>>,
    system_paths: &'a [String],
    transient: bool,
    basedir: Option<&'a Path>,
}

/// Remote command execution service
pub struct ExecService {
    registry: Arc<SessionRegistry>,
    resolver: Arc<CredentialResolver>,
    expander: Arc<dyn VariableExpander>,
    executor: Executor,
}

impl std::fmt::Debug for ExecService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecService")
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ExecService {
    /// Service with SSH/local connectors and file-based credentials
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let registry = SessionRegistry::new().with_internal_timeout(config.internal_timeout());
        let store = FileCredentialStore::new(&config.secret_dir);
        Self::with_parts(
            config,
            Arc::new(registry),
            Arc::new(store),
            Arc::new(NoopExpander),
        )
    }

    /// Service over explicit collaborators
    pub fn with_parts(
        config: &EngineConfig,
        registry: Arc<SessionRegistry>,
        store: Arc<dyn CredentialStore>,
        expander: Arc<dyn VariableExpander>,
    ) -> Self {
        let resolver = Arc::new(CredentialResolver::new(store));
        let executor = Executor::new(Arc::clone(&resolver), Arc::clone(&expander))
            .with_default_timeout(config.default_timeout())
            .with_default_terminators(config.default_terminators.clone());
        Self {
            registry,
            resolver,
            expander,
            executor,
        }
    }

    /// Registry holding this service's sessions
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open the session for a target, or reconcile the existing one
    ///
    /// # Errors
    /// Returns `CoreError::InvalidRequest` without a target, and connection or
    /// credential errors from establishing the shell
    #[instrument(skip(self, request), fields(target = ?request.target.as_ref().map(|t| &t.url)))]
    pub async fn open(&self, request: &OpenSessionRequest) -> Result<OpenSessionResponse, CoreError> {
        let target = require_target(request.target.as_ref())?;
        let init = SessionInit {
            env: Some(&request.env),
            system_paths: &request.system_paths,
            transient: request.transient,
            basedir: request.basedir.as_deref(),
        };
        let session = self.open_session(target, &init).await?;
        let session_id = session.lock().await.id().to_string();
        Ok(OpenSessionResponse { session_id })
    }

    /// Run plain commands
    ///
    /// # Errors
    /// Returns a [`RunFailure`] carrying the commands logged before the error
    pub async fn run(&self, request: &RunRequest) -> Result<RunResponse, RunFailure> {
        let target = require_target(request.target.as_ref())
            .map_err(|e| RunFailure::new(e, RunResponse::default()))?;
        self.execute(target, request.superuser, request.as_extractable())
            .await
    }

    /// Run a sequence with extraction rules
    ///
    /// # Errors
    /// Returns a [`RunFailure`] carrying the commands logged before the error
    pub async fn extract(&self, request: &ExtractRequest) -> Result<RunResponse, RunFailure> {
        let target = require_target(request.target.as_ref())
            .map_err(|e| RunFailure::new(e, RunResponse::default()))?;
        self.execute(target, request.superuser, request.sequence.clone())
            .await
    }

    /// Close a session
    ///
    /// # Errors
    /// Returns `CoreError::InvalidRequest` for an unknown session id
    pub async fn close(&self, request: &CloseSessionRequest) -> Result<(), CoreError> {
        if self.registry.close(&request.session_id).await? {
            Ok(())
        } else {
            Err(CoreError::InvalidRequest(format!(
                "unknown session: {}",
                request.session_id
            )))
        }
    }

    /// Service manager on the target host
    ///
    /// # Errors
    /// Returns errors from opening the session
    pub async fn daemon_type(&self, target: &Target) -> Result<DaemonType, CoreError> {
        let session = self.open_session(target, &SessionInit::default()).await?;
        let mut session = session.lock().await;
        session.daemon_type().await
    }

    /// Operating system of the target host
    ///
    /// # Errors
    /// Returns errors from opening the session
    pub async fn operating_system(&self, target: &Target) -> Result<OperatingSystem, CoreError> {
        let session = self.open_session(target, &SessionInit::default()).await?;
        let mut session = session.lock().await;
        Ok(session.operating_system().await?.clone())
    }

    /// Close every session this context owns; transient sessions stay open
    pub async fn teardown(&self) -> usize {
        let closed = self.registry.teardown().await;
        info!(closed, "sessions torn down");
        closed
    }

    async fn execute(
        &self,
        target: &Target,
        superuser: bool,
        sequence: ExtractableCommand,
    ) -> Result<RunResponse, RunFailure> {
        let sequence = if superuser {
            elevate(target, &sequence).map_err(|e| RunFailure::new(e, RunResponse::default()))?
        } else {
            sequence
        };

        let session = self
            .open_session(target, &SessionInit::default())
            .await
            .map_err(|e| RunFailure::new(e, RunResponse::default()))?;
        let mut session = session.lock().await;
        let mut response = RunResponse::new(session.id());

        match self
            .executor
            .run_sequence(&mut session, &sequence, &mut response)
            .await
        {
            Ok(()) => Ok(response),
            Err(e) => Err(RunFailure::new(e, response)),
        }
    }

    async fn open_session(
        &self,
        target: &Target,
        init: &SessionInit<'_>,
    ) -> Result<SharedSession, CoreError> {
        let address = target.address()?;
        let auth = self.auth_config(target, &address).await?;
        let (shared, created) = self
            .registry
            .get_or_open(&address, &auth, init.transient, init.basedir)
            .await?;

        {
            let mut session = shared.lock().await;
            if created {
                session.operating_system().await?;
            }
            if let Some(directory) = &address.directory {
                if let Err(e) = session.change_directory(directory).await {
                    warn!(directory = %directory, error = %e, "failed to enter target directory");
                }
            }
            if let Some(env) = init.env {
                for (key, value) in env {
                    session.set_env(key, &self.expander.expand(value)).await?;
                }
            }
            if !init.system_paths.is_empty() {
                let os = session.operating_system().await?;
                os.path.push(init.system_paths);
                let path = os.path.env_value();
                session.set_env("PATH", &path).await?;
            }
        }
        Ok(shared)
    }

    /// Authentication for a target: its credential, else the URL user
    async fn auth_config(
        &self,
        target: &Target,
        address: &TargetAddress,
    ) -> Result<AuthConfig, CoreError> {
        let url_user = address
            .username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());

        match target.credentials.as_deref().filter(|r| !r.is_empty()) {
            Some(reference) => {
                let credential = self.resolver.resolve(reference).await?;
                let mut auth = credential.auth_config();
                if auth.username.is_empty() {
                    auth.username = url_user;
                }
                Ok(auth)
            }
            None => Ok(AuthConfig::new(url_user)),
        }
    }
}

fn require_target(target: Option<&Target>) -> Result<&Target, CoreError> {
    target.ok_or_else(|| CoreError::InvalidRequest("target was empty".to_string()))
}
