//! Process-scoped map of open sessions keyed by host

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hostrun_exec::{
    AuthConfig, Connector, Endpoint, LocalConnector, REPLAY_FILE, RecordingTransport,
    SshConnector, Transport,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::model::{Scheme, TargetAddress};
use crate::session::TerminalSession;

/// Session shared between callers; one command runs at a time
pub type SharedSession = Arc<Mutex<TerminalSession>>;

#[derive(Debug)]
struct Entry {
    session: SharedSession,
    transient: bool,
}

/// Open sessions plus the connectors used to create them
pub struct SessionRegistry {
    connectors: HashMap<Scheme, Arc<dyn Connector>>,
    sessions: Mutex<HashMap<String, Entry>>,
    internal_timeout: Duration,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("schemes", &self.connectors.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Registry using SSH for `ssh`/`scp` and a local shell for `file`
    #[must_use]
    pub fn new() -> Self {
        Self::empty()
            .with_connector(Scheme::Ssh, Arc::new(SshConnector::new()))
            .with_connector(Scheme::Local, Arc::new(LocalConnector::new()))
    }

    /// Registry with no connectors
    #[must_use]
    pub fn empty() -> Self {
        Self {
            connectors: HashMap::new(),
            sessions: Mutex::new(HashMap::new()),
            internal_timeout: Duration::from_secs(5),
        }
    }

    /// Use `connector` for a scheme
    #[must_use]
    pub fn with_connector(mut self, scheme: Scheme, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(scheme, connector);
        self
    }

    /// Timeout for bookkeeping commands in new sessions
    #[must_use]
    pub fn with_internal_timeout(mut self, timeout: Duration) -> Self {
        self.internal_timeout = timeout;
        self
    }

    /// Look up an open session
    pub async fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|e| Arc::clone(&e.session))
    }

    /// Ids of all open sessions
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Return the session for `address`, connecting on first use
    ///
    /// The boolean is `true` when the session was created by this call. When
    /// `basedir` is set a new session is recorded into `<basedir>/replay.json`.
    ///
    /// # Errors
    /// Returns `CoreError::UnsupportedTarget` without a connector for the
    /// scheme and `CoreError::Connection` when connecting fails
    pub async fn get_or_open(
        &self,
        address: &TargetAddress,
        auth: &AuthConfig,
        transient: bool,
        basedir: Option<&Path>,
    ) -> Result<(SharedSession, bool), CoreError> {
        let id = address.session_id();
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(&id) {
            debug!(session = %id, "reusing session");
            return Ok((Arc::clone(&entry.session), false));
        }

        let connector = self.connectors.get(&address.scheme).ok_or_else(|| {
            CoreError::UnsupportedTarget(format!("no connector for scheme {}", address.scheme.as_str()))
        })?;
        let endpoint = Endpoint::new(address.host.clone()).with_port(address.port);
        let mut transport: Box<dyn Transport> = connector.connect(&endpoint, auth).await?;
        if let Some(dir) = basedir {
            info!(session = %id, dir = %dir.display(), "recording session");
            transport = Box::new(RecordingTransport::new(transport, dir.join(REPLAY_FILE)));
        }

        info!(session = %id, transport = transport.transport_type(), "session opened");
        let session = Arc::new(Mutex::new(TerminalSession::new(
            id.clone(),
            transport,
            self.internal_timeout,
        )));
        sessions.insert(
            id,
            Entry {
                session: Arc::clone(&session),
                transient,
            },
        );
        Ok((session, true))
    }

    /// Close and forget one session
    ///
    /// Returns `false` when no such session was open.
    ///
    /// # Errors
    /// Propagates the transport's close failure; the session is forgotten
    /// either way
    pub async fn close(&self, session_id: &str) -> Result<bool, CoreError> {
        let entry = self.sessions.lock().await.remove(session_id);
        match entry {
            Some(entry) => {
                entry.session.lock().await.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close every session not marked transient
    ///
    /// Close failures are logged and the teardown continues. Returns the
    /// number of sessions closed.
    pub async fn teardown(&self) -> usize {
        let owned: Vec<(String, SharedSession)> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, e)| !e.transient)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|e| (id, e.session)))
                .collect()
        };

        let mut closed = 0;
        for (id, session) in owned {
            match session.lock().await.close().await {
                Ok(()) => closed += 1,
                Err(e) => warn!(session = %id, error = %e, "failed to close session"),
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use hostrun_exec::{ReplayConnector, ReplayScript};

    use super::*;
    use crate::model::Target;

    fn registry() -> SessionRegistry {
        let connector = ReplayConnector::new()
            .with_script("a", ReplayScript::new())
            .with_script("b", ReplayScript::new());
        SessionRegistry::empty().with_connector(Scheme::Ssh, Arc::new(connector))
    }

    #[tokio::test]
    async fn test_sessions_reused_per_host() {
        let registry = registry();
        let a = Target::new("ssh://a").address().unwrap();
        let b = Target::new("ssh://b").address().unwrap();
        let auth = AuthConfig::default();

        let (_, created) = registry.get_or_open(&a, &auth, false, None).await.unwrap();
        assert!(created);
        let (_, created) = registry.get_or_open(&a, &auth, false, None).await.unwrap();
        assert!(!created);
        registry.get_or_open(&b, &auth, true, None).await.unwrap();

        assert_eq!(registry.session_ids().await, vec!["a:22", "b:22"]);
    }

    #[tokio::test]
    async fn test_teardown_skips_transient() {
        let registry = registry();
        let auth = AuthConfig::default();
        let a = Target::new("ssh://a").address().unwrap();
        let b = Target::new("ssh://b").address().unwrap();
        registry.get_or_open(&a, &auth, false, None).await.unwrap();
        registry.get_or_open(&b, &auth, true, None).await.unwrap();

        assert_eq!(registry.teardown().await, 1);
        assert_eq!(registry.session_ids().await, vec!["b:22"]);
        assert!(registry.close("b:22").await.unwrap());
        assert!(!registry.close("b:22").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_connector_is_unsupported() {
        let registry = SessionRegistry::empty();
        let address = Target::new("file:///tmp").address().unwrap();
        let err = registry
            .get_or_open(&address, &AuthConfig::default(), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedTarget(_)));
    }
}
