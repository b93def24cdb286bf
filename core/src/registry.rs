//! Central registry keyed by session id.
//!
//! Subscribers and connections hold session ids, never supervisor
//! references; the registry resolves ids on every operation and drops the
//! entry once a terminal session's catch-up TTL lapses, so a later lookup
//! fails with `session_not_found`.

use std::collections::HashMap;
use std::sync::Arc;

use oppi_protocol::ApprovalScope;
use oppi_protocol::PermissionAction;
use oppi_protocol::SessionInfo;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;

use crate::config::CoreConfig;
use crate::engine::EngineFactory;
use crate::error::OppiErr;
use crate::error::Result;
use crate::gate::Resolution;
use crate::policy::PolicyEngine;
use crate::rule_store::RuleStore;
use crate::supervisor::SessionParams;
use crate::supervisor::SessionSupervisor;

pub struct SessionRegistry {
    config: CoreConfig,
    policy: Arc<PolicyEngine>,
    factory: Arc<dyn EngineFactory>,
    sessions: Arc<RwLock<HashMap<String, Arc<SessionSupervisor>>>>,
}

impl SessionRegistry {
    pub async fn new(
        config: CoreConfig,
        store: Arc<dyn RuleStore>,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        let policy = Arc::new(PolicyEngine::new(config.policy.clone(), store).await?);
        Ok(Self {
            config,
            policy,
            factory,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn start_session(&self, params: SessionParams) -> Result<Arc<SessionSupervisor>> {
        let supervisor = SessionSupervisor::spawn(
            params,
            self.config.clone(),
            self.policy.clone(),
            self.factory.as_ref(),
        )
        .await?;
        let session_id = supervisor.session_id().to_string();
        self.sessions
            .write()
            .await
            .insert(session_id.clone(), supervisor.clone());

        // Terminal sessions stay resolvable for the catch-up TTL so
        // reconnecting clients can still replay the ring.
        let sessions = self.sessions.clone();
        let closed = supervisor.closed();
        let ttl = self.config.supervisor.terminal_ttl;
        tokio::spawn(async move {
            closed.cancelled().await;
            tokio::time::sleep(ttl).await;
            sessions.write().await.remove(&session_id);
            debug!(%session_id, "session removed from registry");
        });

        Ok(supervisor)
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<SessionSupervisor>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| OppiErr::SessionNotFound(session_id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|supervisor| supervisor.info())
            .collect()
    }

    /// Route a permission decision to whichever session minted the request
    /// id. Ids are process-unique, so at most one gate knows each.
    pub async fn respond_permission(
        &self,
        id: &str,
        action: PermissionAction,
        scope: ApprovalScope,
    ) -> Result<Resolution> {
        let supervisors: Vec<Arc<SessionSupervisor>> =
            self.sessions.read().await.values().cloned().collect();
        for supervisor in supervisors {
            if supervisor.has_permission(id) {
                return supervisor.respond_permission(id, action, scope).await;
            }
        }
        Err(OppiErr::PermissionNotFound(id.to_string()))
    }

    /// Route an extension UI answer to whichever session minted the request.
    pub async fn respond_extension_ui(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let supervisors: Vec<Arc<SessionSupervisor>> =
            self.sessions.read().await.values().cloned().collect();
        for supervisor in supervisors {
            if supervisor.has_extension_ui(id) {
                return supervisor.respond_extension_ui(id, value).await;
            }
        }
        Err(OppiErr::ExtensionUiNotFound(id.to_string()))
    }

    /// Stop every session; used for graceful server shutdown.
    pub async fn shutdown(&self) {
        let supervisors: Vec<Arc<SessionSupervisor>> =
            self.sessions.read().await.values().cloned().collect();
        for supervisor in supervisors {
            supervisor.stop(Some("server_shutdown".to_string())).await;
        }
        info!("all sessions stopped");
    }
}
