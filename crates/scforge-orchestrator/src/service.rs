//! Public entry point for running build sessions
//!
//! `submit` starts a session in the background and returns its id at once.
//! `build` does the same and waits for the terminal session. Sessions are
//! independent: each gets its own task, workspace, store file and child
//! cancellation token.

use scforge_agent::GenerationClient;
use scforge_core::{
    BuildAttempt, BuildSession, ContractSpecification, ForgeConfig, ForgeError, Result, SessionId,
};
use scforge_toolchain::{Builder, WorkspaceManager};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::loop_controller::{LoopController, LoopSettings};
use crate::session_store::{SessionStore, SessionSummary};

/// A request to turn a specification into a compiled program
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub specification: ContractSpecification,
    /// Falls back to the service default when `None`
    pub max_attempts: Option<u32>,
}

impl BuildRequest {
    pub fn new(specification: ContractSpecification) -> Self {
        Self {
            specification,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// How many finished sessions stay in memory after their task ends
const RECENT_CAPACITY: usize = 16;

struct SessionEntry {
    progress: watch::Receiver<BuildSession>,
    cancel: CancellationToken,
}

/// Running sessions plus a bounded window of recently finished ones
#[derive(Default)]
struct Registry {
    live: HashMap<SessionId, SessionEntry>,
    recent: VecDeque<BuildSession>,
}

impl Registry {
    /// Move a finished session out of the live map
    fn retire(&mut self, session: BuildSession) {
        self.live.remove(&session.id);
        self.recent.retain(|s| s.id != session.id);
        self.recent.push_back(session);
        while self.recent.len() > RECENT_CAPACITY {
            self.recent.pop_front();
        }
    }

    fn recent(&self, id: SessionId) -> Option<&BuildSession> {
        self.recent.iter().find(|s| s.id == id)
    }
}

/// Runs build sessions and answers questions about them
pub struct BuildService {
    controller: Arc<LoopController>,
    default_max_attempts: u32,
    registry: Arc<RwLock<Registry>>,
    shutdown: CancellationToken,
}

impl BuildService {
    pub fn new(controller: LoopController, default_max_attempts: u32) -> Self {
        Self {
            controller: Arc::new(controller),
            default_max_attempts,
            registry: Arc::new(RwLock::new(Registry::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire a service from repository configuration
    ///
    /// Paths in `config` should already be resolved against the repo root.
    pub fn from_config(
        config: &ForgeConfig,
        generator: Arc<dyn GenerationClient>,
        builder: Arc<dyn Builder>,
    ) -> Self {
        let workspaces = WorkspaceManager::from_config(&config.workspace, &config.toolchain);
        let controller = LoopController::new(generator, builder, workspaces)
            .with_store(SessionStore::new(config.store.dir.clone()))
            .with_settings(LoopSettings::from_config(config));

        Self::new(controller, config.loop_defaults.max_attempts)
    }

    fn validate(&self, request: &BuildRequest) -> Result<u32> {
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts == 0 {
            return Err(ForgeError::InvalidRequest(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(max_attempts)
    }

    /// Start a session in the background
    pub async fn submit(&self, request: BuildRequest) -> Result<SessionId> {
        let max_attempts = self.validate(&request)?;
        let session = BuildSession::new(request.specification, max_attempts);
        let id = session.id;

        let (tx, rx) = watch::channel(session.clone());
        let cancel = self.shutdown.child_token();

        self.registry.write().await.live.insert(
            id,
            SessionEntry {
                progress: rx,
                cancel: cancel.clone(),
            },
        );

        info!("Submitted session {}", id);
        let controller = Arc::clone(&self.controller);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let finished = controller.run(session, cancel, Some(tx)).await;
            registry.write().await.retire(finished);
            debug!("Session {} released", id);
        });

        Ok(id)
    }

    /// Run a session to completion
    pub async fn build(&self, request: BuildRequest) -> Result<BuildSession> {
        let id = self.submit(request).await?;
        self.wait(id).await
    }

    /// Latest known state of a session
    ///
    /// Finished sessions are answered from the recent window, then the store.
    pub async fn status(&self, id: SessionId) -> Result<BuildSession> {
        {
            let registry = self.registry.read().await;
            if let Some(entry) = registry.live.get(&id) {
                return Ok(entry.progress.borrow().clone());
            }
            if let Some(session) = registry.recent(id) {
                return Ok(session.clone());
            }
        }
        self.load(id).await
    }

    /// Wait until a session is terminal
    pub async fn wait(&self, id: SessionId) -> Result<BuildSession> {
        let receiver = self
            .registry
            .read()
            .await
            .live
            .get(&id)
            .map(|entry| entry.progress.clone());

        let Some(mut progress) = receiver else {
            return self.status(id).await;
        };

        let finished = progress
            .wait_for(|session| session.is_terminal())
            .await
            .map(|session| session.clone());

        match finished {
            Ok(session) => Ok(session),
            Err(_) => {
                let last = progress.borrow().clone();
                if last.is_terminal() {
                    Ok(last)
                } else {
                    Err(ForgeError::Other(format!(
                        "session {} stopped without reaching a terminal status",
                        id
                    )))
                }
            }
        }
    }

    /// Request cancellation; the session ends as aborted
    ///
    /// Cancelling a session that already finished does nothing.
    pub async fn cancel(&self, id: SessionId) -> Result<()> {
        if let Some(entry) = self.registry.read().await.live.get(&id) {
            info!("Cancelling session {}", id);
            entry.cancel.cancel();
            return Ok(());
        }

        let session = self.status(id).await?;
        debug!("Session {} already {}, nothing to cancel", id, session.status);
        Ok(())
    }

    /// Number of sessions whose loop is still running
    pub async fn active_sessions(&self) -> usize {
        self.registry.read().await.live.len()
    }

    /// Recorded attempts of a session, from the store when one is configured
    pub async fn history(&self, id: SessionId) -> Result<Vec<BuildAttempt>> {
        match self.controller.store() {
            Some(store) => match store.load(id).await {
                Ok(session) => Ok(session.attempts),
                Err(e) => {
                    warn!("Falling back to in-memory history for {}: {}", id, e);
                    Ok(self.status(id).await?.attempts)
                }
            },
            None => Ok(self.status(id).await?.attempts),
        }
    }

    /// Every session in the store, newest first
    ///
    /// Without a store only running and recently finished sessions are known.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>> {
        match self.controller.store() {
            Some(store) => store.list().await,
            None => {
                let registry = self.registry.read().await;
                let mut summaries: Vec<SessionSummary> = registry
                    .live
                    .values()
                    .map(|entry| SessionSummary::from(&*entry.progress.borrow()))
                    .chain(registry.recent.iter().map(SessionSummary::from))
                    .collect();
                summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(summaries)
            }
        }
    }

    /// Cancel every running session
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn load(&self, id: SessionId) -> Result<BuildSession> {
        match self.controller.store() {
            Some(store) => store.load(id).await,
            None => Err(ForgeError::SessionNotFound(id.to_string())),
        }
    }
}
