//! Session lifecycle: admission, provisioning, termination.
//!
//! The manager is the single source of truth for sessions. It admits
//! creations against a per-project concurrency cap, coordinates container
//! launch with profile load, owns the sidecar connections, and drives every
//! session to exactly one terminal status — whether through an explicit
//! delete or the expiry timer.

use crate::browser::LaunchOptions;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{CreateSessionRequest, Session, SessionStatus};
use crate::region::RegionManager;
use crate::sidecar::SidecarConnection;
use crate::store::{self, ContextStore};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_TIMEOUT_SECS: u64 = 3600;
const MIN_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 21600;
const SIDECAR_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    sidecars: RwLock<HashMap<String, Arc<SidecarConnection>>>,
    concurrency: Mutex<HashMap<String, Arc<Semaphore>>>,
    /// Sessions currently inside the teardown sequence. Claiming an entry
    /// here while the session still reads RUNNING is what resolves the
    /// delete-vs-timeout race: the loser observes the claim and backs off.
    teardowns: Mutex<HashSet<String>>,
    region_mgr: Arc<RegionManager>,
    store: Arc<ContextStore>,
    config: Config,
}

impl SessionManager {
    pub fn new(region_mgr: Arc<RegionManager>, store: Arc<ContextStore>, config: Config) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            sidecars: RwLock::new(HashMap::new()),
            concurrency: Mutex::new(HashMap::new()),
            teardowns: Mutex::new(HashSet::new()),
            region_mgr,
            store,
            config,
        }
    }

    pub async fn create_session(self: Arc<Self>, req: CreateSessionRequest) -> Result<Session> {
        if req.project_id.is_empty() {
            return Err(Error::Validation("projectId is required".into()));
        }

        let timeout = req.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout) {
            return Err(Error::Validation(format!(
                "timeout must be between {} and {} seconds",
                MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
            )));
        }

        let region = self
            .region_mgr
            .route_session(req.region.as_deref().unwrap_or_default());

        self.acquire_slot(&req.project_id)?;

        let session_id = Uuid::new_v4().to_string();
        let context_id = req.context_id.filter(|id| !id.is_empty());

        let user_data_dir = match &context_id {
            Some(ctx_id) => match self.prepare_context_dir(ctx_id).await {
                Ok(dir) => dir,
                Err(e) => {
                    self.release_slot(&req.project_id);
                    return Err(e);
                }
            },
            None => String::new(),
        };

        let opts = LaunchOptions {
            session_id: session_id.clone(),
            user_data_dir,
        };

        let instance = match self.region_mgr.launch_browser(region, opts).await {
            Ok(instance) => instance,
            Err(e) => {
                // Admission already happened, so the failure is recorded as
                // a terminal ERROR session before the permit goes back.
                let now = Utc::now();
                let failed = Session {
                    id: session_id,
                    project_id: req.project_id.clone(),
                    status: SessionStatus::Error,
                    region: region.to_string(),
                    started_at: now,
                    expires_at: now + chrono::Duration::seconds(timeout as i64),
                    timeout,
                    connect_url: String::new(),
                    context_id,
                    container_id: String::new(),
                    user_data_dir: String::new(),
                };
                self.sessions
                    .write()
                    .await
                    .insert(failed.id.clone(), failed);
                self.release_slot(&req.project_id);
                return Err(Error::Provisioning(e.to_string()));
            }
        };

        let now = Utc::now();
        let session = Session {
            id: session_id.clone(),
            project_id: req.project_id.clone(),
            status: SessionStatus::Running,
            region: region.to_string(),
            started_at: now,
            expires_at: now + chrono::Duration::seconds(timeout as i64),
            timeout,
            connect_url: instance.connect_url.clone(),
            context_id,
            container_id: instance.container_id.clone(),
            user_data_dir: instance.user_data_dir.clone(),
        };

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());

        // Scripted control is optional: a session without a sidecar still
        // serves the debug proxy.
        match SidecarConnection::start(
            &session_id,
            &self.config.sidecar_command,
            &instance.connect_url,
        )
        .await
        {
            Ok(conn) => {
                self.sidecars
                    .write()
                    .await
                    .insert(session_id.clone(), Arc::new(conn));
            }
            Err(e) => {
                warn!(session = %session_id, "failed to start sidecar: {}", e);
            }
        }

        let manager = Arc::clone(&self);
        let expiry_id = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout)).await;
            if let Err(e) = manager.terminate(&expiry_id, SessionStatus::TimedOut).await {
                match e {
                    Error::NotRunning | Error::NotFound(_) => {}
                    other => warn!(session = %expiry_id, "timeout teardown failed: {}", other),
                }
            }
        });

        info!(
            session = %session_id,
            project = %session.project_id,
            region = %session.region,
            "Session created"
        );
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(Error::NotFound("session"))
    }

    pub async fn list_sessions(
        &self,
        project_id: Option<&str>,
        status: Option<SessionStatus>,
    ) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| project_id.map_or(true, |p| s.project_id == p))
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect()
    }

    /// Explicit close. Requires RUNNING; ends in COMPLETED.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        self.terminate(id, SessionStatus::Completed).await
    }

    pub async fn sidecar_connection(&self, session_id: &str) -> Option<Arc<SidecarConnection>> {
        self.sidecars.read().await.get(session_id).cloned()
    }

    /// The shared terminal-teardown sequence: close the sidecar, archive the
    /// profile, stop the container, then flip the status and hand the permit
    /// back. Only the caller that wins the RUNNING claim gets here.
    async fn terminate(&self, id: &str, final_status: SessionStatus) -> Result<()> {
        let session = self.claim_teardown(id).await?;

        if let Some(conn) = self.sidecars.write().await.remove(id) {
            info!(session = %id, "Closing sidecar connection");
            conn.close(SIDECAR_CLOSE_TIMEOUT).await;
        }

        // The profile must be archived before the container goes away: the
        // user data dir can live inside container-scoped storage.
        if let (Some(ctx_id), false) = (&session.context_id, session.user_data_dir.is_empty()) {
            let store = Arc::clone(&self.store);
            let ctx_id = ctx_id.clone();
            let dir = std::path::PathBuf::from(&session.user_data_dir);
            let saved = tokio::task::spawn_blocking(move || store.save_context_data(&ctx_id, &dir))
                .await
                .map_err(|e| Error::Other(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = saved {
                warn!(session = %id, "failed to save context: {}", e);
            }
        }

        if !session.container_id.is_empty() {
            match tokio::time::timeout(
                CONTAINER_STOP_TIMEOUT,
                self.region_mgr.stop_browser(&session.container_id),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(session = %id, "failed to stop container: {}", e),
                Err(_) => warn!(session = %id, "container stop timed out"),
            }
        }

        {
            let mut sessions = self.sessions.write().await;
            let mut updated = session.clone();
            updated.status = final_status;
            sessions.insert(id.to_string(), updated);
        }
        self.teardowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);

        self.release_slot(&session.project_id);
        info!(session = %id, status = ?final_status, "Session terminated");
        Ok(())
    }

    /// Atomically claim the right to tear a session down. Exactly one
    /// caller per session ever succeeds.
    async fn claim_teardown(&self, id: &str) -> Result<Session> {
        let session = self.get_session(id).await?;
        if session.status != SessionStatus::Running {
            return Err(Error::NotRunning);
        }

        let mut teardowns = self.teardowns.lock().unwrap_or_else(|e| e.into_inner());
        if !teardowns.insert(id.to_string()) {
            return Err(Error::NotRunning);
        }
        Ok(session)
    }

    /// Resolve the user data dir for a context-backed session: extract the
    /// saved archive, or start a fresh directory on first use.
    async fn prepare_context_dir(&self, context_id: &str) -> Result<String> {
        self.store.get_context(context_id)?;

        let store = Arc::clone(&self.store);
        let ctx_id = context_id.to_string();
        let loaded = tokio::task::spawn_blocking(move || store.load_context_data(&ctx_id))
            .await
            .map_err(|e| Error::Other(e.to_string()))?;

        match loaded {
            Ok(dir) => Ok(dir.display().to_string()),
            Err(_) => {
                let dir = store::extraction_dir(context_id);
                std::fs::create_dir_all(&dir)?;
                Ok(dir.display().to_string())
            }
        }
    }

    fn acquire_slot(&self, project_id: &str) -> Result<()> {
        let sem = {
            let mut concurrency = self.concurrency.lock().unwrap_or_else(|e| e.into_inner());
            concurrency
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.project_concurrency)))
                .clone()
        };

        let result = match sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(Error::ConcurrencyExceeded(project_id.to_string())),
        };
        result
    }

    fn release_slot(&self, project_id: &str) {
        let sem = {
            let concurrency = self.concurrency.lock().unwrap_or_else(|e| e.into_inner());
            concurrency.get(project_id).cloned()
        };
        if let Some(sem) = sem {
            sem.add_permits(1);
        }
    }

    #[cfg(test)]
    fn available_permits(&self, project_id: &str) -> Option<usize> {
        let concurrency = self.concurrency.lock().unwrap_or_else(|e| e.into_inner());
        concurrency.get(project_id).map(|s| s.available_permits())
    }

    /// Test seam: place a session into the live index directly.
    #[cfg(test)]
    pub(crate) async fn insert_session_for_test(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }
}
