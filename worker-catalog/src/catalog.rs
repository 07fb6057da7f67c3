use crate::config::CatalogConfig;
use crate::error::{CatalogError, RetryError};
use crate::retry::{poll_until, retry_with_policy};
use crate::session::{SessionDescriptor, SessionId};
use crate::worker::{Worker, WorkerFactory};
use anyhow::anyhow;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    /// Created by the factory, `start()` still in progress. Not visible to lookups.
    Starting,
    /// Started successfully and available to request routing
    Running,
    /// Taken out of the catalog, `stop()` in progress. Never appears in
    /// [`WorkerCatalog::sessions`] snapshots.
    Stopping,
}

struct CatalogEntry {
    session: SessionDescriptor,
    worker: Arc<dyn Worker>,
    state: WorkerState,
}

/// Point-in-time view of one catalog entry
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: SessionDescriptor,
    pub state: WorkerState,
}

/// How a call to [`WorkerCatalog::stop`] ended. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopOutcome {
    /// No running worker showed up within the registration wait
    NotFound,
    Stopped { attempts: u32 },
    /// Every stop attempt failed; the worker process may have leaked
    Failed { attempts: u32 },
}

/// Keeps at most one analysis worker per session.
///
/// Every read and write of the session map is a single DashMap operation and no
/// map guard is ever held across an `.await`, so a slow start or stop of one
/// session never blocks another.
#[derive(Clone)]
pub struct WorkerCatalog {
    entries: Arc<DashMap<SessionId, CatalogEntry>>,
    factory: Arc<dyn WorkerFactory>,
    config: Arc<CatalogConfig>,
}

impl std::fmt::Debug for WorkerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCatalog")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish()
    }
}

impl WorkerCatalog {
    pub fn new<F: WorkerFactory>(factory: F) -> Self {
        Self::with_config(factory, CatalogConfig::default())
    }

    pub fn with_config<F: WorkerFactory>(factory: F, config: CatalogConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            factory: Arc::new(factory),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// The running worker for a session, if any.
    ///
    /// `None` is expected while the worker is still starting.
    pub fn lookup(&self, session_id: &SessionId) -> Option<Arc<dyn Worker>> {
        let entry = self.entries.get(session_id)?;
        if entry.state == WorkerState::Running {
            Some(entry.worker.clone())
        } else {
            None
        }
    }

    /// Create a worker for `session` and start it in the background.
    ///
    /// Fails only if the session already has a starting or running worker.
    /// The start itself is best-effort: its outcome is observable through
    /// [`WorkerCatalog::lookup`] and log events. The returned handle never
    /// needs to be awaited.
    pub fn start(&self, session: SessionDescriptor) -> Result<JoinHandle<()>, CatalogError> {
        // the factory runs while the vacant slot is held, so it must not call back into the catalog
        let worker = match self.entries.entry(session.id) {
            Entry::Occupied(_) => {
                return Err(CatalogError::DuplicateSession {
                    session_id: session.id,
                });
            }
            Entry::Vacant(slot) => {
                let worker = self.factory.create(&session);
                slot.insert(CatalogEntry {
                    session: session.clone(),
                    worker: worker.clone(),
                    state: WorkerState::Starting,
                });
                worker
            }
        };
        debug!(session = %session.id, name = %session.name, "Initialized a new worker");

        let entries = self.entries.clone();
        Ok(tokio::spawn(Self::run_start(entries, session, worker)))
    }

    async fn run_start(
        entries: Arc<DashMap<SessionId, CatalogEntry>>,
        session: SessionDescriptor,
        worker: Arc<dyn Worker>,
    ) {
        let started = match AssertUnwindSafe(worker.start()).catch_unwind().await {
            Ok(Ok(started)) => started,
            Ok(Err(e)) => {
                error!(session = %session.id, name = %session.name, error = %e, "Error occurred starting worker");
                false
            }
            Err(panic) => {
                error!(
                    session = %session.id,
                    name = %session.name,
                    panic = %panic_message(panic.as_ref()),
                    "Worker panicked while starting"
                );
                false
            }
        };

        debug!(session = %session.id, started, "Attempted to start worker");

        if !started {
            entries.remove_if(&session.id, |_, entry| {
                entry.state == WorkerState::Starting && Arc::ptr_eq(&entry.worker, &worker)
            });
            warn!(session = %session.id, name = %session.name, "Worker failed to start; session has no worker");
            return;
        }

        // only this task removes or promotes its Starting entry
        if let Some(mut entry) = entries.get_mut(&session.id) {
            entry.state = WorkerState::Running;
        }
        info!(session = %session.id, name = %session.name, "Registered worker for session");
    }

    /// Stop the worker of `session`, waiting for it to finish starting if needed.
    ///
    /// The entry is removed from the catalog before `stop()` is invoked, so a
    /// concurrent second stop cannot act on the same worker. Never fails.
    pub async fn stop(&self, session: &SessionDescriptor) -> StopOutcome {
        debug!(session = %session.id, name = %session.name, "Finding worker to stop");

        let entries = &self.entries;
        let session_id = session.id;
        let found = poll_until(
            &self.config.registration_wait,
            "find worker to stop",
            |_attempt| async move { Self::take_running(entries, &session_id) },
        )
        .await;

        let Some((entry, attempt)) = found else {
            info!(
                session = %session.id,
                name = %session.name,
                attempts = self.config.registration_wait.max_attempts,
                "No worker found to stop"
            );
            return StopOutcome::NotFound;
        };

        debug!(session = %session.id, attempt, state = ?entry.state, "Found worker to stop");

        let worker = entry.worker;
        let result = retry_with_policy(&self.config.stop_retry, "worker stop", |attempt| {
            let worker = worker.clone();
            let session_id = session.id;
            async move {
                let result = match AssertUnwindSafe(worker.stop()).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(anyhow!(
                        "worker panicked while stopping: {}",
                        panic_message(panic.as_ref())
                    )),
                };
                if let Err(e) = &result {
                    warn!(session = %session_id, attempt, error = %e, "Stop attempt failed");
                }
                result
            }
        })
        .await;

        match result {
            Ok(((), attempts)) => {
                info!(session = %session.id, name = %session.name, attempts, "Stopped worker");
                StopOutcome::Stopped { attempts }
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
                ..
            }) => {
                error!(
                    session = %session.id,
                    name = %session.name,
                    attempts,
                    error = %last_error,
                    "Error stopping worker; the worker process may have leaked"
                );
                StopOutcome::Failed { attempts }
            }
        }
    }

    /// Atomically remove a running entry, marking it as stopping
    fn take_running(
        entries: &DashMap<SessionId, CatalogEntry>,
        session_id: &SessionId,
    ) -> Option<CatalogEntry> {
        entries
            .remove_if(session_id, |_, entry| entry.state == WorkerState::Running)
            .map(|(_, mut entry)| {
                entry.state = WorkerState::Stopping;
                entry
            })
    }

    /// Stop every session currently in the catalog, concurrently
    pub async fn stop_all(&self) -> Vec<(SessionId, StopOutcome)> {
        let sessions: Vec<SessionDescriptor> = self
            .entries
            .iter()
            .map(|entry| entry.session.clone())
            .collect();

        if sessions.is_empty() {
            return Vec::new();
        }
        info!("Stopping {} workers", sessions.len());

        let stops = sessions.iter().map(|session| async move {
            let outcome = self.stop(session).await;
            (session.id, outcome)
        });
        futures::future::join_all(stops).await
    }

    /// Snapshot of all entries, ordered by session name
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<SessionStatus> = self
            .entries
            .iter()
            .map(|entry| SessionStatus {
                session: entry.session.clone(),
                state: entry.state,
            })
            .collect();
        sessions.sort_by(|a, b| a.session.name.cmp(&b.session.name));
        sessions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
