//! Scripted worker implementations for exercising the catalog's start/stop policies

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::prelude::*;
use worker_catalog::{
    CatalogConfig, LogBuffer, MemoryLogLayer, SessionDescriptor, SessionId, Worker, WorkerCatalog,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBehavior {
    Succeed,
    /// `start()` returns `Ok(false)`
    ReportFailure,
    /// `start()` returns an error
    Error,
    /// `start()` panics
    Panic,
    /// `start()` never completes
    Hang,
}

#[derive(Debug, Clone)]
pub struct WorkerScript {
    pub start_delay: Duration,
    pub start: StartBehavior,
    /// Number of leading `stop()` calls that fail
    pub stop_failures: u32,
}

impl Default for WorkerScript {
    fn default() -> Self {
        Self {
            start_delay: Duration::ZERO,
            start: StartBehavior::Succeed,
            stop_failures: 0,
        }
    }
}

impl WorkerScript {
    pub fn starting_after(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            ..Self::default()
        }
    }

    pub fn with_start(start: StartBehavior) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }

    pub fn failing_stops(stop_failures: u32) -> Self {
        Self {
            stop_failures,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct ScriptedWorker {
    pub session: SessionId,
    script: WorkerScript,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
}

impl ScriptedWorker {
    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn start(&self) -> Result<bool> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if !self.script.start_delay.is_zero() {
            tokio::time::sleep(self.script.start_delay).await;
        }
        match self.script.start {
            StartBehavior::Succeed => Ok(true),
            StartBehavior::ReportFailure => Ok(false),
            StartBehavior::Error => Err(anyhow!("analysis server exited during startup")),
            StartBehavior::Panic => panic!("analysis server bootstrap panicked"),
            StartBehavior::Hang => std::future::pending().await,
        }
    }

    async fn stop(&self) -> Result<()> {
        let call = self.stop_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.script.stop_failures {
            Err(anyhow!("stop attempt {call} refused"))
        } else {
            Ok(())
        }
    }
}

/// Hands out scripted workers and remembers every worker it created
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    script: Mutex<WorkerScript>,
    created: Mutex<Vec<Arc<ScriptedWorker>>>,
}

impl ScriptedFactory {
    pub fn new(script: WorkerScript) -> Self {
        Self {
            script: Mutex::new(script),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn set_script(&self, script: WorkerScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn create_worker(&self, session: &SessionDescriptor) -> Arc<ScriptedWorker> {
        let worker = Arc::new(ScriptedWorker {
            session: session.id,
            script: self.script.lock().unwrap().clone(),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        });
        self.created.lock().unwrap().push(worker.clone());
        worker
    }

    pub fn created(&self) -> Vec<Arc<ScriptedWorker>> {
        self.created.lock().unwrap().clone()
    }

    pub fn workers_for(&self, session: &SessionId) -> Vec<Arc<ScriptedWorker>> {
        self.created()
            .into_iter()
            .filter(|worker| &worker.session == session)
            .collect()
    }
}

pub fn catalog_with(script: WorkerScript) -> (WorkerCatalog, Arc<ScriptedFactory>) {
    catalog_with_config(script, CatalogConfig::default())
}

pub fn catalog_with_config(
    script: WorkerScript,
    config: CatalogConfig,
) -> (WorkerCatalog, Arc<ScriptedFactory>) {
    let factory = Arc::new(ScriptedFactory::new(script));
    let creator = factory.clone();
    let catalog = WorkerCatalog::with_config(
        move |session: &SessionDescriptor| -> Arc<dyn Worker> { creator.create_worker(session) },
        config,
    );
    (catalog, factory)
}

/// Capture events emitted on this thread into a buffer
pub fn capture_logs() -> (LogBuffer, DefaultGuard) {
    let buffer = LogBuffer::with_capacity(1000);
    let subscriber = tracing_subscriber::registry().with(MemoryLogLayer::new(buffer.clone()));
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}
