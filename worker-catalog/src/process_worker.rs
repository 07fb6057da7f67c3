use crate::client::LimitedClient;
use crate::config::WorkerConfig;
use crate::session::SessionDescriptor;
use crate::worker::{Worker, WorkerFactory};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

struct RunningProcess {
    child: Child,
    output_tasks: Vec<JoinHandle<()>>,
}

/// A worker backed by a child process running the configured analysis server
pub struct ProcessWorker {
    session: SessionDescriptor,
    config: Arc<WorkerConfig>,
    client: LimitedClient,
    process: Mutex<Option<RunningProcess>>,
}

impl std::fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("session", &self.session)
            .field("command", &self.config.command)
            .field("call_capacity", &self.client.limiter().capacity())
            .finish()
    }
}

impl ProcessWorker {
    pub fn new(
        session: SessionDescriptor,
        config: Arc<WorkerConfig>,
        client: LimitedClient,
    ) -> Self {
        Self {
            session,
            config,
            client,
            process: Mutex::new(None),
        }
    }

    /// Gate for outbound calls to this worker's API. The permit pool is shared
    /// with every other worker built by the same factory.
    pub fn client(&self) -> &LimitedClient {
        &self.client
    }

    /// Arguments with `{session}` and `{name}` substituted
    pub fn expanded_args(&self) -> Vec<String> {
        let id = self.session.id.to_string();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{session}", &id)
                    .replace("{name}", &self.session.name)
            })
            .collect()
    }

    /// PID of the worker process, if it is running
    pub fn pid(&self) -> Option<u32> {
        let process = self.process.try_lock().ok()?;
        process.as_ref().and_then(|p| p.child.id())
    }

    fn spawn(&self) -> Result<Child> {
        let args = self.expanded_args();
        info!(
            session = %self.session.id,
            "Spawning worker: {} {}",
            self.config.command,
            args.join(" ")
        );

        let mut command = Command::new(&self.config.command);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.command))
    }

    /// Drain stdout for the life of the process, signalling once the ready marker appears
    fn watch_stdout(
        &self,
        child: &mut Child,
        ready_tx: oneshot::Sender<()>,
    ) -> Result<JoinHandle<()>> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to get stdout"))?;
        let marker = self.config.ready_marker.clone();
        let session_id = self.session.id;

        Ok(tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        debug!(target: "worker_stdout", session = %session_id, "{}", line);
                        if line.contains(&marker) {
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(target: "worker_stdout", session = %session_id, "Stdout EOF reached");
                        break;
                    }
                    Err(e) => {
                        warn!(target: "worker_stdout", session = %session_id, "Error reading stdout: {}", e);
                        break;
                    }
                }
            }
        }))
    }

    fn forward_stderr(&self, child: &mut Child) -> Option<JoinHandle<()>> {
        let stderr = child.stderr.take()?;
        let session_id = self.session.id;
        Some(tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "worker_stderr", session = %session_id, "{}", line);
            }
        }))
    }

    async fn terminate(process: &mut RunningProcess, wait: Duration) -> Result<()> {
        if let Err(e) = process.child.start_kill() {
            debug!("Kill signal not delivered (process may have exited): {}", e);
        }
        match timeout(wait, process.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Worker process exited with status: {}", status);
                for task in process.output_tasks.drain(..) {
                    task.abort();
                }
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow!("Error waiting for worker process to exit: {}", e)),
            Err(_) => Err(anyhow!(
                "Timed out after {}s waiting for worker process to exit",
                wait.as_secs()
            )),
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn start(&self) -> Result<bool> {
        let mut guard = self.process.lock().await;
        if let Some(process) = guard.as_mut() {
            if process.child.try_wait()?.is_none() {
                debug!(session = %self.session.id, "Worker process already running");
                return Ok(true);
            }
            *guard = None;
        }

        let mut child = self.spawn()?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut output_tasks = vec![self.watch_stdout(&mut child, ready_tx)?];
        output_tasks.extend(self.forward_stderr(&mut child));
        let mut process = RunningProcess {
            child,
            output_tasks,
        };

        let ready = if self.config.ready_marker.is_empty() {
            true
        } else {
            let startup_timeout = Duration::from_secs(self.config.startup_timeout_secs);
            match timeout(startup_timeout, ready_rx).await {
                Ok(Ok(())) => true,
                Ok(Err(_)) => {
                    warn!(session = %self.session.id, "Worker closed stdout before reporting ready");
                    false
                }
                Err(_) => {
                    warn!(
                        session = %self.session.id,
                        "Worker did not report ready within {}s",
                        startup_timeout.as_secs()
                    );
                    false
                }
            }
        };

        if ready {
            info!(session = %self.session.id, pid = ?process.child.id(), "Worker process is ready");
            *guard = Some(process);
            return Ok(true);
        }

        let stop_timeout = Duration::from_secs(self.config.stop_timeout_secs);
        if let Err(e) = Self::terminate(&mut process, stop_timeout).await {
            warn!(session = %self.session.id, "Failed to clean up worker that never became ready: {}", e);
        }
        Ok(false)
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.process.lock().await;
        let Some(process) = guard.as_mut() else {
            debug!(session = %self.session.id, "Worker process not running; nothing to stop");
            return Ok(());
        };

        // on failure the process stays tracked so a retry can try again
        let stop_timeout = Duration::from_secs(self.config.stop_timeout_secs);
        Self::terminate(process, stop_timeout).await?;
        *guard = None;
        debug!(session = %self.session.id, "Worker process stopped");
        Ok(())
    }
}

/// Builds [`ProcessWorker`]s from a shared [`WorkerConfig`] and call limiter
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    config: Arc<WorkerConfig>,
    client: LimitedClient,
}

impl ProcessWorkerFactory {
    pub fn new(config: WorkerConfig, client: LimitedClient) -> Self {
        Self {
            config: Arc::new(config),
            client,
        }
    }

    pub fn client(&self) -> &LimitedClient {
        &self.client
    }

    pub fn build(&self, session: &SessionDescriptor) -> ProcessWorker {
        ProcessWorker::new(session.clone(), self.config.clone(), self.client.clone())
    }

    /// Whether the configured command can be found on `PATH`
    pub fn is_available(&self) -> bool {
        match which::which(&self.config.command) {
            Ok(path) => {
                tracing::trace!("Worker command found at: {:?}", path);
                true
            }
            Err(e) => {
                tracing::trace!("Worker command {} not available: {}", self.config.command, e);
                false
            }
        }
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self, session: &SessionDescriptor) -> Arc<dyn Worker> {
        Arc::new(self.build(session))
    }
}
