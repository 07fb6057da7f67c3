use anyhow::{anyhow, bail, Result};
use colored::*;
use std::fmt::Write as _;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info};
use worker_catalog::{
    LogBuffer, LogLevel, SessionDescriptor, SessionId, StopOutcome, WorkerCatalog, WorkerState,
};

const DEFAULT_LOG_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start(String),
    Stop(String),
    Lookup(String),
    Status,
    Logs(usize),
    Help,
    Quit,
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| anyhow!("Empty command"))?
            .to_lowercase();
        let rest = parts.collect::<Vec<_>>().join(" ");
        let argument = |what: &str| -> Result<String> {
            if rest.is_empty() {
                bail!("Usage: {} <{}>", command, what)
            }
            Ok(rest.clone())
        };

        match command.as_str() {
            "start" => Ok(ConsoleCommand::Start(argument("name")?)),
            "stop" => Ok(ConsoleCommand::Stop(argument("id-or-name")?)),
            "lookup" => Ok(ConsoleCommand::Lookup(argument("id-or-name")?)),
            "status" | "ls" => Ok(ConsoleCommand::Status),
            "logs" => {
                let count = if rest.is_empty() {
                    DEFAULT_LOG_LINES
                } else {
                    rest.parse()
                        .map_err(|_| anyhow!("Invalid log line count: {}", rest))?
                };
                Ok(ConsoleCommand::Logs(count))
            }
            "help" | "?" => Ok(ConsoleCommand::Help),
            "quit" | "exit" => Ok(ConsoleCommand::Quit),
            other => bail!("Unknown command: {} (try 'help')", other),
        }
    }
}

/// Line-oriented front end over a [`WorkerCatalog`]
pub struct Console {
    catalog: WorkerCatalog,
    logs: LogBuffer,
}

impl Console {
    pub fn new(catalog: WorkerCatalog, logs: LogBuffer) -> Self {
        Self { catalog, logs }
    }

    /// Read commands until `quit` or end of input, then stop every worker
    pub async fn run<R>(&self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let command = match line.parse::<ConsoleCommand>() {
                Ok(command) => command,
                Err(e) => {
                    eprintln!("{} {}", "Error:".red().bold(), e);
                    continue;
                }
            };

            match self.execute(command).await {
                Ok(Some(output)) => println!("{}", output),
                Ok(None) => return Ok(()),
                Err(e) => eprintln!("{} {}", "Error:".red().bold(), e),
            }
        }

        debug!("Input closed, shutting down");
        println!("{}", self.shutdown().await);
        Ok(())
    }

    /// Run one command. `None` means the console should exit.
    pub async fn execute(&self, command: ConsoleCommand) -> Result<Option<String>> {
        let output = match command {
            ConsoleCommand::Start(name) => {
                let session = SessionDescriptor::new(name);
                // detached: the outcome shows up through lookup and the logs
                let _ = self.catalog.start(session.clone())?;
                format!(
                    "{} {} ({})",
                    "Starting".green().bold(),
                    session.name,
                    session.id
                )
            }
            ConsoleCommand::Stop(query) => {
                let session = self.resolve(&query)?;
                match self.catalog.stop(&session).await {
                    StopOutcome::Stopped { attempts } => format!(
                        "{} {} after {} attempt(s)",
                        "Stopped".green().bold(),
                        session.name,
                        attempts
                    ),
                    StopOutcome::NotFound => {
                        format!("{} {}", "No worker to stop for".yellow(), session.name)
                    }
                    StopOutcome::Failed { attempts } => format!(
                        "{} {} after {} attempts; the worker process may still be running",
                        "Failed to stop".red().bold(),
                        session.name,
                        attempts
                    ),
                }
            }
            ConsoleCommand::Lookup(query) => {
                let session = self.resolve(&query)?;
                if self.catalog.lookup(&session.id).is_some() {
                    format!("{} {}", session.name, "ready".green())
                } else {
                    format!("{} {}", session.name, "not ready yet".yellow())
                }
            }
            ConsoleCommand::Status => self.status(),
            ConsoleCommand::Logs(count) => self.recent_logs(count),
            ConsoleCommand::Help => help_text(),
            ConsoleCommand::Quit => {
                println!("{}", self.shutdown().await);
                return Ok(None);
            }
        };
        Ok(Some(output))
    }

    async fn shutdown(&self) -> String {
        let outcomes = self.catalog.stop_all().await;
        let failed = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StopOutcome::Failed { .. }))
            .count();
        info!(
            "Shut down {} workers ({} failed to stop)",
            outcomes.len(),
            failed
        );
        format!(
            "{} {} worker(s), {} failed",
            "Shut down".bold(),
            outcomes.len(),
            failed
        )
    }

    /// Find a session by id or by its unique name
    fn resolve(&self, query: &str) -> Result<SessionDescriptor> {
        let sessions = self.catalog.sessions();

        if let Ok(id) = query.parse::<SessionId>() {
            let known = sessions.into_iter().find(|status| status.session.id == id);
            return Ok(known
                .map(|status| status.session)
                .unwrap_or_else(|| SessionDescriptor::with_id(id, query)));
        }

        let mut matches = sessions
            .into_iter()
            .filter(|status| status.session.name == query);
        match (matches.next(), matches.next()) {
            (Some(status), None) => Ok(status.session),
            (Some(_), Some(_)) => bail!("Session name '{}' is ambiguous; use its id", query),
            (None, _) => bail!("No session named '{}'", query),
        }
    }

    fn status(&self) -> String {
        let sessions = self.catalog.sessions();
        if sessions.is_empty() {
            return "No sessions".to_string();
        }

        let mut output = format!("{}\n", "Sessions:".bold().green());
        for status in sessions {
            // entries being stopped are already out of the snapshot
            let state = if status.state == WorkerState::Starting {
                "starting".yellow()
            } else {
                "running".green()
            };
            let _ = writeln!(
                output,
                "  {:<24} {} {}",
                status.session.name, status.session.id, state
            );
        }
        output.trim_end().to_string()
    }

    fn recent_logs(&self, count: usize) -> String {
        let entries = self.logs.get_last(count);
        if entries.is_empty() {
            return "No log entries".to_string();
        }

        let mut output = String::new();
        for entry in entries {
            let level = match entry.level {
                LogLevel::Error => entry.level.to_string().red(),
                LogLevel::Warn => entry.level.to_string().yellow(),
                _ => entry.level.to_string().normal(),
            };
            let fields = entry
                .fields
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join(" ");
            let _ = writeln!(
                output,
                "[{}] {:>5} {} {}",
                entry.timestamp,
                level,
                entry.message,
                fields.dimmed()
            );
        }
        output.trim_end().to_string()
    }
}

fn help_text() -> String {
    [
        "start <name>          start a worker for a new session",
        "stop <id-or-name>     stop a session's worker (waits for a slow start)",
        "lookup <id-or-name>   check whether a session's worker is ready",
        "status                list sessions and worker states",
        "logs [n]              show the last n log entries",
        "quit                  stop all workers and exit",
    ]
    .join("\n")
}
