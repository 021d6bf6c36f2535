//! Engine client backed by a long-lived child process.
//!
//! The child speaks line-delimited JSON on stdin/stdout:
//! - request: `{"id": "r1", "unit_id": "...", "path": "..."}`
//! - response: `{"id": "r1", "records": [...]}` or
//!   `{"id": "r1", "error": "...", "invalid_input": true}`
//! - health check: `{"id": "p1", "ping": true}` answered by `{"id": "p1", "pong": true}`

use async_trait::async_trait;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::error::EngineError;
use super::record::{map_record_set, RecordSet};
use super::traits::{EngineClient, EngineFactory};
use crate::config::EngineConfig;
use crate::discovery::WorkUnit;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Launches [`ProcessEngine`] instances from an [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    config: EngineConfig,
}

impl ProcessEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EngineFactory for ProcessEngineFactory {
    type Client = ProcessEngine;

    fn name(&self) -> &str {
        "process"
    }

    async fn create(&self) -> Result<ProcessEngine, EngineError> {
        let mut engine = ProcessEngine::spawn(&self.config)?;
        let startup = Duration::from_secs(self.config.startup_timeout_secs);

        match timeout(startup, engine.ping()).await {
            Ok(Ok(())) => {
                debug!(pid = ?engine.pid(), "Engine instance started");
                Ok(engine)
            }
            Ok(Err(e)) => {
                engine.shutdown().await;
                Err(e)
            }
            Err(_) => {
                engine.shutdown().await;
                Err(EngineError::SpawnFailed {
                    path: self.config.path.clone(),
                    reason: format!(
                        "no answer to startup ping within {}s",
                        self.config.startup_timeout_secs
                    ),
                })
            }
        }
    }
}

/// One running engine process.
pub struct ProcessEngine {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_request: u64,
    pid: Option<u32>,
}

impl ProcessEngine {
    fn spawn(config: &EngineConfig) -> Result<Self, EngineError> {
        let spawn_failed = |reason: String| EngineError::SpawnFailed {
            path: config.path.clone(),
            reason,
        };

        let mut child = Command::new(&config.path)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("stdout not captured".to_string()))?;

        Ok(Self {
            pid: child.id(),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            next_request: 0,
        })
    }

    /// OS process id of the engine, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_request += 1;
        format!("{}{}", prefix, self.next_request)
    }

    async fn send(&mut self, message: &Value) -> Result<(), EngineError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| EngineError::Connection("stdin already closed".to_string()))?;

        let mut line = serde_json::to_vec(message).map_err(|e| EngineError::protocol(e.to_string()))?;
        line.push(b'\n');

        stdin
            .write_all(&line)
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))
    }

    async fn receive(&mut self, expected_id: &str) -> Result<Value, EngineError> {
        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Err(self.exit_error()),
                Err(e) => return Err(EngineError::Connection(e.to_string())),
            };
            if line.trim().is_empty() {
                continue;
            }

            let value: Value = serde_json::from_str(&line)
                .map_err(|e| EngineError::protocol(format!("invalid JSON line: {}", e)))?;

            return match value.get("id").and_then(Value::as_str) {
                Some(id) if id == expected_id => Ok(value),
                Some(id) => Err(EngineError::protocol(format!(
                    "expected response {}, got {}",
                    expected_id, id
                ))),
                None => Err(EngineError::protocol("response without id")),
            };
        }
    }

    fn exit_error(&mut self) -> EngineError {
        match self.child.try_wait() {
            Ok(Some(status)) => EngineError::Crashed(format!("engine exited with {}", status)),
            _ => EngineError::Connection("engine closed stdout".to_string()),
        }
    }

    async fn ping(&mut self) -> Result<(), EngineError> {
        let id = self.next_id("p");
        self.send(&json!({ "id": id, "ping": true })).await?;
        let response = self.receive(&id).await?;

        if response.get("pong").and_then(Value::as_bool) == Some(true) {
            Ok(())
        } else {
            Err(EngineError::protocol("unexpected ping response"))
        }
    }

    async fn parse_one(&mut self, unit: &WorkUnit) -> Result<RecordSet, EngineError> {
        let id = self.next_id("r");
        let request = json!({
            "id": id,
            "unit_id": unit.id,
            "path": unit.source.to_string_lossy(),
        });
        self.send(&request).await?;
        let response = self.receive(&id).await?;

        if let Some(error) = response.get("error").and_then(Value::as_str) {
            let invalid_input = response
                .get("invalid_input")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            return Err(if invalid_input {
                EngineError::invalid_input(&unit.id, error)
            } else {
                EngineError::Reported(error.to_string())
            });
        }

        let records = response
            .get("records")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::protocol("response has no records"))?;

        map_record_set(&unit.id, records)
    }
}

#[async_trait]
impl EngineClient for ProcessEngine {
    async fn parse(
        &mut self,
        units: &[WorkUnit],
        limit: Duration,
    ) -> Result<Vec<RecordSet>, EngineError> {
        let result = timeout(limit, async {
            let mut sets = Vec::with_capacity(units.len());
            for unit in units {
                sets.push(self.parse_one(unit).await?);
            }
            Ok::<_, EngineError>(sets)
        })
        .await;

        match result {
            Ok(sets) => sets,
            Err(_) => {
                // The engine may still be chewing on the request; its
                // responses would desynchronise the pipe.
                if let Err(e) = self.child.start_kill() {
                    warn!(pid = ?self.pid, "Failed to kill timed-out engine: {}", e);
                }
                Err(EngineError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    async fn health_check(&mut self) -> bool {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return false;
        }
        matches!(timeout(PING_TIMEOUT, self.ping()).await, Ok(Ok(())))
    }

    async fn shutdown(&mut self) {
        // Closing stdin asks the engine to exit on its own.
        self.stdin.take();

        if timeout(SHUTDOWN_GRACE, self.child.wait()).await.is_err() {
            warn!(pid = ?self.pid, "Engine did not exit after stdin closed, killing");
            let _ = self.child.kill().await;
        }
    }
}
