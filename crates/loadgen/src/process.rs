//! Auxiliary processes started alongside a run.
//!
//! The challenge responder answers the service's HTTP-01 validation requests
//! on behalf of the simulated accounts. The runner only needs to start it
//! before dispatch and stop it after draining, so it sees the process through
//! the narrow [`ManagedProcess`] trait.

use crate::config::ChallengeConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info};

/// How long a started responder has to accept connections.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An external process the runner starts and stops.
#[async_trait]
pub trait ManagedProcess: Send {
    /// Start the process. Failure aborts the run.
    async fn start(&mut self) -> Result<(), ProcessError>;

    /// Stop the process.
    async fn stop(&mut self) -> Result<(), ProcessError>;
}

/// Used when the challenge responder runs elsewhere or is not needed.
#[derive(Debug, Default)]
pub struct NoopProcess;

#[async_trait]
impl ManagedProcess for NoopProcess {
    async fn start(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// The challenge responder, run as a child process.
#[derive(Debug)]
pub struct ChallengeServerProcess {
    program: PathBuf,
    args: Vec<String>,
    ready_addr: Option<String>,
    ready_timeout: Duration,
    child: Option<Child>,
}

impl ChallengeServerProcess {
    /// Run `program` with `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ready_addr: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            child: None,
        }
    }

    /// Hold `start` until `addr` accepts connections, for at most `timeout`.
    pub fn with_readiness(mut self, addr: impl Into<String>, timeout: Duration) -> Self {
        self.ready_addr = Some(addr.into());
        self.ready_timeout = timeout;
        self
    }

    /// Re-invoke the configured binary (or the current executable) with the
    /// `chall-srv` subcommand.
    pub fn from_config(config: &ChallengeConfig) -> Result<Self, ProcessError> {
        let program = match &config.binary {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(ProcessError::CurrentExe)?,
        };
        let args = vec![
            "chall-srv".to_string(),
            "--rpc-addr".to_string(),
            config.rpc_addr.clone(),
            "--http-one-addr".to_string(),
            config.http_one_addr.clone(),
        ];
        Ok(Self::new(program, args)
            .with_readiness(config.rpc_addr.clone(), DEFAULT_READY_TIMEOUT))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    async fn wait_for_ready(&mut self, addr: &str) -> Result<(), ProcessError> {
        let start = Instant::now();
        while start.elapsed() < self.ready_timeout {
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.child = None;
                    return Err(ProcessError::Exited(status.to_string()));
                }
            }
            if TcpStream::connect(addr).await.is_ok() {
                debug!(
                    addr,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Challenge server ready"
                );
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(ProcessError::NotReady(addr.to_string(), self.ready_timeout))
    }
}

#[async_trait]
impl ManagedProcess for ChallengeServerProcess {
    async fn start(&mut self) -> Result<(), ProcessError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Start(self.program.clone(), e))?;
        info!(
            program = %self.program.display(),
            pid = child.id().unwrap_or_default(),
            "Started challenge server"
        );
        self.child = Some(child);

        if let Some(addr) = self.ready_addr.clone() {
            if let Err(e) = self.wait_for_ready(&addr).await {
                // A responder that never came up is not left running.
                self.stop().await?;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        child.kill().await.map_err(ProcessError::Stop)?;
        info!("Stopped challenge server");
        Ok(())
    }
}

/// Process errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to start {}: {}", .0.display(), .1)]
    Start(PathBuf, #[source] std::io::Error),

    #[error("Failed to stop process: {0}")]
    Stop(#[source] std::io::Error),

    #[error("Challenge server exited during startup: {0}")]
    Exited(String),

    #[error("Challenge server at {0} not ready after {1:?}")]
    NotReady(String, Duration),

    #[error("Cannot locate current executable: {0}")]
    CurrentExe(#[source] std::io::Error),
}
