//! Remote agent dispatch for phase execution.
//!
//! Every node in an operation runs an RPC agent reachable by its advertise
//! address and authenticated with TLS material from the secrets directory.
//! The runner decides, per target server, where a phase can execute:
//!
//! - `Local` - the target's advertise address is one of ours
//! - `Remote` - a reachable agent answered a short dial probe
//! - `RemoteRequired` - neither; the phase must be driven from the target
//!
//! The transport itself stays behind the `AgentDialer`/`AgentClient`
//! traits; this module owns pooling, probing, credentials, and local
//! subprocess execution.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{OperationError, Result};
use crate::plan::Server;

/// Where a phase targeting a given server can run from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionLocation {
    /// The target is this host
    Local,
    /// The target's agent is reachable
    Remote,
    /// Only the target itself can run the phase
    RemoteRequired,
}

/// Captured output of an agent command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A connected per-node agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run an anvil command on the agent's node.
    async fn command(&self, args: &[String]) -> Result<CommandOutput>;

    /// Ask the agent process to exit.
    async fn shutdown(&self) -> Result<()>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}

/// Transport seam producing connected agents.
#[async_trait]
pub trait AgentDialer: Send + Sync {
    async fn dial(
        &self,
        addr: IpAddr,
        credentials: &AgentCredentials,
    ) -> Result<Arc<dyn AgentClient>>;
}

/// TLS material for agent connections, loaded from the secrets directory.
///
/// The runner only loads credentials; generating them is install-time
/// tooling's job.
#[derive(Debug, Clone)]
pub struct AgentCredentials {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    pub ca: Vec<u8>,
}

impl AgentCredentials {
    /// Load `client.crt`, `client.key`, and `ca.crt` from a directory.
    pub fn load(secrets_dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<Vec<u8>> {
            let path = secrets_dir.join(name);
            std::fs::read(&path).map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    OperationError::not_found(format!(
                        "agent credentials at {}",
                        path.display()
                    ))
                } else {
                    OperationError::transient_with(
                        format!("reading {}", path.display()),
                        err.into(),
                    )
                }
            })
        };
        Ok(Self {
            cert: read("client.crt")?,
            key: read("client.key")?,
            ca: read("ca.crt")?,
        })
    }
}

/// Configuration for the agent runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Advertise addresses of this host
    pub local_addrs: HashSet<IpAddr>,
    /// Binary to spawn for local phase execution
    pub binary: PathBuf,
    /// Deadline for the agent dial probe
    pub dial_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            local_addrs: HashSet::new(),
            binary: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("anvil")),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Dispatches phase commands locally or to remote agents.
///
/// Clients are pooled per advertise address, lazily created, shared by
/// reference, and closed en masse at shutdown. Reachability probes are
/// cached for the duration of the operation.
pub struct AgentRunner {
    config: RunnerConfig,
    credentials: AgentCredentials,
    dialer: Arc<dyn AgentDialer>,
    clients: Mutex<HashMap<IpAddr, Arc<dyn AgentClient>>>,
    reachable: Mutex<HashMap<IpAddr, bool>>,
}

impl AgentRunner {
    pub fn new(
        config: RunnerConfig,
        credentials: AgentCredentials,
        dialer: Arc<dyn AgentDialer>,
    ) -> Self {
        Self {
            config,
            credentials,
            dialer,
            clients: Mutex::new(HashMap::new()),
            reachable: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether the server's advertise address belongs to this host.
    pub fn is_local(&self, server: &Server) -> bool {
        self.config.local_addrs.contains(&server.advertise_addr)
    }

    /// Cheap reachability probe for the server's agent; the result is
    /// cached per address.
    pub async fn can_execute(&self, cancel: &CancellationToken, server: &Server) -> Result<()> {
        if let Some(&reachable) = self.reachable.lock().await.get(&server.advertise_addr) {
            return if reachable {
                Ok(())
            } else {
                Err(OperationError::not_found(format!(
                    "agent on {server} is not reachable"
                )))
            };
        }

        let result = self.dial(cancel, server.advertise_addr).await;
        if !matches!(result, Err(ref err) if err.is_cancelled()) {
            self.reachable
                .lock()
                .await
                .insert(server.advertise_addr, result.is_ok());
        }
        result.map(|_| ())
    }

    /// Decide where a phase targeting the server can run.
    pub async fn execution_location(
        &self,
        cancel: &CancellationToken,
        server: &Server,
    ) -> Result<ExecutionLocation> {
        if self.is_local(server) {
            return Ok(ExecutionLocation::Local);
        }
        match self.can_execute(cancel, server).await {
            Ok(()) => Ok(ExecutionLocation::Remote),
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                debug!(server = %server, error = %err, "agent probe failed");
                Ok(ExecutionLocation::RemoteRequired)
            }
        }
    }

    /// Execute `anvil <args...>` for the given server, in-process for the
    /// local host or through the node's agent otherwise. Remote stderr is
    /// folded into the returned error.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        server: &Server,
        args: &[String],
    ) -> Result<()> {
        if self.is_local(server) {
            return self.run_local(cancel, args).await;
        }
        let client = self.client(cancel, server.advertise_addr).await?;
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OperationError::Cancelled),
            output = client.command(args) => output?,
        };
        if !output.stderr.trim().is_empty() {
            debug!(server = %server, stderr = %output.stderr.trim(), "agent command stderr");
        }
        Ok(())
    }

    async fn run_local(&self, cancel: &CancellationToken, args: &[String]) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.config.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OperationError::Cancelled),
            output = command.output() => output.map_err(|err| {
                OperationError::transient_with(
                    format!("spawning {}", self.config.binary.display()),
                    err.into(),
                )
            })?,
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(OperationError::Other(anyhow::anyhow!(
            "command {:?} exited with {}: {}",
            args,
            output.status,
            stderr.trim()
        )))
    }

    /// Fetch or create the pooled client for an address.
    pub async fn client(
        &self,
        cancel: &CancellationToken,
        addr: IpAddr,
    ) -> Result<Arc<dyn AgentClient>> {
        if let Some(client) = self.clients.lock().await.get(&addr) {
            return Ok(client.clone());
        }
        let client = self.dial(cancel, addr).await?;
        // A concurrent caller may have won the race; keep the first entry.
        let mut clients = self.clients.lock().await;
        Ok(clients.entry(addr).or_insert(client).clone())
    }

    async fn dial(&self, cancel: &CancellationToken, addr: IpAddr) -> Result<Arc<dyn AgentClient>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OperationError::Cancelled),
            dialed = tokio::time::timeout(
                self.config.dial_timeout,
                self.dialer.dial(addr, &self.credentials),
            ) => match dialed {
                Ok(result) => result,
                Err(_) => Err(OperationError::transient(format!(
                    "agent dial to {addr} timed out after {:?}",
                    self.config.dial_timeout
                ))),
            },
        }
    }

    /// Ask the agents on the given servers to shut down, best effort.
    pub async fn shutdown_agents(&self, cancel: &CancellationToken, servers: &[Server]) {
        for server in servers {
            if self.is_local(server) {
                continue;
            }
            match self.client(cancel, server.advertise_addr).await {
                Ok(client) => {
                    if let Err(err) = client.shutdown().await {
                        warn!(server = %server, error = %err, "agent shutdown failed");
                    }
                }
                Err(err) => {
                    warn!(server = %server, error = %err, "agent unreachable during shutdown");
                }
            }
        }
    }

    /// Close every pooled client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (addr, client) in clients.drain() {
            if let Err(err) = client.close().await {
                warn!(%addr, error = %err, "closing agent client failed");
            }
        }
    }
}

/// A dialer for clusters whose agents cannot be reached at all; every
/// probe reports the agent as unavailable. Used when running strictly
/// locally.
pub struct UnreachableDialer;

#[async_trait]
impl AgentDialer for UnreachableDialer {
    async fn dial(
        &self,
        addr: IpAddr,
        _credentials: &AgentCredentials,
    ) -> Result<Arc<dyn AgentClient>> {
        Err(OperationError::not_found(format!("no agent route to {addr}")))
    }
}
