use std::time::Duration;

use chainbox_instance::InstanceId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};

use crate::node_handle::{ChildNode, NodeHandle};
use crate::port_alloc::{self, PortReservations};

pub const DEFAULT_FORK_URL: &str = "https://eth-pokt.nodies.app";

/// Chain id of every sandbox; not used by any public network.
pub const SANDBOX_CHAIN_ID: u64 = 1337;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no free port after {0} attempts")]
    PortExhausted(usize),
    #[error("seed generation failed: {0}")]
    Seed(String),
    #[error("spawn {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("node exited before answering RPC ({0})")]
    Exited(String),
    #[error("node did not answer RPC within {0:?}")]
    Timeout(Duration),
}

/// A freshly started node that answered its first RPC call.
pub struct LaunchedNode {
    pub id: InstanceId,
    pub mnemonic: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub handle: Box<dyn NodeHandle>,
}

impl std::fmt::Debug for LaunchedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedNode")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
pub trait NodeLauncher: Send + Sync + 'static {
    async fn launch(&self) -> Result<LaunchedNode, LaunchError>;
}

/// 12-word English BIP-39 phrase from 128 bits of OS entropy.
pub fn generate_mnemonic() -> Result<String, LaunchError> {
    use rand::RngCore;

    let mut entropy = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    bip39::Mnemonic::from_entropy_in(bip39::Language::English, &entropy)
        .map(|m| m.to_string())
        .map_err(|e| LaunchError::Seed(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct AnvilConfig {
    pub bin: String,
    pub fork_url: String,
    pub chain_id: u64,
    /// First account deploys the challenge, second belongs to the player.
    pub accounts: u32,
    pub balance_ether: u64,
    pub block_time: Duration,
    pub launch_timeout: Duration,
    pub poll_interval: Duration,
    pub term_grace: Duration,
}

impl AnvilConfig {
    pub fn new(fork_url: impl Into<String>) -> Self {
        Self {
            bin: "anvil".to_string(),
            fork_url: fork_url.into(),
            chain_id: SANDBOX_CHAIN_ID,
            accounts: 2,
            balance_ether: 5000,
            block_time: Duration::from_secs(10),
            launch_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            term_grace: Duration::from_secs(5),
        }
    }

    pub fn args(&self, mnemonic: &str, port: u16) -> Vec<String> {
        vec![
            "--accounts".to_string(),
            self.accounts.to_string(),
            "--balance".to_string(),
            self.balance_ether.to_string(),
            "--mnemonic".to_string(),
            mnemonic.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--fork-url".to_string(),
            self.fork_url.clone(),
            "--chain-id".to_string(),
            self.chain_id.to_string(),
            "--no-rate-limit".to_string(),
            "--block-base-fee-per-gas".to_string(),
            "0".to_string(),
            "--gas-price".to_string(),
            "0".to_string(),
            "--block-time".to_string(),
            self.block_time.as_secs().max(1).to_string(),
        ]
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the gateway dies, take the node with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// True once the endpoint answers a JSON-RPC call with a 2xx status.
pub async fn rpc_is_ready(client: &reqwest::Client, url: &str) -> bool {
    let probe = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "web3_clientVersion",
        "params": [],
    });
    match client
        .post(url)
        .json(&probe)
        .timeout(Duration::from_secs(2))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Starts `anvil` forks on reserved local ports.
#[derive(Debug, Clone)]
pub struct AnvilLauncher {
    cfg: AnvilConfig,
    ports: PortReservations,
    http: reqwest::Client,
}

impl AnvilLauncher {
    pub fn new(cfg: AnvilConfig) -> Self {
        Self {
            cfg,
            ports: PortReservations::default(),
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &AnvilConfig {
        &self.cfg
    }

    async fn wait_until_ready(&self, node: &mut ChildNode, port: u16) -> Result<(), LaunchError> {
        let url = format!("http://127.0.0.1:{port}");
        let deadline = tokio::time::Instant::now() + self.cfg.launch_timeout;
        loop {
            if let Some(status) = node.exit_status() {
                return Err(LaunchError::Exited(status));
            }
            if rpc_is_ready(&self.http, &url).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LaunchError::Timeout(self.cfg.launch_timeout));
            }
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }
}

#[async_trait::async_trait]
impl NodeLauncher for AnvilLauncher {
    async fn launch(&self) -> Result<LaunchedNode, LaunchError> {
        let id = InstanceId::new();
        let mnemonic = generate_mnemonic()?;
        let lease = self
            .ports
            .reserve(port_alloc::NODE_PORT_RANGE)
            .ok_or(LaunchError::PortExhausted(port_alloc::MAX_ATTEMPTS))?;
        let port = lease.port();

        let mut cmd = Command::new(&self.cfg.bin);
        cmd.args(self.cfg.args(&mnemonic, port))
            .stdin(std::process::Stdio::null())
            // stdout echoes the mnemonic and derived keys; never capture it.
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            bin: self.cfg.bin.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::debug!(uuid = %id, port, ?pid, "node spawned, waiting for RPC");

        if let Some(err) = child.stderr.take() {
            let id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(uuid = %id, "[anvil] {line}");
                }
            });
        }

        // From here on, dropping `node` on an error path terminates the child.
        let mut node = ChildNode::new(child, Some(lease), self.cfg.term_grace);
        self.wait_until_ready(&mut node, port).await?;

        Ok(LaunchedNode {
            id,
            mnemonic,
            port,
            pid,
            handle: Box::new(node),
        })
    }
}
