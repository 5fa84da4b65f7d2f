use std::{fmt, net::SocketAddr, path::PathBuf, time::Duration};

use chainbox_node::launcher::{AnvilConfig, DEFAULT_FORK_URL};
use chainbox_node::store::DEFAULT_INSTANCES_DIR;

const DEFAULT_HTTP_PORT: u16 = 8545;
const DEFAULT_TTL_SECS: u64 = 10 * 60;
const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 60;

/// Process configuration, read once from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub fork_url: String,
    pub ttl: Duration,
    pub shared_secret: String,
    pub instances_dir: PathBuf,
    pub anvil_bin: String,
    pub launch_timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen", &self.listen)
            .field("fork_url", &self.fork_url)
            .field("ttl", &self.ttl)
            .field("shared_secret", &"<redacted>")
            .field("instances_dir", &self.instances_dir)
            .field("anvil_bin", &self.anvil_bin)
            .field("launch_timeout", &self.launch_timeout)
            .finish()
    }
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let port = match non_empty(get("HTTP_PORT")) {
            Some(v) => v
                .parse::<u16>()
                .map_err(|_| anyhow::anyhow!("HTTP_PORT must be a port number, got {v:?}"))?,
            None => DEFAULT_HTTP_PORT,
        };

        let ttl_secs = non_empty(get("RPC_KILL_TIMEOUT"))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 24 * 60 * 60))
            .unwrap_or(DEFAULT_TTL_SECS);

        let launch_timeout_secs = non_empty(get("CHAINBOX_LAUNCH_TIMEOUT_SEC"))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(5, 10 * 60))
            .unwrap_or(DEFAULT_LAUNCH_TIMEOUT_SECS);

        let shared_secret = non_empty(get("SHARED_SECRET"))
            .ok_or_else(|| anyhow::anyhow!("SHARED_SECRET is required"))?;

        Ok(Self {
            listen: ([0, 0, 0, 0], port).into(),
            fork_url: non_empty(get("ETH_RPC_URL")).unwrap_or_else(|| DEFAULT_FORK_URL.to_string()),
            ttl: Duration::from_secs(ttl_secs),
            shared_secret,
            instances_dir: non_empty(get("CHAINBOX_INSTANCES_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTANCES_DIR)),
            anvil_bin: non_empty(get("CHAINBOX_ANVIL_BIN")).unwrap_or_else(|| "anvil".to_string()),
            launch_timeout: Duration::from_secs(launch_timeout_secs),
        })
    }

    pub fn anvil(&self) -> AnvilConfig {
        let mut cfg = AnvilConfig::new(self.fork_url.clone());
        cfg.bin = self.anvil_bin.clone();
        cfg.launch_timeout = self.launch_timeout;
        cfg
    }
}
