use std::{sync::Arc, time::Duration};

use chainbox_node::InstanceManager;

use crate::gate::AccessGate;

/// Upper bound on one proxied call, including reading the node's answer.
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub manager: InstanceManager,
    pub gate: Arc<AccessGate>,
    pub http: reqwest::Client,
    /// Applied to every forwarded call.
    pub timeout: Duration,
}

impl AppState {
    pub fn new(manager: InstanceManager, gate: AccessGate) -> Self {
        Self::with_proxy_timeout(manager, gate, PROXY_TIMEOUT)
    }

    pub fn with_proxy_timeout(manager: InstanceManager, gate: AccessGate, timeout: Duration) -> Self {
        Self {
            manager,
            gate: Arc::new(gate),
            http: reqwest::Client::new(),
            timeout,
        }
    }
}
