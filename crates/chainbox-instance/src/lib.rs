use std::fmt;

use chrono::{DateTime, Utc};

/// Public identifier of a sandbox instance.
///
/// Doubles as the store key and as the proxy path segment, so it is always a
/// canonical (lowercase, hyphenated) v4 UUID string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accepts any UUID spelling and normalizes it. Anything else is rejected,
    /// which keeps ids safe to use as file names.
    pub fn parse(raw: &str) -> Option<Self> {
        uuid::Uuid::try_parse(raw.trim())
            .ok()
            .map(|u| Self(u.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted metadata of one running node.
///
/// Immutable once written. The mnemonic is handed to the creator exactly once
/// and is deliberately absent from the `Debug` output.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceRecord {
    pub uuid: InstanceId,
    pub port: u16,
    pub mnemonic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for InstanceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceRecord")
            .field("uuid", &self.uuid)
            .field("port", &self.port)
            .field("mnemonic", &"<redacted>")
            .field("pid", &self.pid)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl InstanceRecord {
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            uuid: self.uuid.clone(),
            port: self.port,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Secret-free view of a record, safe for logs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InstanceInfo {
    pub uuid: InstanceId,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
