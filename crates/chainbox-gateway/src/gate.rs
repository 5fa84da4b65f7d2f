use axum::http::{HeaderMap, header::AUTHORIZATION};
use subtle::ConstantTimeEq;

/// Shared-secret check guarding `/new`, `/kill` and non-allow-listed RPC
/// methods.
///
/// The comparison is constant time in the content of the presented
/// credential; only its length can influence timing.
#[derive(Clone)]
pub struct AccessGate {
    expected: Option<Vec<u8>>,
}

impl AccessGate {
    pub fn new(secret: impl AsRef<str>) -> Self {
        let secret = secret.as_ref();
        let expected = if secret.is_empty() {
            None
        } else {
            Some(format!("Bearer {secret}").into_bytes())
        };
        Self { expected }
    }

    /// Checks the `Authorization: Bearer <secret>` header.
    pub fn check(&self, headers: &HeaderMap) -> bool {
        match headers.get(AUTHORIZATION) {
            Some(v) => self.check_value(v.as_bytes()),
            None => false,
        }
    }

    pub fn check_value(&self, presented: &[u8]) -> bool {
        match &self.expected {
            Some(expected) => bool::from(presented.ct_eq(expected.as_slice())),
            None => false,
        }
    }
}

impl std::fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGate")
            .field("enabled", &self.expected.is_some())
            .finish()
    }
}
