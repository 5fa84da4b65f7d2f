use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, header},
    response::Response,
};
use serde_json::Value;

/// Read-only or otherwise harmless methods reachable without the shared
/// secret.
pub const ALLOWED_METHODS: &[&str] = &[
    "eth_blockNumber",
    "eth_call",
    "eth_chainId",
    "eth_estimateGas",
    "eth_feeHistory",
    "eth_gasPrice",
    "eth_getBalance",
    "eth_getBlockByHash",
    "eth_getBlockByNumber",
    "eth_getCode",
    "eth_getStorageAt",
    "eth_getTransactionByHash",
    "eth_getTransactionCount",
    "eth_getTransactionReceipt",
    "eth_sendRawTransaction",
    "net_version",
    "rpc_modules",
    "web3_clientVersion",
];

pub const INVALID_CONTENT_TYPE: &str = "invalid content type, only application/json is supported";

pub fn is_allowed(method: &str) -> bool {
    ALLOWED_METHODS.contains(&method)
}

pub fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

/// What the proxy makes of a parsed request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// No `id`: the caller expects no reply.
    Notification,
    /// Has an `id` but no string `method`.
    Invalid { id: Value },
    Call { id: Value, method: String },
}

pub fn classify(body: &Value) -> Envelope {
    let Some(obj) = body.as_object() else {
        return Envelope::Notification;
    };
    let Some(id) = obj.get("id") else {
        return Envelope::Notification;
    };
    match obj.get("method").and_then(Value::as_str) {
        Some(method) => Envelope::Call {
            id: id.clone(),
            method: method.to_string(),
        },
        None => Envelope::Invalid { id: id.clone() },
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    // Length and framing are recomputed for the relayed body.
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// Posts the body bytes as received to the node and relays its answer.
///
/// `timeout` bounds the whole exchange, including reading the body.
pub async fn forward(
    client: &reqwest::Client,
    port: u16,
    body: Bytes,
    timeout: Duration,
) -> Result<Response, reqwest::Error> {
    let upstream = client
        .post(format!("http://127.0.0.1:{port}"))
        .header(header::CONTENT_TYPE, "application/json")
        .timeout(timeout)
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let bytes = upstream.bytes().await?;

    let mut resp = Response::new(Body::from(bytes));
    *resp.status_mut() = status;
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            resp.headers_mut().append(name.clone(), value.clone());
        }
    }
    Ok(resp)
}
