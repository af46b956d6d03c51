//! POST side of the proxy: one buffered JSON-RPC request forwarded as one
//! upstream POST.

use std::time::{Duration, Instant};

use jetvision_mcp_proxy_error::{ProxyError, JSON_RPC_VERSION};
use serde::Deserialize;
use serde_json::Value;

use crate::resolver::Upstream;

#[derive(Debug, Deserialize)]
struct Envelope {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    id: Option<Value>,
}

/// A request body that passed JSON-RPC 2.0 validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub id: Option<Value>,
    /// The envelope exactly as parsed, forwarded upstream untouched.
    pub payload: Value,
}

impl RpcRequest {
    /// Parses and validates a raw body.
    ///
    /// Any failure, including a well-formed body that is not an envelope, is
    /// a parse error; the request id is never recovered from a rejected body.
    pub fn parse(body: &[u8]) -> Result<Self, ProxyError> {
        let payload: Value =
            serde_json::from_slice(body).map_err(|err| ProxyError::parse(err.to_string()))?;
        if !payload.is_object() {
            return Err(ProxyError::parse("request body must be a JSON-RPC object"));
        }
        let envelope: Envelope = serde_json::from_value(payload.clone())
            .map_err(|err| ProxyError::parse(err.to_string()))?;
        if envelope.jsonrpc != JSON_RPC_VERSION {
            return Err(ProxyError::parse(format!(
                "unsupported jsonrpc version {:?}",
                envelope.jsonrpc
            )));
        }
        Ok(Self {
            method: envelope.method,
            id: envelope.id,
            payload,
        })
    }
}

/// What the upstream sent back, classified once.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResult {
    /// Valid JSON. `raw` is returned to the caller byte-for-byte.
    Parsed { json: Value, raw: String },
    /// Not JSON; reported to the caller as a JSON-RPC internal error inside
    /// an HTTP 200.
    Unparseable { raw: String },
}

impl UpstreamResult {
    pub fn classify(raw: String) -> Self {
        match serde_json::from_str::<Value>(&raw) {
            Ok(json) => Self::Parsed { json, raw },
            Err(_) => Self::Unparseable { raw },
        }
    }
}

/// POSTs `request` to `upstream` and classifies the reply.
pub async fn forward(
    client: &reqwest::Client,
    upstream: &Upstream,
    request: &RpcRequest,
    timeout: Option<Duration>,
) -> Result<UpstreamResult, ProxyError> {
    let started = Instant::now();
    let id = request
        .id
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();

    let mut builder = client.post(&upstream.url).json(&request.payload);
    if let Some(authority) = upstream.authority() {
        builder = builder.header(reqwest::header::HOST, authority);
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder.send().await.map_err(|err| {
        tracing::error!(
            server_type = %upstream.server_type,
            upstream = %upstream.url,
            method = %request.method,
            id = %id,
            error = %err,
            "forward: upstream request failed"
        );
        ProxyError::upstream_unavailable(err.to_string())
    })?;

    let status = response.status();
    let raw = response.text().await.map_err(|err| {
        tracing::error!(
            upstream = %upstream.url,
            method = %request.method,
            id = %id,
            error = %err,
            "forward: failed reading upstream body"
        );
        ProxyError::upstream_unavailable(err.to_string())
    })?;

    let result = UpstreamResult::classify(raw);
    tracing::info!(
        server_type = %upstream.server_type,
        method = %request.method,
        id = %id,
        upstream_status = status.as_u16(),
        parsed = matches!(result, UpstreamResult::Parsed { .. }),
        total_ms = started.elapsed().as_millis() as u64,
        "forward: upstream replied"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_request_and_notification() {
        let request = RpcRequest::parse(br#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#)
            .expect("request");
        assert_eq!(request.method, "tools/list");
        assert_eq!(request.id, Some(json!(1)));

        let notification =
            RpcRequest::parse(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .expect("notification");
        assert_eq!(notification.id, None);
        assert_eq!(
            notification.payload,
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
        );
    }

    #[test]
    fn rejects_non_envelopes_as_parse_errors() {
        for body in [
            &b"not json"[..],
            br#"{"invalidField":"test"}"#,
            br#"{"jsonrpc":"1.0","method":"x","id":1}"#,
            br#"{"jsonrpc":"2.0","id":1}"#,
            br#"{"jsonrpc":"2.0","method":5,"id":1}"#,
            br#"[{"jsonrpc":"2.0","method":"x","id":1}]"#,
            br#"["2.0","x"]"#,
        ] {
            let err = RpcRequest::parse(body).expect_err("should reject");
            assert!(matches!(err, ProxyError::ParseError { .. }), "{body:?}");
        }
    }

    #[test]
    fn classifies_upstream_bodies() {
        let raw = r#"{"jsonrpc":"2.0","result":{"tools":[]},"id":1}"#.to_string();
        match UpstreamResult::classify(raw.clone()) {
            UpstreamResult::Parsed { json, raw: kept } => {
                assert_eq!(kept, raw);
                assert_eq!(json["id"], 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            UpstreamResult::classify("invalid json response".to_string()),
            UpstreamResult::Unparseable {
                raw: "invalid json response".to_string()
            }
        );
        assert!(matches!(
            UpstreamResult::classify(String::new()),
            UpstreamResult::Unparseable { .. }
        ));
    }
}
