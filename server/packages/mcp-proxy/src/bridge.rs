//! GET side of the proxy: one upstream chunked response bridged into one
//! outbound event stream.
//!
//! A connection moves `connecting -> streaming -> closed_*`. The session row
//! is registered before the body stream exists, so it is visible before the
//! client can observe any byte, and it is removed by whichever of end,
//! error or drop happens first.

use std::fmt::Display;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::body::Body;
use axum::http::HeaderMap;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use jetvision_mcp_proxy_error::ProxyError;
use regex::bytes::Regex;

use crate::catalog::ServerType;
use crate::durable::{session_key, DurableStore};
use crate::resolver::Upstream;
use crate::sessions::{CloseReason, SessionGuard, SessionRegistry};

/// Inbound headers that describe the client hop only.
const SKIPPED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
    "content-length",
    "accept-encoding",
];

/// The token runs to the next query separator, whitespace or quote, so
/// percent-encoded and base64 ids are kept whole.
const SESSION_ID_PATTERN: &str = r#"sessionId=([^&\s"']+)"#;

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(SESSION_ID_PATTERN).expect("session id pattern compiles"))
}

/// First `sessionId=<token>` in a chunk, if any.
pub fn extract_session_id(chunk: &[u8]) -> Option<String> {
    session_id_pattern()
        .captures(chunk)
        .and_then(|captures| captures.get(1))
        .map(|token| String::from_utf8_lossy(token.as_bytes()).into_owned())
}

/// A connection that reached the streaming state.
#[derive(Debug)]
pub struct BridgedStream {
    pub session_id: String,
    pub server_type: ServerType,
    pub body: Body,
}

/// Connects to `upstream` and returns the bridged body.
///
/// Transport failures surface as [`ProxyError::UpstreamUnavailable`]; no
/// session row is created in that case.
pub async fn open(
    client: &reqwest::Client,
    sessions: &Arc<SessionRegistry>,
    durable: Option<Arc<dyn DurableStore>>,
    upstream: Upstream,
    inbound: &HeaderMap,
) -> Result<BridgedStream, ProxyError> {
    let started = Instant::now();
    tracing::info!(
        server_type = %upstream.server_type,
        upstream = %upstream.url,
        "bridge: connecting to upstream"
    );

    let response = client
        .get(&upstream.url)
        .headers(upstream_headers(inbound, &upstream))
        .send()
        .await
        .map_err(|err| {
            tracing::error!(
                server_type = %upstream.server_type,
                upstream = %upstream.url,
                error = %err,
                "bridge: upstream connect failed"
            );
            ProxyError::upstream_unavailable(err.to_string())
        })?;

    let status = response.status();
    if !status.is_success() {
        tracing::warn!(
            upstream = %upstream.url,
            status = status.as_u16(),
            "bridge: upstream answered with non-success status, streaming body as-is"
        );
    }

    let guard = sessions.register(&upstream);
    let session_id = guard.session_id().to_string();
    tracing::info!(
        session_id = %session_id,
        server_type = %upstream.server_type,
        connect_ms = started.elapsed().as_millis() as u64,
        "bridge: streaming"
    );

    let server_type = upstream.server_type;
    let stream = bridge_stream(response.bytes_stream(), guard, upstream, durable);
    Ok(BridgedStream {
        session_id,
        server_type,
        body: Body::from_stream(stream),
    })
}

/// Forwards `upstream` chunk by chunk, unchanged and in order, harvesting
/// session ids along the way.
///
/// Dropping the returned stream drops `upstream` (closing the outbound
/// connection) and `guard` (removing the session row).
pub fn bridge_stream<S, E>(
    upstream_body: S,
    guard: SessionGuard,
    upstream: Upstream,
    durable: Option<Arc<dyn DurableStore>>,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let upstream_body = upstream_body;
        futures::pin_mut!(upstream_body);
        let mut chunks: u64 = 0;
        let mut bytes: u64 = 0;

        while let Some(item) = upstream_body.next().await {
            match item {
                Ok(chunk) => {
                    chunks += 1;
                    bytes += chunk.len() as u64;
                    if let Some(store) = durable.as_ref() {
                        harvest(&chunk, store, &upstream, guard.session_id());
                    }
                    yield Ok(chunk);
                }
                Err(err) => {
                    tracing::warn!(
                        session_id = %guard.session_id(),
                        chunks = chunks,
                        bytes = bytes,
                        error = %err,
                        "bridge: upstream stream failed"
                    );
                    let message = err.to_string();
                    guard.close(CloseReason::Error);
                    yield Err(std::io::Error::other(
                        ProxyError::UpstreamStream { message }.to_string(),
                    ));
                    return;
                }
            }
        }

        tracing::debug!(
            session_id = %guard.session_id(),
            chunks = chunks,
            bytes = bytes,
            "bridge: upstream ended"
        );
        guard.close(CloseReason::Normal);
    }
}

fn harvest(chunk: &[u8], store: &Arc<dyn DurableStore>, upstream: &Upstream, session_id: &str) {
    let Some(harvested) = extract_session_id(chunk) else {
        return;
    };
    let store = Arc::clone(store);
    let key = session_key(&harvested);
    let value = upstream.url.clone();
    let connection = session_id.to_string();
    tokio::spawn(async move {
        match store.set(&key, &value).await {
            Ok(()) => tracing::debug!(
                session_id = %connection,
                key = %key,
                "bridge: harvested session persisted"
            ),
            Err(err) => tracing::warn!(
                session_id = %connection,
                key = %key,
                error = %err,
                "bridge: failed to persist harvested session"
            ),
        }
    });
}

fn upstream_headers(inbound: &HeaderMap, upstream: &Upstream) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in inbound {
        if SKIPPED_HEADERS.contains(&name.as_str()) || name.as_str().starts_with("proxy-") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    if let Some(authority) = upstream
        .authority()
        .and_then(|authority| reqwest::header::HeaderValue::from_str(&authority).ok())
    {
        headers.insert(reqwest::header::HOST, authority);
    }
    headers
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::HeaderValue;
    use futures::stream;

    use super::*;
    use crate::durable::MemoryStore;

    fn upstream() -> Upstream {
        Upstream::new("https://example.com/mcp", ServerType::Direct)
    }

    #[test]
    fn extracts_first_session_id() {
        assert_eq!(
            extract_session_id(b"event: endpoint\ndata: /messages?sessionId=test-123\n\n"),
            Some("test-123".to_string())
        );
        assert_eq!(
            extract_session_id(b"sessionId=a1&sessionId=b2"),
            Some("a1".to_string())
        );
        assert_eq!(extract_session_id(b"data: {\"ok\":true}\n\n"), None);
        assert_eq!(extract_session_id(b"sessionId="), None);
    }

    #[test]
    fn session_id_token_runs_to_separator() {
        assert!(Regex::new(SESSION_ID_PATTERN).is_ok());
        assert_eq!(
            extract_session_id(b"data: /messages?sessionId=abc%2Fdef%3D%3D&x=1\n\n"),
            Some("abc%2Fdef%3D%3D".to_string())
        );
        assert_eq!(
            extract_session_id(b"data: /messages?sessionId=YWJj+ZGVm/Zw==\n\n"),
            Some("YWJj+ZGVm/Zw==".to_string())
        );
        assert_eq!(
            extract_session_id(br#"data: {"endpoint":"/m?sessionId=s-1"}"#),
            Some("s-1".to_string())
        );
        assert_eq!(
            extract_session_id(b"sessionId=tok ignored"),
            Some("tok".to_string())
        );
    }

    #[test]
    fn forwarded_headers_drop_hop_headers_and_override_host() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", HeaderValue::from_static("proxy.local:3100"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("accept", HeaderValue::from_static("text/event-stream"));
        inbound.insert("x-request-id", HeaderValue::from_static("abc"));
        let upstream = Upstream::new("http://127.0.0.1:9000/mcp", ServerType::Direct);

        let headers = upstream_headers(&inbound, &upstream);
        assert_eq!(headers.get("host").map(|v| v.as_bytes()), Some(&b"127.0.0.1:9000"[..]));
        assert_eq!(headers.get("accept").map(|v| v.as_bytes()), Some(&b"text/event-stream"[..]));
        assert_eq!(headers.get("x-request-id").map(|v| v.as_bytes()), Some(&b"abc"[..]));
        assert!(headers.get("connection").is_none());
    }

    #[tokio::test]
    async fn normal_end_forwards_bytes_and_releases_session() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.register(&upstream());
        assert_eq!(registry.len(), 1);

        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from_static(b"event: message\n")),
            Ok(Bytes::from_static(b"data: {\"a\":1}\n\n")),
        ];
        let out: Vec<_> = bridge_stream(stream::iter(chunks), guard, upstream(), None)
            .collect()
            .await;

        let bytes: Vec<u8> = out
            .into_iter()
            .flat_map(|item| item.expect("chunk").to_vec())
            .collect();
        assert_eq!(bytes, b"event: message\ndata: {\"a\":1}\n\n");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn upstream_error_ends_stream_and_releases_session() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.register(&upstream());
        let chunks = vec![
            Ok(Bytes::from_static(b"data: first\n\n")),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let out: Vec<_> = bridge_stream(stream::iter(chunks), guard, upstream(), None)
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().expect("first chunk"), &Bytes::from_static(b"data: first\n\n"));
        assert!(out[1].is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_session_and_upstream() {
        struct DropFlag(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.register(&upstream());
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let endless = stream::unfold(flag, |flag| async move {
            Some((Ok::<_, std::io::Error>(Bytes::from_static(b": ping\n\n")), flag))
        });

        let mut bridged = Box::pin(bridge_stream(endless, guard, upstream(), None));
        let first = bridged.next().await.expect("item").expect("chunk");
        assert_eq!(first, Bytes::from_static(b": ping\n\n"));
        assert_eq!(registry.len(), 1);

        drop(bridged);
        assert!(registry.is_empty());
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn harvested_ids_are_written_to_durable_store() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.register(&upstream());
        let store = Arc::new(MemoryStore::new());
        let durable: Arc<dyn DurableStore> = store.clone();
        let chunks = vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"event: endpoint\ndata: /messages?sessionId=test-123\n\n",
        ))];

        let out: Vec<_> = bridge_stream(stream::iter(chunks), guard, upstream(), Some(durable))
            .collect()
            .await;
        assert_eq!(out.len(), 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(value) = store.get("mcp:session:test-123").await.expect("get") {
                assert_eq!(value, "https://example.com/mcp");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "harvested id never persisted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
