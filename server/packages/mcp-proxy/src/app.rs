use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::rejection::{BytesRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use jetvision_mcp_proxy_error::{ErrorBody, JsonRpcError, JsonRpcErrorResponse, ProxyError};
use serde::Serialize;
use serde_json::Value;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::bridge;
use crate::catalog::{ServerCatalog, ServerType};
use crate::durable::{session_key, DurableStore};
use crate::forwarder::{self, RpcRequest, UpstreamResult};
use crate::resolver::{resolve, ResolveParams, Upstream};
use crate::sessions::SessionRegistry;

pub const PROXY_ROUTE: &str = "/api/mcp/proxy";
pub const MCP_SERVER_HEADER: &str = "x-mcp-server";
pub const MCP_SESSION_HEADER: &str = "x-mcp-session-id";
pub const LOG_HTTP_ENV: &str = "JETVISION_MCP_LOG_HTTP";
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Applied router-wide so extractor rejections and fallbacks carry them too.
const CORS_HEADERS: [(HeaderName, &str); 3] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
];

const EVENT_STREAM_HEADERS: [(HeaderName, &str); 3] = [
    (header::CONTENT_TYPE, "text/event-stream"),
    (header::CACHE_CONTROL, "no-cache, no-transform"),
    (header::CONNECTION, "keep-alive"),
];

/// Shared services handed to every handler.
#[derive(Debug)]
pub struct ProxyState {
    catalog: ServerCatalog,
    sessions: Arc<SessionRegistry>,
    durable: Option<Arc<dyn DurableStore>>,
    client: reqwest::Client,
    rpc_timeout: Option<Duration>,
    max_body_bytes: usize,
}

impl ProxyState {
    pub fn new(catalog: ServerCatalog) -> Self {
        Self {
            catalog,
            sessions: Arc::new(SessionRegistry::new()),
            durable: None,
            client: reqwest::Client::new(),
            rpc_timeout: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn catalog(&self) -> &ServerCatalog {
        &self.catalog
    }

    /// Upstream bound to `session_id`: a live local stream first, then a
    /// harvested id in the durable store. Store failures count as a miss.
    async fn session_binding(&self, session_id: &str) -> Option<Upstream> {
        if let Some(bound) = self.sessions.lookup(session_id) {
            return Some(bound);
        }
        let store = self.durable.as_ref()?;
        match store.get(&session_key(session_id)).await {
            Ok(Some(url)) => Some(Upstream::new(url, ServerType::Direct)),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %err,
                    "durable session lookup failed"
                );
                None
            }
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    ok: bool,
    sessions: usize,
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, get_proxy, post_proxy, options_proxy),
    components(schemas(HealthResponse, ErrorBody, JsonRpcError, JsonRpcErrorResponse)),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "mcp", description = "MCP upstream proxy")
    )
)]
pub struct ApiDoc;

pub fn build_router(state: Arc<ProxyState>) -> Router {
    let max_body_bytes = state.max_body_bytes;
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route(
            PROXY_ROUTE,
            get(get_proxy).post(post_proxy).options(options_proxy),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state);

    let http_logging = match std::env::var(LOG_HTTP_ENV) {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        router = router.layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<Body>| {
                    tracing::info_span!(
                        "http.request",
                        method = %req.method(),
                        uri = %req.uri()
                    )
                })
                .on_request(|_req: &Request<Body>, span: &Span| {
                    tracing::debug!(parent: span, "request");
                })
                .on_response(|res: &Response, latency: Duration, span: &Span| {
                    tracing::info!(
                        parent: span,
                        status = res.status().as_u16(),
                        latency_ms = latency.as_millis() as u64,
                        "response"
                    );
                }),
        );
    }

    for (name, value) in CORS_HEADERS {
        router = router.layer(SetResponseHeaderLayer::overriding(
            name,
            HeaderValue::from_static(value),
        ));
    }
    router
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<ProxyState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        sessions: state.sessions.len(),
    })
}

#[utoipa::path(
    get,
    path = "/api/mcp/proxy",
    params(
        ("server" = Option<String>, Query, description = "Known server type or literal upstream URL"),
        ("serverType" = Option<String>, Query, description = "Known server type")
    ),
    responses(
        (status = 200, description = "Upstream event stream", body = String, content_type = "text/event-stream"),
        (status = 404, body = ErrorBody),
        (status = 500, body = ErrorBody)
    ),
    tag = "mcp"
)]
async fn get_proxy(
    State(state): State<Arc<ProxyState>>,
    query: Result<Query<ResolveParams>, QueryRejection>,
    headers: HeaderMap,
) -> Response {
    let params = query_params(query);
    let upstream = match resolve(&params, None, &state.catalog) {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::info!(
                server = ?params.server(),
                server_type = ?params.server_type(),
                "stream: no upstream resolved"
            );
            return stream_error(err);
        }
    };

    match bridge::open(
        &state.client,
        &state.sessions,
        state.durable.clone(),
        upstream,
        &headers,
    )
    .await
    {
        Ok(bridged) => {
            let mut response =
                (StatusCode::OK, EVENT_STREAM_HEADERS, bridged.body).into_response();
            let response_headers = response.headers_mut();
            response_headers.insert(
                HeaderName::from_static(MCP_SERVER_HEADER),
                HeaderValue::from_static(bridged.server_type.as_str()),
            );
            if let Ok(value) = HeaderValue::from_str(&bridged.session_id) {
                response_headers.insert(HeaderName::from_static(MCP_SESSION_HEADER), value);
            }
            response
        }
        Err(err) => stream_error(err),
    }
}

#[utoipa::path(
    post,
    path = "/api/mcp/proxy",
    params(
        ("server" = Option<String>, Query, description = "Known server type or literal upstream URL"),
        ("serverType" = Option<String>, Query, description = "Known server type"),
        ("sessionId" = Option<String>, Query, description = "Session bound to an upstream")
    ),
    request_body(content = String, description = "JSON-RPC 2.0 request", content_type = "application/json"),
    responses(
        (status = 200, description = "Upstream JSON-RPC response, or a JSON-RPC internal error when the upstream reply is not JSON"),
        (status = 400, body = JsonRpcErrorResponse),
        (status = 500, body = JsonRpcErrorResponse)
    ),
    tag = "mcp"
)]
async fn post_proxy(
    State(state): State<Arc<ProxyState>>,
    query: Result<Query<ResolveParams>, QueryRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let params = query_params(query);
    let binding = match params.session_id() {
        Some(session_id) => state.session_binding(session_id).await,
        None => None,
    };
    let upstream = match resolve(&params, binding, &state.catalog) {
        Ok(upstream) => upstream,
        Err(err) => return rpc_error(&err, None),
    };

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::info!(
                status = rejection.status().as_u16(),
                limit = state.max_body_bytes,
                error = %rejection,
                "forward: request body not readable"
            );
            return rpc_error(&ProxyError::parse(rejection.body_text()), None);
        }
    };

    let request = match RpcRequest::parse(&body) {
        Ok(request) => request,
        Err(err) => {
            if let ProxyError::ParseError { reason } = &err {
                tracing::info!(reason = %reason, bytes = body.len(), "forward: rejected request body");
            }
            return rpc_error(&err, None);
        }
    };

    match forwarder::forward(&state.client, &upstream, &request, state.rpc_timeout).await {
        Ok(UpstreamResult::Parsed { raw, .. }) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            raw,
        )
            .into_response(),
        Ok(UpstreamResult::Unparseable { raw }) => {
            tracing::warn!(
                upstream = %upstream.url,
                method = %request.method,
                bytes = raw.len(),
                "forward: upstream reply is not JSON"
            );
            let err = ProxyError::InvalidUpstreamResponse {
                body_bytes: raw.len(),
            };
            rpc_error(&err, request.id)
        }
        Err(err) => rpc_error(&err, request.id),
    }
}

#[utoipa::path(
    options,
    path = "/api/mcp/proxy",
    responses((status = 204, description = "CORS preflight")),
    tag = "mcp"
)]
async fn options_proxy() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

fn query_params(query: Result<Query<ResolveParams>, QueryRejection>) -> ResolveParams {
    match query {
        Ok(Query(params)) => params,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "ignoring malformed query string");
            ResolveParams::default()
        }
    }
}

fn stream_error(err: ProxyError) -> Response {
    let status = StatusCode::from_u16(err.error_type().stream_status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_error_body())).into_response()
}

fn rpc_error(err: &ProxyError, id: Option<Value>) -> Response {
    let status = StatusCode::from_u16(err.error_type().rpc_status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_json_rpc(id))).into_response()
}
