use jetvision_mcp_proxy_error::ProxyError;
use serde::Deserialize;
use url::Url;

use crate::catalog::{ServerCatalog, ServerType};

/// Query-string hints a caller can supply to pick an upstream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResolveParams {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default, rename = "serverType")]
    pub server_type: Option<String>,
    #[serde(default, rename = "sessionId")]
    pub session_id: Option<String>,
}

impl ResolveParams {
    pub fn server(&self) -> Option<&str> {
        non_empty(self.server.as_deref())
    }

    pub fn server_type(&self) -> Option<&str> {
        non_empty(self.server_type.as_deref())
    }

    pub fn session_id(&self) -> Option<&str> {
        non_empty(self.session_id.as_deref())
    }
}

/// A resolved upstream MCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub url: String,
    pub server_type: ServerType,
}

impl Upstream {
    pub fn new(url: impl Into<String>, server_type: ServerType) -> Self {
        Self {
            url: url.into(),
            server_type,
        }
    }

    /// `host[:port]` of the upstream, used to override the `Host` header.
    pub fn authority(&self) -> Option<String> {
        let url = Url::parse(&self.url).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }
}

/// Picks the upstream for a request.
///
/// `binding` is the upstream already bound to `params.session_id`, looked up
/// by the caller; when present it wins over every other hint.
pub fn resolve(
    params: &ResolveParams,
    binding: Option<Upstream>,
    catalog: &ServerCatalog,
) -> Result<Upstream, ProxyError> {
    if let Some(bound) = binding {
        return Ok(bound);
    }

    if let Some(server_type) = params.server_type().and_then(ServerType::from_identity) {
        if let Some(url) = catalog.url_for(server_type) {
            return Ok(Upstream::new(url, server_type));
        }
    }

    if let Some(server) = params.server() {
        if let Some(server_type) = ServerType::from_identity(server) {
            return catalog
                .url_for(server_type)
                .map(|url| Upstream::new(url, server_type))
                .ok_or(ProxyError::ServerNotResolved);
        }
        if is_http_url(server) {
            return Ok(Upstream::new(server, ServerType::Direct));
        }
    }

    Err(ProxyError::ServerNotResolved)
}

fn is_http_url(value: &str) -> bool {
    Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ServerCatalog {
        ServerCatalog::new()
            .with_url(ServerType::ApolloIo, "http://apollo.internal:8123/mcp")
            .with_url(ServerType::Avinode, "https://avinode.internal/mcp")
    }

    fn params(server: Option<&str>, server_type: Option<&str>) -> ResolveParams {
        ResolveParams {
            server: server.map(str::to_string),
            server_type: server_type.map(str::to_string),
            session_id: None,
        }
    }

    #[test]
    fn session_binding_wins_over_server_type() {
        let bound = Upstream::new("https://a.example/mcp", ServerType::Direct);
        let mut hints = params(None, Some("avinode"));
        hints.session_id = Some("abc".to_string());
        let resolved = resolve(&hints, Some(bound.clone()), &catalog()).expect("resolve");
        assert_eq!(resolved, bound);
    }

    #[test]
    fn server_type_maps_through_catalog() {
        let resolved = resolve(&params(None, Some("apollo-io")), None, &catalog()).expect("resolve");
        assert_eq!(resolved.server_type, ServerType::ApolloIo);
        assert_eq!(resolved.url, "http://apollo.internal:8123/mcp");
    }

    #[test]
    fn server_type_takes_precedence_over_server() {
        let resolved = resolve(
            &params(Some("https://other.example/mcp"), Some("avinode")),
            None,
            &catalog(),
        )
        .expect("resolve");
        assert_eq!(resolved.server_type, ServerType::Avinode);
    }

    #[test]
    fn server_naming_an_identity_is_treated_as_server_type() {
        let resolved = resolve(&params(Some("avinode"), None), None, &catalog()).expect("resolve");
        assert_eq!(resolved.server_type, ServerType::Avinode);
        assert_eq!(resolved.url, "https://avinode.internal/mcp");
    }

    #[test]
    fn literal_url_gets_direct_type() {
        let resolved = resolve(&params(Some("https://example.com/mcp"), None), None, &catalog())
            .expect("resolve");
        assert_eq!(resolved, Upstream::new("https://example.com/mcp", ServerType::Direct));
    }

    #[test]
    fn unknown_server_type_falls_through_to_server() {
        let resolved = resolve(
            &params(Some("https://example.com/mcp"), Some("nope")),
            None,
            &catalog(),
        )
        .expect("resolve");
        assert_eq!(resolved.server_type, ServerType::Direct);
    }

    #[test]
    fn nothing_usable_is_not_found() {
        for hints in [
            params(None, None),
            params(Some(""), Some("  ")),
            params(None, Some("nope")),
            params(Some("not a url"), None),
            params(Some("ftp://example.com/mcp"), None),
            params(Some("ws://example.com/mcp"), None),
            params(Some("localhost:8080/mcp"), None),
            params(Some("hackernews"), None),
        ] {
            let err = resolve(&hints, None, &catalog()).expect_err("should not resolve");
            assert!(matches!(err, ProxyError::ServerNotResolved));
        }
    }

    #[test]
    fn authority_keeps_explicit_port() {
        assert_eq!(
            Upstream::new("http://127.0.0.1:4100/mcp", ServerType::Direct).authority(),
            Some("127.0.0.1:4100".to_string())
        );
        assert_eq!(
            Upstream::new("https://example.com/mcp", ServerType::Direct).authority(),
            Some("example.com".to_string())
        );
    }
}
