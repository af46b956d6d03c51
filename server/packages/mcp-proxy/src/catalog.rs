use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const APOLLO_URL_ENV: &str = "APOLLO_MCP_URL";
pub const AVINODE_URL_ENV: &str = "AVINODE_MCP_URL";
pub const HACKERNEWS_URL_ENV: &str = "HACKERNEWS_MCP_URL";

const DEFAULT_APOLLO_URL: &str = "http://localhost:8123/mcp";
const DEFAULT_AVINODE_URL: &str = "http://localhost:8124/mcp";
const DEFAULT_HACKERNEWS_URL: &str = "http://localhost:8125/mcp";

/// Identity of an upstream MCP server.
///
/// `Direct` marks an upstream addressed by a literal URL rather than by one
/// of the known identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ServerType {
    ApolloIo,
    Avinode,
    Hackernews,
    Direct,
}

impl ServerType {
    pub const KNOWN: [ServerType; 3] = [Self::ApolloIo, Self::Avinode, Self::Hackernews];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApolloIo => "apollo-io",
            Self::Avinode => "avinode",
            Self::Hackernews => "hackernews",
            Self::Direct => "direct",
        }
    }

    /// Parses one of the known identities. `direct` is not an identity a
    /// caller can ask for, so it is rejected here.
    pub fn from_identity(value: &str) -> Option<Self> {
        Self::KNOWN
            .into_iter()
            .find(|known| known.as_str() == value.trim())
    }

    fn url_env(&self) -> Option<&'static str> {
        match self {
            Self::ApolloIo => Some(APOLLO_URL_ENV),
            Self::Avinode => Some(AVINODE_URL_ENV),
            Self::Hackernews => Some(HACKERNEWS_URL_ENV),
            Self::Direct => None,
        }
    }

    fn default_url(&self) -> Option<&'static str> {
        match self {
            Self::ApolloIo => Some(DEFAULT_APOLLO_URL),
            Self::Avinode => Some(DEFAULT_AVINODE_URL),
            Self::Hackernews => Some(DEFAULT_HACKERNEWS_URL),
            Self::Direct => None,
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured URL for every known server identity.
#[derive(Debug, Clone, Default)]
pub struct ServerCatalog {
    urls: HashMap<ServerType, String>,
}

impl ServerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in local endpoints, overridden by `*_MCP_URL` environment
    /// variables when they are set and non-empty.
    pub fn from_env() -> Self {
        let mut catalog = Self::new();
        for server_type in ServerType::KNOWN {
            let from_env = server_type
                .url_env()
                .and_then(|key| std::env::var(key).ok())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty());
            let url = from_env.or_else(|| server_type.default_url().map(str::to_string));
            if let Some(url) = url {
                catalog.urls.insert(server_type, url);
            }
        }
        catalog
    }

    pub fn with_url(mut self, server_type: ServerType, url: impl Into<String>) -> Self {
        self.set_url(server_type, url);
        self
    }

    pub fn set_url(&mut self, server_type: ServerType, url: impl Into<String>) {
        if server_type != ServerType::Direct {
            self.urls.insert(server_type, url.into());
        }
    }

    pub fn url_for(&self, server_type: ServerType) -> Option<&str> {
        self.urls.get(&server_type).map(String::as_str)
    }
}
