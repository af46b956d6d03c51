use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::catalog::ServerType;
use crate::resolver::Upstream;

/// How a bridged connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Upstream signalled end-of-stream.
    Normal,
    /// Upstream stream failed after streaming began.
    Error,
    /// Client went away before upstream finished.
    Cancelled,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "closed_normal",
            Self::Error => "closed_error",
            Self::Cancelled => "closed_cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub server_type: ServerType,
    pub server_url: String,
}

/// Process-local map of open stream connections, keyed by the session id
/// minted when the connection started streaming.
///
/// Rows only live as long as the [`SessionGuard`] returned by
/// [`SessionRegistry::register`].
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionRecord>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>, upstream: &Upstream) -> SessionGuard {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            SessionRecord {
                server_type: upstream.server_type,
                server_url: upstream.url.clone(),
            },
        );
        tracing::debug!(
            session_id = %session_id,
            server_type = %upstream.server_type,
            open_sessions = self.sessions.len(),
            "session registered"
        );
        SessionGuard {
            registry: Arc::clone(self),
            session_id,
            opened_at: Instant::now(),
            closed: false,
        }
    }

    pub fn lookup(&self, session_id: &str) -> Option<Upstream> {
        self.sessions
            .get(session_id)
            .map(|record| Upstream::new(record.server_url.clone(), record.server_type))
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn remove(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }
}

/// Owns one registry row. Dropping the guard without calling
/// [`SessionGuard::close`] counts as a client cancellation.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
    opened_at: Instant,
    closed: bool,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn close(mut self, reason: CloseReason) {
        self.release(reason);
    }

    fn release(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        let removed = self.registry.remove(&self.session_id);
        tracing::info!(
            session_id = %self.session_id,
            state = reason.as_str(),
            removed = removed,
            open_ms = self.opened_at.elapsed().as_millis() as u64,
            open_sessions = self.registry.len(),
            "session closed"
        );
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release(CloseReason::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream() -> Upstream {
        Upstream::new("https://example.com/mcp", ServerType::Direct)
    }

    #[test]
    fn register_mints_unique_ids() {
        let registry = Arc::new(SessionRegistry::new());
        let first = registry.register(&upstream());
        let second = registry.register(&upstream());
        assert_ne!(first.session_id(), second.session_id());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(first.session_id()), Some(upstream()));
    }

    #[test]
    fn close_removes_row() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.register(&upstream());
        let id = guard.session_id().to_string();
        guard.close(CloseReason::Normal);
        assert!(!registry.contains(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn drop_removes_row() {
        let registry = Arc::new(SessionRegistry::new());
        let guard = registry.register(&upstream());
        let id = guard.session_id().to_string();
        drop(guard);
        assert!(!registry.contains(&id));
        assert!(registry.lookup(&id).is_none());
    }
}
