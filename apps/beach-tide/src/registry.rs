use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::transport::SessionSummary;

/// Sessions the user has open versus sessions the server knows about.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    open: BTreeSet<String>,
    known: HashMap<String, SessionSummary>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the session was not already open.
    pub fn open(&self, session: &str) -> bool {
        self.inner.write().open.insert(session.to_string())
    }

    /// Returns true when the session was open.
    pub fn hide(&self, session: &str) -> bool {
        self.inner.write().open.remove(session)
    }

    /// Replace the open set wholesale.
    pub fn set_open<I, S>(&self, sessions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.write().open = sessions.into_iter().map(Into::into).collect();
    }

    pub fn is_open(&self, session: &str) -> bool {
        self.inner.read().open.contains(session)
    }

    pub fn open_sessions(&self) -> Vec<String> {
        self.inner.read().open.iter().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.inner.read().open.len()
    }

    pub fn set_known(&self, sessions: Vec<SessionSummary>) {
        self.inner.write().known = sessions
            .into_iter()
            .map(|summary| (summary.id.clone(), summary))
            .collect();
    }

    pub fn is_known(&self, session: &str) -> bool {
        self.inner.read().known.contains_key(session)
    }

    /// Known sessions sorted by id.
    pub fn known_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self.inner.read().known.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Drop every trace of a session the server has closed.
    pub fn forget(&self, session: &str) {
        let mut inner = self.inner.write();
        inner.open.remove(session);
        inner.known.remove(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str) -> SessionSummary {
        SessionSummary {
            id: id.into(),
            created_at: Some(1_700_000_000),
        }
    }

    #[test]
    fn open_and_hide_are_idempotent() {
        let registry = SessionRegistry::new();
        assert!(registry.open("a"));
        assert!(!registry.open("a"));
        assert!(registry.is_open("a"));
        assert!(registry.hide("a"));
        assert!(!registry.hide("a"));
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn open_and_known_sets_are_independent() {
        let registry = SessionRegistry::new();
        registry.set_known(vec![summary("b"), summary("a")]);
        registry.open("a");
        assert!(registry.is_known("b"));
        assert!(!registry.is_open("b"));
        assert_eq!(
            registry
                .known_sessions()
                .into_iter()
                .map(|s| s.id)
                .collect::<Vec<_>>(),
            ["a", "b"]
        );

        registry.forget("a");
        assert!(!registry.is_open("a"));
        assert!(!registry.is_known("a"));
        assert!(registry.is_known("b"));
    }

    #[test]
    fn set_open_replaces_everything() {
        let registry = SessionRegistry::new();
        registry.open("old");
        registry.set_open(["x", "y"]);
        assert_eq!(registry.open_sessions(), ["x", "y"]);
        assert_eq!(registry.open_count(), 2);
    }
}
