use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::CommandMode;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub command: String,
    pub mode: CommandMode,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
}

/// Sent commands per session, newest last, oldest evicted past `limit`.
#[derive(Debug)]
pub struct CommandHistory {
    limit: usize,
    sessions: HashMap<String, VecDeque<HistoryEntry>>,
}

impl CommandHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            sessions: HashMap::new(),
        }
    }

    pub fn push(&mut self, session: &str, entry: HistoryEntry) {
        let entries = self.sessions.entry(session.to_string()).or_default();
        entries.push_back(entry);
        while entries.len() > self.limit {
            entries.pop_front();
        }
    }

    pub fn entries(&self, session: &str) -> Vec<HistoryEntry> {
        self.sessions
            .get(session)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, session: &str, id: Uuid) -> bool {
        self.sessions
            .get(session)
            .is_some_and(|entries| entries.iter().any(|entry| entry.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(command: &str) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4(),
            command: command.into(),
            mode: CommandMode::Shell,
            sent_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn keeps_newest_entries_within_limit() {
        let mut history = CommandHistory::new(2);
        history.push("s", entry("a"));
        history.push("s", entry("b"));
        history.push("s", entry("c"));
        let commands: Vec<_> = history
            .entries("s")
            .into_iter()
            .map(|entry| entry.command)
            .collect();
        assert_eq!(commands, ["b", "c"]);
        assert!(history.entries("other").is_empty());

        let evicted = history.entries("s")[0].id;
        history.push("s", entry("d"));
        assert!(!history.contains("s", evicted));
        assert!(history.contains("s", history.entries("s")[1].id));
    }
}
