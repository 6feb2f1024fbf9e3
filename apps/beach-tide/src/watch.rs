use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRule {
    pub id: Uuid,
    /// `None` watches every session.
    pub session: Option<String>,
    pub pattern: String,
    /// ASCII case folding only.
    pub ignore_case: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchHit {
    pub rule: Uuid,
    pub pattern: String,
    /// Byte offset of the match in the buffer.
    pub offset: usize,
}

/// Substring watches over session buffers. Reads buffer text it is handed;
/// never writes it.
#[derive(Debug, Default)]
pub struct WatchRules {
    inner: Mutex<WatchState>,
}

#[derive(Debug, Default)]
struct WatchState {
    rules: Vec<WatchRule>,
    /// Earliest offset a new match may start at, per rule and session.
    cursors: HashMap<(Uuid, String), usize>,
}

impl WatchRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty patterns are ignored and return `None`.
    pub fn add(&self, session: Option<&str>, pattern: &str, ignore_case: bool) -> Option<Uuid> {
        if pattern.is_empty() {
            return None;
        }
        let rule = WatchRule {
            id: Uuid::new_v4(),
            session: session.map(str::to_string),
            pattern: pattern.to_string(),
            ignore_case,
        };
        let id = rule.id;
        self.inner.lock().rules.push(rule);
        Some(id)
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut state = self.inner.lock();
        let before = state.rules.len();
        state.rules.retain(|rule| rule.id != id);
        state.cursors.retain(|(rule, _), _| *rule != id);
        state.rules.len() != before
    }

    pub fn rules(&self) -> Vec<WatchRule> {
        self.inner.lock().rules.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().rules.is_empty()
    }

    pub fn forget_session(&self, session: &str) {
        self.inner
            .lock()
            .cursors
            .retain(|(_, watched), _| watched != session);
    }

    /// Report occurrences not seen by earlier scans of this session. A buffer
    /// shorter than the last scan is treated as replaced and rescanned.
    pub fn scan(&self, session: &str, text: &str) -> Vec<WatchHit> {
        let mut state = self.inner.lock();
        let WatchState { rules, cursors } = &mut *state;
        let mut hits = Vec::new();
        for rule in rules.iter() {
            if rule.session.as_deref().is_some_and(|watched| watched != session) {
                continue;
            }
            let cursor = cursors.entry((rule.id, session.to_string())).or_insert(0);
            if *cursor > text.len() {
                *cursor = 0;
            }
            let start = floor_char_boundary(text, *cursor);
            let mut next = start;
            for offset in find_all(&text[start..], &rule.pattern, rule.ignore_case) {
                let offset = start + offset;
                hits.push(WatchHit {
                    rule: rule.id,
                    pattern: rule.pattern.clone(),
                    offset,
                });
                next = offset + rule.pattern.len();
            }
            // A match may straddle the end of this scan and the next append.
            let tail = text.len().saturating_sub(rule.pattern.len().saturating_sub(1));
            *cursor = next.max(tail);
        }
        hits
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn find_all(haystack: &str, needle: &str, ignore_case: bool) -> Vec<usize> {
    let (haystack, needle) = if ignore_case {
        (haystack.to_ascii_lowercase(), needle.to_ascii_lowercase())
    } else {
        (haystack.to_string(), needle.to_string())
    };
    let mut found = Vec::new();
    let mut from = 0;
    while let Some(position) = haystack[from..].find(&needle) {
        let offset = from + position;
        found.push(offset);
        from = offset + needle.len();
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_each_occurrence_once() {
        let rules = WatchRules::new();
        let id = rules.add(None, "error", false).unwrap();
        assert_eq!(rules.scan("s", "ok\nerror: a\n").len(), 1);
        assert!(rules.scan("s", "ok\nerror: a\n").is_empty());
        let hits = rules.scan("s", "ok\nerror: a\nerror: b\n");
        assert_eq!(
            hits,
            vec![WatchHit {
                rule: id,
                pattern: "error".into(),
                offset: 12,
            }]
        );
    }

    #[test]
    fn catches_matches_split_across_appends() {
        let rules = WatchRules::new();
        rules.add(None, "DONE", false);
        assert!(rules.scan("s", "build DO").is_empty());
        assert_eq!(rules.scan("s", "build DONE").len(), 1);
    }

    #[test]
    fn scopes_and_case_folding() {
        let rules = WatchRules::new();
        rules.add(Some("a"), "panic", true);
        assert!(rules.scan("b", "PANIC").is_empty());
        assert_eq!(rules.scan("a", "thread PANICKED").len(), 1);
        assert!(rules.add(None, "", false).is_none());
    }

    #[test]
    fn replaced_buffer_is_rescanned() {
        let rules = WatchRules::new();
        rules.add(None, "$ ", false);
        assert_eq!(rules.scan("s", "one $ two $ three").len(), 2);
        assert_eq!(rules.scan("s", "$ ").len(), 1);
    }

    #[test]
    fn handles_multibyte_text() {
        let rules = WatchRules::new();
        rules.add(None, "ok", false);
        assert!(rules.scan("s", "héé").is_empty());
        assert_eq!(rules.scan("s", "héé ok").len(), 1);
    }

    #[test]
    fn removing_a_rule_stops_matches() {
        let rules = WatchRules::new();
        let id = rules.add(None, "x", false).unwrap();
        assert!(rules.remove(id));
        assert!(!rules.remove(id));
        assert!(rules.scan("s", "xxx").is_empty());
        assert!(rules.is_empty());
    }
}
