use std::collections::HashMap;

use parking_lot::RwLock;

use crate::event::{BufferSource, EventBus, SyncEvent};

/// One text buffer per session; the only copy of displayed output.
///
/// Writers take the map lock for the whole mutation, so readers always see a
/// complete buffer. Callers decide *whether* to write (see the stream manager);
/// this type only applies the write and announces it.
#[derive(Debug)]
pub struct OutputBuffers {
    buffers: RwLock<HashMap<String, String>>,
    events: EventBus,
}

impl OutputBuffers {
    pub fn new(events: EventBus) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Replace the buffer wholesale. Returns false if nothing changed.
    pub fn apply_snapshot(&self, session: &str, text: &str) -> bool {
        self.replace(session, text, BufferSource::Snapshot)
    }

    /// Append to the buffer, creating it on first data. Returns the new length.
    pub fn apply_delta(&self, session: &str, text: &str) -> usize {
        let len = {
            let mut buffers = self.buffers.write();
            let buffer = buffers.entry(session.to_string()).or_default();
            buffer.push_str(text);
            buffer.len()
        };
        if !text.is_empty() {
            self.events.emit(SyncEvent::BufferUpdated {
                session: session.to_string(),
                source: BufferSource::Delta,
                len,
            });
        }
        len
    }

    /// Last-write-wins replacement used by polling and manual resync.
    pub fn replace_if_changed(&self, session: &str, text: &str, source: BufferSource) -> bool {
        self.replace(session, text, source)
    }

    pub fn get(&self, session: &str) -> Option<String> {
        self.buffers.read().get(session).cloned()
    }

    pub fn len(&self, session: &str) -> usize {
        self.buffers.read().get(session).map(String::len).unwrap_or(0)
    }

    pub fn contains(&self, session: &str) -> bool {
        self.buffers.read().contains_key(session)
    }

    pub fn remove(&self, session: &str) -> Option<String> {
        self.buffers.write().remove(session)
    }

    fn replace(&self, session: &str, text: &str, source: BufferSource) -> bool {
        {
            let mut buffers = self.buffers.write();
            match buffers.get_mut(session) {
                Some(existing) if existing == text => return false,
                Some(existing) => {
                    existing.clear();
                    existing.push_str(text);
                }
                None => {
                    buffers.insert(session.to_string(), text.to_string());
                }
            }
        }
        self.events.emit(SyncEvent::BufferUpdated {
            session: session.to_string(),
            source,
            len: text.len(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers() -> OutputBuffers {
        OutputBuffers::new(EventBus::default())
    }

    #[test]
    fn snapshot_then_delta_appends() {
        let buffers = buffers();
        buffers.apply_snapshot("s", "X");
        buffers.apply_delta("s", "Y");
        assert_eq!(buffers.get("s").as_deref(), Some("XY"));
    }

    #[test]
    fn second_snapshot_discards_first() {
        let buffers = buffers();
        buffers.apply_snapshot("s", "first");
        buffers.apply_delta("s", " and more");
        buffers.apply_snapshot("s", "second");
        assert_eq!(buffers.get("s").as_deref(), Some("second"));
    }

    #[test]
    fn duplicate_deltas_are_appended_twice() {
        let buffers = buffers();
        buffers.apply_delta("s", "ab");
        buffers.apply_delta("s", "ab");
        assert_eq!(buffers.get("s").as_deref(), Some("abab"));
    }

    #[test]
    fn buffer_created_on_first_data_only() {
        let buffers = buffers();
        assert!(!buffers.contains("s"));
        assert_eq!(buffers.len("s"), 0);
        buffers.apply_delta("s", "");
        assert!(buffers.contains("s"));
    }

    #[test]
    fn replace_if_changed_skips_identical_text() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let buffers = OutputBuffers::new(events);

        assert!(buffers.replace_if_changed("s", "tail", BufferSource::Poll));
        assert!(!buffers.replace_if_changed("s", "tail", BufferSource::Poll));

        assert_eq!(
            rx.try_recv().unwrap(),
            SyncEvent::BufferUpdated {
                session: "s".into(),
                source: BufferSource::Poll,
                len: 4,
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
