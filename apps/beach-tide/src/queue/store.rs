use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use directories::BaseDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{CommandStatus, QueuedCommand};

const STORE_VERSION: u32 = 1;
pub(crate) const INTERRUPTED: &str = "interrupted before delivery was confirmed";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("queue store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue store format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("unsupported queue store version {0}")]
    Version(u32),
}

/// Persists every session's queue for one server profile.
pub trait QueueStore: Send + Sync {
    fn load(&self, profile: &str) -> Result<Vec<QueuedCommand>, StoreError>;

    fn save(&self, profile: &str, commands: &[QueuedCommand]) -> Result<(), StoreError>;
}

#[derive(Serialize, Deserialize)]
struct StoredQueue {
    version: u32,
    #[serde(default)]
    commands: Vec<QueuedCommand>,
}

/// Commands caught mid-send may or may not have run; surface them as failed
/// so they only go out again on an explicit retry.
fn restore(commands: Vec<QueuedCommand>) -> Vec<QueuedCommand> {
    commands
        .into_iter()
        .filter(|command| command.status != CommandStatus::Sent)
        .map(|mut command| {
            if command.status == CommandStatus::Sending {
                command.status = CommandStatus::Failed;
                command.last_error = Some(INTERRUPTED.to_string());
            }
            command
        })
        .collect()
}

#[derive(Default)]
pub struct MemoryQueueStore {
    profiles: Mutex<HashMap<String, Vec<QueuedCommand>>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self, profile: &str) -> Result<Vec<QueuedCommand>, StoreError> {
        let commands = self
            .profiles
            .lock()
            .get(profile)
            .cloned()
            .unwrap_or_default();
        Ok(restore(commands))
    }

    fn save(&self, profile: &str, commands: &[QueuedCommand]) -> Result<(), StoreError> {
        self.profiles
            .lock()
            .insert(profile.to_string(), commands.to_vec());
        Ok(())
    }
}

/// One JSON file per profile under `~/.beach/tide/queues`.
pub struct FileQueueStore {
    dir: PathBuf,
}

impl FileQueueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_location() -> Result<Self, StoreError> {
        let base = BaseDirs::new().ok_or(StoreError::NoHome)?;
        Ok(Self::new(base.home_dir().join(".beach").join("tide").join("queues")))
    }

    pub fn path_for(&self, profile: &str) -> PathBuf {
        let name: String = profile
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        let name = if name.is_empty() { "default".into() } else { name };
        self.dir.join(format!("{name}.json"))
    }
}

impl QueueStore for FileQueueStore {
    fn load(&self, profile: &str) -> Result<Vec<QueuedCommand>, StoreError> {
        let path = self.path_for(profile);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        let stored: StoredQueue = serde_json::from_str(&raw)?;
        if stored.version != STORE_VERSION {
            return Err(StoreError::Version(stored.version));
        }
        Ok(restore(stored.commands))
    }

    fn save(&self, profile: &str, commands: &[QueuedCommand]) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(profile);
        let tmp = path.with_extension("json.tmp");
        let serialized = serde_json::to_vec_pretty(&StoredQueue {
            version: STORE_VERSION,
            commands: commands.to_vec(),
        })?;

        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(&serialized)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CommandMode;

    fn command(text: &str, status: CommandStatus) -> QueuedCommand {
        let mut command = QueuedCommand::new("s1", text, CommandMode::Shell);
        command.status = status;
        command
    }

    #[test]
    fn file_store_round_trips_and_fails_interrupted_sends() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::new(dir.path());
        store
            .save(
                "work",
                &[
                    command("ls", CommandStatus::Pending),
                    command("rm -rf build", CommandStatus::Sending),
                ],
            )
            .unwrap();

        let loaded = store.load("work").unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].command, "ls");
        assert_eq!(loaded[0].status, CommandStatus::Pending);
        assert_eq!(loaded[1].status, CommandStatus::Failed);
        assert_eq!(loaded[1].last_error.as_deref(), Some(INTERRUPTED));
        assert!(store.load("home").unwrap().is_empty());
    }

    #[test]
    fn profile_names_are_sanitized() {
        let store = FileQueueStore::new("/tmp/q");
        assert_eq!(
            store.path_for("me@relay/../x"),
            PathBuf::from("/tmp/q/me_relay____x.json")
        );
        assert_eq!(store.path_for(""), PathBuf::from("/tmp/q/default.json"));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileQueueStore::new(dir.path());
        fs::write(store.path_for("p"), r#"{"version":9,"commands":[]}"#).unwrap();
        assert!(matches!(store.load("p"), Err(StoreError::Version(9))));
    }
}
