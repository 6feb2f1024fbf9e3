pub mod buffer;
pub mod config;
pub mod engine;
pub mod event;
pub mod health;
pub mod metrics;
pub mod poll;
pub mod queue;
pub mod registry;
pub mod stream;
pub mod telemetry;
pub mod transport;
pub mod watch;

pub use config::{ConfigError, SyncConfig};
pub use engine::{EngineError, SendOutcome, SyncEngine};
pub use event::{BufferSource, EventBus, SyncEvent};
pub use queue::{CommandMode, CommandStatus, QueuedCommand};
pub use stream::{ConnectionState, RetryPolicy, StreamStatus};
