pub mod connection;
pub mod normalize;
pub mod poller;
pub mod reconcile;
pub mod reconnect;

pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, PushEvent, SyncEvent};
pub use normalize::{normalize, CanonicalUpdate};
pub use poller::{FallbackPoller, PollPolicy, PollReason};
pub use reconcile::{ApplyOutcome, ExecutionStore, RunStore};
