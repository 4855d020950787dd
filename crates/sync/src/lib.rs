#![forbid(unsafe_code)]

//! Offline-first sync: pushes the local outbox to the task server, pulls remote changes and
//! reconciles the two.

pub mod auth;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
mod lease;
pub mod monitor;
pub mod remote;
pub mod runner;

pub use auth::{AuthError, AuthProvider, Credential, StaticAuth};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RemoteConfig, SyncConfig};
pub use conflict::{ConflictResolver, Decision, ResolutionKind};
pub use engine::{CycleReport, MutationFailure, PullFailure, SyncEngine, SyncState};
pub use error::{ConfigError, FailureKind, SyncError};
pub use monitor::{ConnectivityMonitor, Reachability};
pub use remote::{
    ChangeBatch, FailureClass, HttpRemote, MemoryRemote, PushLogEntry, PushRequest, RemoteClient,
    RemoteError,
};
pub use runner::SyncRunner;
