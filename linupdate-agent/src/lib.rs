//! linupdate agent library - capability agents run under the linupdate service
//!
//! The reposerver agent keeps a persistent control connection to a fleet
//! management server and:
//! - Authenticates with the host id/token pair
//! - Executes remote requests (status collection, package updates)
//! - Records every request outcome in an on-disk ledger before sending it
//! - Flushes unacknowledged outcomes after reconnecting
//! - Watches the package manager log for out-of-band package changes

pub mod agent;
pub mod channel;
pub mod command;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod ledger;
pub mod package;
pub mod protocol;
pub mod reporter;
pub mod status;
pub mod system;
pub mod task;
pub mod watcher;

pub use agent::{AgentExit, ReposerverAgent};
pub use config::{ConfigSource, RuntimePaths, Timings};
pub use control::ControlAgent;
pub use coordinator::RestartCoordinator;
pub use ledger::{RequestLedger, RequestRecord, RequestStatus};
