pub mod catalog;
pub mod engine;
pub mod launch;
pub mod retry;
pub mod state;

pub use catalog::{HttpCatalog, RemoteCatalog, RemoteManifest};
pub use engine::{UpdateEngine, UpdateEvent, UpdateOutcome, UpdateState};
pub use launch::{LaunchSession, ProcessHandle};
pub use state::LocalState;
