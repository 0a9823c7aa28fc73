pub mod artifact;
pub mod crypto;
pub mod error;
pub mod fsutil;
pub mod journal;
pub mod paths;
pub mod registry;
pub mod secure_storage;
pub mod settings;
pub mod version;
pub mod version_store;

pub use error::{FailureKind, Result, SyncError};
