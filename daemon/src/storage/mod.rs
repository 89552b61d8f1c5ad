//! Pluggable persistence for fingerprint templates.

mod file;

pub use file::FileStore;

use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::config::Config;
use crate::finger::Finger;
use crate::print::Print;

#[derive(Debug)]
pub enum StoreError {
    /// No template persisted for the requested slot.
    NotFound,
    /// The file exists but its contents do not belong where they were
    /// found (wrong user, wrong finger, wrong reader) or cannot be parsed.
    Corrupt(String),
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "print not found"),
            StoreError::Corrupt(msg) => write!(f, "stored print rejected: {msg}"),
            StoreError::Io(err) => write!(f, "storage I/O error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> StoreError {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Io(err)
        }
    }
}

/// Template persistence backend.
///
/// One implementation per storage technology; the daemon owns a single
/// instance shared by the manager and every device. Operations are
/// synchronous: backends are expected to be local and fast.
pub trait PrintStore: Send + Sync {
    fn save(&self, print: &Print) -> Result<(), StoreError>;

    fn load(&self, driver: &str, device_id: &str, finger: Finger, username: &str)
        -> Result<Print, StoreError>;

    fn delete(&self, driver: &str, device_id: &str, finger: Finger, username: &str)
        -> Result<(), StoreError>;

    /// Finger slots with a template for this reader and user.
    fn discover_prints(&self, driver: &str, device_id: &str, username: &str) -> Vec<Finger>;

    /// Every user with at least one template directory, filesystem order.
    fn discover_users(&self) -> Vec<String>;
}

/// Build the backend named by the configuration.
///
/// There is no dynamic module loading here: anything other than `file`
/// falls back to the built-in file backend with a warning.
pub fn from_config(config: &Config) -> Arc<dyn PrintStore> {
    if config.storage.backend != "file" {
        warn!(
            "Unknown storage type '{}', using the file backend",
            config.storage.backend
        );
    }
    Arc::new(FileStore::from_env())
}
