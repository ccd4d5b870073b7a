pub mod error;
pub mod types;
pub mod config;
pub mod retry;
pub mod journal; // checksummed append-only record log
pub mod state;
pub mod reminder;
pub mod dispatcher;
pub mod scheduler;
pub mod entity;
pub mod directory;
pub mod background; // idle collection
pub mod runtime;

pub use config::{RuntimeConfig, Storage};
pub use directory::{Directory, DirectoryStats};
pub use entity::{Entity, EntityContext};
pub use error::{Error, Result};
pub use retry::RetryPolicy;
pub use runtime::Runtime;
pub use types::*;
