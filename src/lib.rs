//! listsync — mailing-list and marketing-provider synchronization core.

pub mod commands;
pub mod config;
pub mod delivery;
pub mod error;
pub mod lists;
pub mod mapping;
pub mod provider;
pub mod reconcile;
pub mod registry;
pub mod webhook;

pub use commands::SyncCommand;
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use registry::AddressRegistry;
