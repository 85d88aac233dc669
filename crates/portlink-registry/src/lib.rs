//! Link registry: configured links, their lifecycle, persistence, and
//! periodic status snapshots.

use thiserror::Error;

mod registry;
mod store;

pub use registry::{LinkRegistry, LinkState, LinkStatus};
pub use store::{JsonFileStore, LinkStore, MemoryStore, StoreError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a link bound to {0} already exists")]
    DuplicateBind(String),

    #[error(transparent)]
    Link(#[from] portlink_link::LinkError),
}
