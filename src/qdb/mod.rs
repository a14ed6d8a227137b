//! Per-domain key-value store (QubesDB)
//!
//! Values read back from a relay were written at relay trust level and are
//! returned as raw bytes. Validation happens in `crate::permission`.

mod command;
mod memory;

pub use command::CommandQubesDb;
pub use memory::MemoryQubesDb;

use async_trait::async_trait;

use crate::error::ChannelError;

/// Access to the key-value store of any domain
#[async_trait]
pub trait KvChannel: Send + Sync {
    /// Raw value at `path` in `domain`, `None` if absent
    async fn read(&self, domain: &str, path: &str) -> Result<Option<Vec<u8>>, ChannelError>;

    async fn write(&self, domain: &str, path: &str, value: &[u8]) -> Result<(), ChannelError>;

    /// Remove `path`; removing an absent key is not an error
    async fn rm(&self, domain: &str, path: &str) -> Result<(), ChannelError>;
}
