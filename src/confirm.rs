//! Confirmation for ask-to-attach assignments

use async_trait::async_trait;
use tracing::info;

use crate::device::MicDevice;

/// Asks which guest should receive a device
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Name of the guest the user picked, `None` if declined
    async fn confirm(&self, guest: &str, device: &MicDevice) -> Option<String>;
}

/// Answers without prompting
#[derive(Debug, Clone, Copy)]
pub struct StaticConfirmer {
    approve: bool,
}

impl StaticConfirmer {
    pub fn new(approve: bool) -> Self {
        Self { approve }
    }
}

#[async_trait]
impl Confirmer for StaticConfirmer {
    async fn confirm(&self, guest: &str, device: &MicDevice) -> Option<String> {
        if self.approve {
            Some(guest.to_string())
        } else {
            info!(guest, device = %device, "no prompt available, declining ask-to-attach");
            None
        }
    }
}
