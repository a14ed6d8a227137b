//! Relay rebinding and relay QubesDB reinitialisation

use tracing::{debug, info, warn};

use super::MicArbiter;
use crate::error::ArbiterError;
use crate::events::MicEvent;
use crate::permission;
use crate::state::MicState;

impl MicArbiter {
    /// Carry `vm`'s permission over when its relay changes from `old` to `new`.
    ///
    /// The old relay's record is untrusted: anything other than absent, `0`
    /// or `1` aborts with an integrity error and nothing is written.
    pub async fn on_relay_changed(
        &self,
        vm: &str,
        new: Option<&str>,
        old: Option<&str>,
    ) -> Result<(), ArbiterError> {
        let Some(new) = new else {
            return Ok(());
        };
        if !self.registry().is_running(vm) {
            return Ok(());
        }
        if !self.registry().is_running(new) {
            warn!(
                guest = vm,
                relay = new,
                "Cannot attach mic to {vm}: AudioVM '{new}' is powered off."
            );
        }
        if Some(new) == old {
            return Ok(());
        }
        let Some(old) = old.filter(|old| self.registry().is_running(old)) else {
            return Ok(());
        };

        let path = permission::config_path(vm);
        let _guard = self.lock_guest(vm).await;

        let untrusted = self.qdb().read(old, &path).await?;
        let Some(value) = permission::decode(vm, old, untrusted.as_deref())? else {
            debug!(guest = vm, from = old, to = new, "no mic permission to migrate");
            return Ok(());
        };

        self.qdb().write(new, &path, value.as_bytes()).await?;
        info!(guest = vm, from = old, to = new, value = %value, "mic permission migrated");
        self.transitions().emit(MicEvent::PermissionMigrated {
            guest: vm.to_string(),
            from: old.to_string(),
            to: new.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    /// `vm`'s QubesDB was created: drop stale entries both for guests that
    /// use `vm` as their relay and for `vm` itself on its own relay
    pub async fn on_qdb_created(&self, vm: &str) -> Result<(), ArbiterError> {
        let as_relay = self.on_relay_db_created(vm).await;
        let as_guest = self.on_guest_db_created(vm).await;
        as_relay.and(as_guest)
    }

    /// Remove every guest's keys from a freshly created relay database.
    ///
    /// All guests are attempted; the first failure is returned.
    pub async fn on_relay_db_created(&self, relay: &str) -> Result<(), ArbiterError> {
        let mut first_error = None;
        for guest in self.registry().guests_of(relay) {
            if let Err(e) = self.clear_guest(relay, &guest).await {
                warn!(guest = %guest, relay, error = %e, "failed to clear stale mic state");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remove `vm`'s keys from its running relay
    pub async fn on_guest_db_created(&self, vm: &str) -> Result<(), ArbiterError> {
        let Some(relay) = self.registry().audiovm(vm) else {
            return Ok(());
        };
        if !self.registry().is_running(&relay) {
            return Ok(());
        }
        self.clear_guest(&relay, vm).await
    }

    async fn clear_guest(&self, relay: &str, guest: &str) -> Result<(), ArbiterError> {
        let _guard = self.lock_guest(guest).await;
        for path in permission::all_paths(guest) {
            self.qdb().rm(relay, &path).await?;
        }
        self.transitions().observe(guest, MicState::Detached);
        debug!(guest, relay, "cleared stale mic state");
        self.transitions().emit(MicEvent::PermissionCleared {
            guest: guest.to_string(),
            relay: relay.to_string(),
        });
        Ok(())
    }
}
