//! Attach and detach
//!
//! Preconditions are checked synchronously and in a fixed order. After them
//! exactly one side effect happens: a service call to the relay's audio
//! agent when the relay advertises it, otherwise a single QubesDB write.

use tracing::{debug, info};

use super::MicArbiter;
use crate::device::{DeviceAssignment, DeviceOptions, MicDevice};
use crate::error::ArbiterError;
use crate::events::TransitionPath;
use crate::permission::{self, Permission};
use crate::rpc::{self, AudioInputCall};
use crate::state::Direction;

impl MicArbiter {
    /// Give `vm` access to the microphone
    pub async fn attach(
        &self,
        vm: &str,
        device: &MicDevice,
        options: &DeviceOptions,
    ) -> Result<(), ArbiterError> {
        if *device != self.device() {
            return Err(ArbiterError::Contract(format!(
                "{device} is not the system microphone"
            )));
        }
        if !options.is_empty() {
            return Err(ArbiterError::Usage(
                "mic device does not support options".to_string(),
            ));
        }
        let relay = self.running_relay(vm)?;

        self.transition(vm, &relay, Direction::Attach).await
    }

    /// Take microphone access away from `vm`
    pub async fn detach(&self, vm: &str, port: &str) -> Result<(), ArbiterError> {
        debug!(guest = vm, port, "detach requested");
        let relay = self.running_relay(vm)?;

        self.transition(vm, &relay, Direction::Detach).await
    }

    /// Reject assignments the microphone cannot honour
    pub fn validate_assignment(&self, assignment: &DeviceAssignment) -> Result<(), ArbiterError> {
        if !assignment.options.is_empty() {
            return Err(ArbiterError::Usage(
                "mic device does not support options".to_string(),
            ));
        }
        Ok(())
    }

    /// Relay of `vm`, which must be set and running
    fn running_relay(&self, vm: &str) -> Result<String, ArbiterError> {
        let Some(relay) = self.registry().audiovm(vm) else {
            return Err(ArbiterError::Configuration(format!(
                "VM {vm} has no AudioVM set"
            )));
        };
        if !self.registry().is_running(&relay) {
            return Err(ArbiterError::NotRunning {
                message: format!("Audio VM {relay} isn't running"),
                domain: relay,
            });
        }
        Ok(relay)
    }

    async fn transition(
        &self,
        vm: &str,
        relay: &str,
        direction: Direction,
    ) -> Result<(), ArbiterError> {
        let call = match direction {
            Direction::Attach => AudioInputCall::Enable,
            Direction::Detach => AudioInputCall::Disable,
        };
        let path = if rpc::supports(self.registry(), relay, self.namespace(), call) {
            TransitionPath::Rpc
        } else {
            TransitionPath::Qubesdb
        };

        let _guard = self.lock_guest(vm).await;
        let pending = self.transitions().begin(vm, relay, direction, path);
        let result = match path {
            TransitionPath::Rpc => self.call_agent(vm, relay, call).await,
            TransitionPath::Qubesdb => {
                let value = Permission::from(direction == Direction::Attach);
                self.qdb()
                    .write(relay, &permission::config_path(vm), value.as_bytes())
                    .await
                    .map_err(ArbiterError::from)
            }
        };

        match result {
            Ok(()) => {
                self.transitions().finish(pending);
                Ok(())
            }
            Err(e) => {
                self.transitions().fail(pending, &e.to_string());
                Err(e)
            }
        }
    }

    async fn call_agent(
        &self,
        vm: &str,
        relay: &str,
        call: AudioInputCall,
    ) -> Result<(), ArbiterError> {
        let service = call.service_for(self.namespace(), vm);
        info!(guest = vm, relay, service = %service, "calling audio agent");
        self.invoker()
            .run_service(relay, &service)
            .await
            .map_err(|e| {
                debug!(guest = vm, relay, error = %e, "audio agent call failed");
                let verb = match call {
                    AudioInputCall::Enable => "attach",
                    AudioInputCall::Disable => "detach",
                };
                ArbiterError::Relay {
                    guest: vm.to_string(),
                    message: format!(
                        "Failed to {verb} audio input from {relay} to {vm}: \
                         remote audio agent unavailable"
                    ),
                }
            })
    }
}
