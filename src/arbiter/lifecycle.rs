//! Guest start and shutdown
//!
//! Both spawn detached tasks before touching any relay. The event that
//! triggered them never waits, so a slow relay cannot hold up another
//! guest's boot or shutdown. Task failures are logged, not returned.

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::MicArbiter;
use crate::device::{DeviceAssignment, MicDevice, MIC_CLASS, MIC_IDENT};

impl MicArbiter {
    /// Attach assigned microphones to a starting guest.
    ///
    /// Assignments are tried most specific first and only the first one per
    /// device is used. The returned task resolves to the number of attaches
    /// it started, once they have all finished.
    pub fn on_domain_start(&self, vm: &str) -> JoinHandle<usize> {
        let this = self.clone();
        let vm = vm.to_string();
        tokio::spawn(async move {
            let attaches = this.start_assigned(&vm).await;
            let started = attaches.len();
            for attach in attaches {
                if let Err(e) = attach.await {
                    error!(guest = %vm, error = %e, "auto-attach task panicked");
                }
            }
            started
        })
    }

    async fn start_assigned(&self, vm: &str) -> Vec<JoinHandle<()>> {
        let mut assignments = self.registry().assignments(vm, MIC_CLASS);
        assignments.sort_by(DeviceAssignment::cmp_specificity);

        let attached: Vec<MicDevice> = self
            .list_attached(vm, Some(false))
            .await
            .into_iter()
            .map(|(device, _)| device)
            .collect();

        let mut chosen: Vec<(MicDevice, DeviceAssignment)> = Vec::new();
        for assignment in assignments {
            let Some(device) = self.resolve(&assignment) else {
                debug!(guest = vm, backend = %assignment.backend_domain, "assigned mic is unknown");
                continue;
            };
            if attached.contains(&device) {
                debug!(guest = vm, device = %device, "mic already attached");
                continue;
            }
            if !assignment.matches(&device) {
                debug!(
                    guest = vm,
                    device = %device,
                    device_id = ?assignment.device_id,
                    "assignment does not match device identity"
                );
                continue;
            }
            if chosen.iter().any(|(d, _)| *d == device) {
                continue;
            }
            chosen.push((device, assignment));
        }

        chosen
            .into_iter()
            .map(|(device, assignment)| {
                let this = self.clone();
                let vm = vm.to_string();
                tokio::spawn(async move { this.auto_attach(&vm, device, assignment).await })
            })
            .collect()
    }

    /// Detach the microphone from a stopping guest if it has it
    pub fn on_domain_shutdown(&self, vm: &str) -> JoinHandle<()> {
        let this = self.clone();
        let vm = vm.to_string();
        tokio::spawn(async move {
            let device = this.device();
            let attached = this.list_attached(&vm, None).await;
            if !attached.iter().any(|(d, _)| *d == device) {
                return;
            }
            match this.detach(&vm, &device.ident).await {
                Ok(()) => info!(guest = %vm, "mic detached on shutdown"),
                Err(e) => error!(guest = %vm, error = %e, code = e.code(), "failed to detach mic on shutdown"),
            }
        })
    }

    async fn auto_attach(&self, vm: &str, device: MicDevice, assignment: DeviceAssignment) {
        if assignment.mode.needs_confirmation() {
            match self.confirmer().confirm(vm, &device).await {
                Some(target) if target == vm => {}
                Some(target) => {
                    info!(guest = vm, target = %target, "mic confirmed for another guest, skipping");
                    return;
                }
                None => {
                    info!(guest = vm, "mic attach not confirmed");
                    return;
                }
            }
        }

        match self.attach(vm, &device, &assignment.options).await {
            Ok(()) => info!(guest = vm, device = %device, "mic auto-attached"),
            Err(e) => error!(
                guest = vm,
                device = %device,
                error = %e,
                code = e.code(),
                "failed to auto-attach mic"
            ),
        }
    }

    /// Device an assignment points at, if it exists
    fn resolve(&self, assignment: &DeviceAssignment) -> Option<MicDevice> {
        let port = assignment.port.as_deref().unwrap_or(MIC_IDENT);
        self.get_device(&assignment.backend_domain, port)
    }
}
