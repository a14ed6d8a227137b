//! Service calls through `qrexec-client`

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::RemoteInvoker;
use crate::error::InvokeError;

#[derive(Debug, Clone)]
pub struct QrexecInvoker {
    client: PathBuf,
    /// Domain the call is made on behalf of
    source: String,
    timeout: Duration,
}

impl QrexecInvoker {
    pub fn new(client: &Path, source: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: client.to_owned(),
            source: source.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RemoteInvoker for QrexecInvoker {
    async fn run_service(&self, domain: &str, service: &str) -> Result<(), InvokeError> {
        let mut cmd = Command::new(&self.client);
        cmd.arg("-d")
            .arg(domain)
            .arg("-T")
            .arg(format!("DEFAULT:QUBESRPC {service} {}", self.source))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(domain, service, "calling service");
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(domain, service, timeout_secs = self.timeout.as_secs(), "service call timed out");
                return Err(InvokeError::Timeout {
                    domain: domain.to_string(),
                    service: service.to_string(),
                });
            }
        };

        if output.status.success() {
            return Ok(());
        }
        debug!(
            domain,
            service,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "service call failed"
        );
        Err(InvokeError::Failed {
            domain: domain.to_string(),
            service: service.to_string(),
            status: output.status.code().unwrap_or(-1),
        })
    }
}
