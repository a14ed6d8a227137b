//! QubesDB access through the `qubesdb-read`/`qubesdb-write`/`qubesdb-rm` tools

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::KvChannel;
use crate::error::ChannelError;

/// Exit status of `qubesdb-read` for a missing key
const READ_MISSING_STATUS: i32 = 1;

#[derive(Debug, Clone)]
pub struct CommandQubesDb {
    tools_dir: PathBuf,
    timeout: Duration,
}

impl CommandQubesDb {
    pub fn new(tools_dir: &Path, timeout: Duration) -> Self {
        Self {
            tools_dir: tools_dir.to_owned(),
            timeout,
        }
    }

    async fn run(&self, tool: &str, domain: &str, args: &[&[u8]]) -> Result<Output, ChannelError> {
        let mut cmd = Command::new(self.tools_dir.join(tool));
        cmd.arg("-d").arg(domain);
        for arg in args {
            cmd.arg(OsStr::from_bytes(arg));
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        debug!(tool, domain, "running qubesdb tool");
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(tool, domain, timeout_secs = self.timeout.as_secs(), "qubesdb tool timed out");
                Err(ChannelError::Timeout {
                    domain: domain.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }

    fn unavailable(domain: &str, output: &Output) -> ChannelError {
        ChannelError::Unavailable {
            domain: domain.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

#[async_trait]
impl KvChannel for CommandQubesDb {
    async fn read(&self, domain: &str, path: &str) -> Result<Option<Vec<u8>>, ChannelError> {
        let output = self.run("qubesdb-read", domain, &[b"-r", path.as_bytes()]).await?;
        if output.status.success() {
            // untouched: the relay controls these bytes
            return Ok(Some(output.stdout));
        }
        if output.status.code() == Some(READ_MISSING_STATUS) {
            return Ok(None);
        }
        Err(Self::unavailable(domain, &output))
    }

    async fn write(&self, domain: &str, path: &str, value: &[u8]) -> Result<(), ChannelError> {
        let output = self
            .run("qubesdb-write", domain, &[path.as_bytes(), value])
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::unavailable(domain, &output))
        }
    }

    async fn rm(&self, domain: &str, path: &str) -> Result<(), ChannelError> {
        let output = self.run("qubesdb-rm", domain, &[path.as_bytes()]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Self::unavailable(domain, &output))
        }
    }
}
