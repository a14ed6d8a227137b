//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Where QubesDB and service calls go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `qubesdb-*` tools and `qrexec-client`
    Qubes,
    /// In-process store, service calls always fail
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qubes" => Ok(Backend::Qubes),
            "memory" => Ok(Backend::Memory),
            other => bail!("unknown backend '{other}' (expected 'qubes' or 'memory')"),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// JSON inventory of domains, if any
    pub inventory_path: Option<PathBuf>,

    /// Domain the microphone is attached to
    pub admin_domain: String,

    /// Namespace of the audio agent services
    pub rpc_namespace: String,

    pub qrexec_client: PathBuf,

    /// Directory containing `qubesdb-read`, `qubesdb-write`, `qubesdb-rm`
    pub qubesdb_dir: PathBuf,

    pub rpc_timeout: Duration,

    /// Limit for a single `qubesdb-*` tool run
    pub qubesdb_timeout: Duration,

    /// Approve ask-to-attach assignments without prompting
    pub auto_confirm: bool,

    pub backend: Backend,

    /// Log filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let socket_path = match lookup("MIC_ARBITER_SOCKET") {
            Some(path) => PathBuf::from(path),
            None => lookup("XDG_RUNTIME_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/run"))
                .join("mic-arbiter")
                .join("daemon.sock"),
        };

        let rpc_timeout = parse_secs(&lookup, "MIC_ARBITER_RPC_TIMEOUT_SECS", 30)?;
        let qubesdb_timeout = parse_secs(&lookup, "MIC_ARBITER_QUBESDB_TIMEOUT_SECS", 10)?;

        let auto_confirm = match lookup("MIC_ARBITER_AUTO_CONFIRM") {
            Some(value) => parse_bool(&value)
                .with_context(|| format!("invalid MIC_ARBITER_AUTO_CONFIRM '{value}'"))?,
            None => false,
        };

        let backend: Backend = lookup("MIC_ARBITER_BACKEND")
            .as_deref()
            .unwrap_or("qubes")
            .parse()?;

        Ok(Self {
            socket_path,
            inventory_path: lookup("MIC_ARBITER_INVENTORY").map(PathBuf::from),
            admin_domain: lookup("MIC_ARBITER_ADMIN_DOMAIN").unwrap_or_else(|| "dom0".into()),
            rpc_namespace: lookup("MIC_ARBITER_SERVICE").unwrap_or_else(|| "qubes".into()),
            qrexec_client: lookup("MIC_ARBITER_QREXEC_CLIENT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("qrexec-client")),
            qubesdb_dir: lookup("MIC_ARBITER_QUBESDB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/usr/bin")),
            rpc_timeout,
            qubesdb_timeout,
            auto_confirm,
            backend,
            log_filter: lookup("MIC_ARBITER_LOG").unwrap_or_else(|| "info".into()),
        })
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let secs = match lookup(key) {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("invalid {key} '{value}'"))?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => bail!("expected a boolean"),
    }
}
