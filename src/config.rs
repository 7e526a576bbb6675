//! Server and sandbox configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Per-process limits applied inside every sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// CPU time in milliseconds (rounded down to whole seconds, minimum 1).
    pub time_ms: u64,
    /// Address space in KB.
    pub mem_kb: u64,
    /// Largest file a process may write, in KB.
    pub fsize_kb: u64,
    pub nofile: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            time_ms: 300_000,
            // Interpreters and package managers reserve a lot of virtual memory
            mem_kb: 2_097_152,
            fsize_kb: 1_048_576,
            nofile: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Where sandbox roots and kept templates are created.
    pub sandbox_dir: PathBuf,
    pub limits: SandboxLimits,
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            sandbox_dir: PathBuf::from("/tmp/isolate"),
            limits: SandboxLimits::default(),
        }
    }
}
