use std::path::Path;

use serde::{Deserialize, Serialize};

/// Endpoint of a ZeroMQ socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// Unix domain socket under `/tmp/vigil/`.
    Ipc(String),

    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(name.to_string())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `ipc://name`, `tcp://host:port` or a bare IPC socket name.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':')?;
            return Some(Self::tcp(host, port.parse().ok()?));
        }
        let name = s.strip_prefix("ipc://").unwrap_or(s);
        let name = name
            .strip_prefix("/tmp/vigil/")
            .unwrap_or(name)
            .trim_end_matches(".sock");
        if name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::ipc(name))
    }

    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(name) => format!("ipc:///tmp/vigil/{name}.sock"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// Create the IPC socket directory. No-op for TCP.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            if let Some(parent) = Path::new(&path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Remove a socket file left behind by a previous run, which would
    /// otherwise make the bind fail with `EADDRINUSE`.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        if let Some(path) = self.ipc_path() {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path, "removed stale IPC socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn ipc_path(&self) -> Option<String> {
        match self {
            Self::Ipc(_) => {
                let endpoint = self.endpoint();
                endpoint.strip_prefix("ipc://").map(str::to_string)
            }
            Self::Tcp { .. } => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
