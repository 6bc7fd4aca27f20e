use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TCP connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Where and as whom to reach the guest's SSH server
///
/// Host keys are never checked: the guest is fresh on every run and only
/// reachable through a loopback port forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    /// SSH host (the forwarded loopback address)
    pub host: String,
    /// Host port forwarded to the guest's port 22
    pub port: u16,
    /// Guest user
    pub username: String,
    /// Private key file used for public-key authentication
    pub private_key: PathBuf,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl SshTarget {
    /// Target for a guest reachable on `localhost:<port>`
    pub fn localhost(port: u16, username: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
            username: username.into(),
            private_key: PathBuf::from("id_rsa"),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_private_key(mut self, private_key: impl Into<PathBuf>) -> Self {
        self.private_key = private_key.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
