use std::fmt;

use serde::{Deserialize, Serialize};

use quarry_wire::ProxyUsed;

/// Proxy settings handed to an executor child.
///
/// The password travels only on the supervisor → child stdin descriptor.
/// Surfaced objects (run results, reports, wire frames) carry a
/// [`RedactedProxy`] instead, and `Debug` never prints the password.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy server URL.
    pub server: String,
    /// Username for authenticated proxies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password for authenticated proxies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// The credential-free form safe to surface anywhere.
    pub fn redacted(&self) -> RedactedProxy {
        RedactedProxy {
            server: self.server.clone(),
            username: self.username.clone(),
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Proxy descriptor with credentials stripped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedactedProxy {
    /// Proxy server URL.
    pub server: String,
    /// Proxy username, if authentication was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl From<ProxyUsed> for RedactedProxy {
    fn from(used: ProxyUsed) -> Self {
        RedactedProxy {
            server: used.server,
            username: used.username,
        }
    }
}
