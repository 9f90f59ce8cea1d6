use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Where a target listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Resource path for protocols that address one (HTTP, gRPC, CoAP Uri-Path)
    #[serde(default)]
    pub path: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}:{}{}", self.host, self.port, path),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// One system under test inside a campaign. Immutable once the campaign starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CampaignTarget {
    pub name: String,
    pub protocol: String,
    pub endpoint: Endpoint,
}

impl CampaignTarget {
    pub fn new(name: impl Into<String>, protocol: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            protocol: protocol.into(),
            endpoint,
        }
    }
}

impl Display for CampaignTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} @ {})", self.name, self.protocol, self.endpoint)
    }
}
