use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Per-request timeout for relay commands.
pub const RELAY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayCommand {
    On,
    Off,
}

impl RelayCommand {
    pub fn path(self) -> &'static str {
        match self {
            RelayCommand::On => "relay/on",
            RelayCommand::Off => "relay/off",
        }
    }
}

/// Address of the relay controller (an ESP32 on the local network).
///
/// Built from a bare host or `host:port`; an `http://` prefix is tolerated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEndpoint {
    host: String,
    base: Url,
}

impl RelayEndpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_end_matches('/');
        let host = trimmed.strip_prefix("http://").unwrap_or(trimmed);
        if host.is_empty() {
            return Err(anyhow!("actuator host is empty"));
        }
        if host.contains('/') || host.contains("://") {
            return Err(anyhow!("actuator host '{}' must be a host or host:port", raw));
        }
        let base = Url::parse(&format!("http://{}/", host))
            .with_context(|| format!("invalid actuator host '{}'", raw))?;
        if base.host_str().map_or(true, str::is_empty) {
            return Err(anyhow!("actuator host '{}' has no host part", raw));
        }
        Ok(Self {
            host: host.to_string(),
            base,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn url_for(&self, command: RelayCommand) -> Result<Url> {
        self.base
            .join(command.path())
            .with_context(|| format!("build {:?} url for {}", command, self.host))
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// Sends one relay command. Implementations must bound their own latency.
pub trait RelayClient: Send + Sync {
    fn send(&self, endpoint: &RelayEndpoint, command: RelayCommand) -> Result<()>;
}

/// Relay client issuing `GET http://<host>/relay/{on,off}`; response bodies are ignored.
pub struct HttpRelay {
    agent: ureq::Agent,
}

impl HttpRelay {
    pub fn new() -> Self {
        Self::with_timeout(RELAY_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl Default for HttpRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClient for HttpRelay {
    fn send(&self, endpoint: &RelayEndpoint, command: RelayCommand) -> Result<()> {
        let url = endpoint.url_for(command)?;
        self.agent
            .get(url.as_str())
            .call()
            .with_context(|| format!("GET {}", url))?;
        Ok(())
    }
}
