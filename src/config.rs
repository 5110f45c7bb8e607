//! YAML configuration for the proxy/merger roles.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dn::{DistinguishedName, DnParseError};
use crate::merger::Merger;
use crate::proxy::{BackendTls, PassthroughHooks, Proxy};
use crate::service_bind::ServiceBindConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub backend: BackendConfig,
    /// Proxy (one backend) or merger (fan out to all backends).
    #[serde(default)]
    pub mode: Mode,
    /// TLS for the listener (LDAPS / StartTLS toward clients).
    pub tls: Option<TlsConfig>,
    /// Bind interception against service credentials (proxy mode only).
    pub service_bind: Option<ServiceBindSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Proxy,
    Merger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub servers: Vec<BackendServer>,
    /// Connect attempts per backend before giving up (default 3).
    pub connect_attempts: Option<u32>,
    /// Delay between connect attempts in milliseconds (default 50).
    pub connect_retry_delay_ms: Option<u64>,
    /// Skip certificate verification for StartTLS toward backends. Test
    /// networks only.
    pub tls_skip_verify: Option<bool>,
    /// PEM CA bundle used to verify backend certificates.
    pub tls_cacert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServer {
    pub uri: String,
    /// Negotiate StartTLS against this backend before forwarding.
    pub starttls: Option<bool>,
    /// Name verified in the backend certificate; defaults to the URI host.
    pub tls_server_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceBindSection {
    /// Subtree searched for serviceSecurityObject entries.
    pub base_dn: String,
    /// Service names in priority order.
    pub services: Vec<String>,
    /// Forward the real bind to the backend when no service credential
    /// matches (default true).
    pub fallback: Option<bool>,
}

impl ServiceBindSection {
    pub fn to_service_bind_config(&self) -> Result<ServiceBindConfig, DnParseError> {
        Ok(ServiceBindConfig {
            base_dn: DistinguishedName::parse(&self.base_dn)?,
            service_names: self.services.clone(),
            fallback: self.fallback.unwrap_or(true),
        })
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    fn retries(&self) -> (u32, Duration) {
        (
            self.backend.connect_attempts.unwrap_or(3),
            Duration::from_millis(self.backend.connect_retry_delay_ms.unwrap_or(50)),
        )
    }

    /// Wire the proxy role: the first configured backend server, with its
    /// StartTLS and retry settings.
    pub fn build_proxy(&self) -> Result<Proxy<PassthroughHooks>> {
        let server = self
            .backend
            .servers
            .first()
            .context("no backend servers configured")?;
        let addr = backend_addr(&server.uri)?;
        let (attempts, delay) = self.retries();
        let mut proxy = Proxy::new(addr.clone()).with_connect_retries(attempts, delay);
        if server.starttls.unwrap_or(false) {
            let tls_config = crate::tls::client_config(
                self.backend.tls_cacert.as_deref(),
                self.backend.tls_skip_verify.unwrap_or(false),
            )?;
            let server_name = server
                .tls_server_name
                .clone()
                .unwrap_or_else(|| host_of(&addr).to_string());
            proxy = proxy.with_backend_tls(BackendTls { config: tls_config, server_name });
        }
        Ok(proxy)
    }

    /// Wire the merger role over every configured backend server.
    pub fn build_merger(&self) -> Result<Merger> {
        if self.backend.servers.is_empty() {
            anyhow::bail!("no backend servers configured");
        }
        let addrs = self
            .backend
            .servers
            .iter()
            .map(|server| backend_addr(&server.uri))
            .collect::<Result<Vec<_>>>()?;
        let (attempts, delay) = self.retries();
        Ok(Merger::new(addrs).with_connect_retries(attempts, delay))
    }
}

/// `ldap://host:port` -> `host:port`, for the connector.
fn backend_addr(uri: &str) -> Result<String> {
    let rest = uri
        .strip_prefix("ldap://")
        .or_else(|| uri.strip_prefix("ldaps://"))
        .with_context(|| format!("invalid backend URI scheme: {}", uri))?;
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        anyhow::bail!("backend URI has no address: {}", uri);
    }
    Ok(rest.to_string())
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig { url: "ldap://127.0.0.1:1389".to_string() },
            backend: BackendConfig {
                servers: vec![],
                connect_attempts: Some(3),
                connect_retry_delay_ms: Some(50),
                tls_skip_verify: None,
                tls_cacert: None,
            },
            mode: Mode::Proxy,
            tls: None,
            service_bind: None,
        }
    }
}
