//! SQL proxy configuration (env-driven).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::{ProxyConfig, ShutdownPolicy, TlsOptions, UpstreamTarget};

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Force debug logging and log the full configuration at startup.
    pub debug: bool,

    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Port for the metrics/health HTTP server.
    pub metrics_port: u16,

    /// Upstream database host.
    pub upstream_host: String,

    /// Upstream database port.
    pub upstream_port: u16,

    /// IP the proxy listens on.
    pub bind_address: IpAddr,

    /// Port the proxy listens on.
    pub bind_port: u16,

    /// Connect to the upstream over TLS.
    pub use_ssl: bool,

    /// Skip upstream certificate verification.
    pub ssl_skip_verify: bool,

    pub ssl_ca_file: Option<PathBuf>,
    pub ssl_cert_file: Option<PathBuf>,
    pub ssl_key_file: Option<PathBuf>,

    /// Decode and re-encode the server handshake.
    pub enable_decoding: bool,

    /// Concurrent connection limit (0 = unlimited).
    pub max_connections: usize,

    pub shutdown_policy: ShutdownPolicy,

    /// How long the process waits for drained connections before exiting.
    pub drain_timeout: Duration,

    /// How long health probe results are reused (0 = probe every request).
    pub probe_cache_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let debug = parse_bool(&lookup, "DEBUG", false)?;

        let log_level = if debug {
            "debug".to_string()
        } else {
            lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string())
        };

        let metrics_port = parse_or(&lookup, "METRICS_PORT", 9090)?;
        let upstream_host =
            lookup("SOURCE_DATABASE_SERVER").unwrap_or_else(|| "localhost".to_string());
        let upstream_port = parse_or(&lookup, "SOURCE_DATABASE_PORT", 3306)?;
        let bind_address = parse_or(&lookup, "BIND_ADDRESS", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
        let bind_port = parse_or(&lookup, "BIND_PORT", 3306)?;

        let use_ssl = parse_bool(&lookup, "USE_SSL", false)?;
        let ssl_skip_verify = parse_bool(&lookup, "SSL_SKIP_VERIFY", false)?;
        let ssl_ca_file = path_var(&lookup, "SSL_CA_FILE");
        let ssl_cert_file = path_var(&lookup, "SSL_CERT_FILE");
        let ssl_key_file = path_var(&lookup, "SSL_KEY_FILE");

        let enable_decoding = parse_bool(&lookup, "ENABLE_DECODING", true)?;
        let max_connections = parse_or(&lookup, "PROXY_MAX_CONNECTIONS", 0)?;

        let shutdown_policy = lookup("PROXY_SHUTDOWN_POLICY")
            .map(|v| v.parse::<ShutdownPolicy>())
            .transpose()
            .map_err(anyhow::Error::msg)
            .context("PROXY_SHUTDOWN_POLICY must be 'drain' or 'abort'.")?
            .unwrap_or_default();

        let drain_timeout_secs: u64 = parse_or(&lookup, "PROXY_DRAIN_TIMEOUT_SECS", 30)?;
        let probe_cache_secs: u64 = parse_or(&lookup, "HEALTH_PROBE_CACHE_SECS", 5)?;

        Ok(Self {
            debug,
            log_level,
            metrics_port,
            upstream_host,
            upstream_port,
            bind_address,
            bind_port,
            use_ssl,
            ssl_skip_verify,
            ssl_ca_file,
            ssl_cert_file,
            ssl_key_file,
            enable_decoding,
            max_connections,
            shutdown_policy,
            drain_timeout: Duration::from_secs(drain_timeout_secs),
            probe_cache_ttl: Duration::from_secs(probe_cache_secs),
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.metrics_port)
    }

    /// TLS options, when TLS is enabled.
    pub fn tls_options(&self) -> Option<TlsOptions> {
        self.use_ssl.then(|| TlsOptions {
            skip_verify: self.ssl_skip_verify,
            ca_file: self.ssl_ca_file.clone(),
            cert_file: self.ssl_cert_file.clone(),
            key_file: self.ssl_key_file.clone(),
        })
    }

    /// Engine configuration derived from this process configuration.
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            bind_addr: self.bind_addr(),
            upstream: UpstreamTarget::new(self.upstream_host.clone(), self.upstream_port),
            tls: self.tls_options(),
            decode_handshake: self.enable_decoding,
            max_connections: self.max_connections,
            shutdown_policy: self.shutdown_policy,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{key} has an invalid value."))
        .map(|v| v.unwrap_or(default))
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => anyhow::bail!("{key} must be a boolean (true/false/1/0), got '{value}'."),
    }
}

/// Empty values count as unset.
fn path_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}
