use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// MedLink reverse tunnel relay.
///
/// Hospital edge agents dial in over a single outbound WebSocket and
/// register their subdomain; public HTTPS requests are routed onto the
/// matching tunnel by Host header.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Primary public listener address
    #[arg(long, env = "MEDLINK_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:443")]
    pub listen_addr: std::net::SocketAddr,

    /// Secondary HTTP listener address (redirects to HTTPS)
    #[arg(long, env = "MEDLINK_RELAY_HTTP_ADDR", default_value = "0.0.0.0:80")]
    pub http_addr: std::net::SocketAddr,

    /// Root domain; tunnel ids derive by stripping `.<domain>` from Host
    #[arg(long, env = "MEDLINK_RELAY_DOMAIN")]
    pub domain: String,

    /// Terminate TLS on the primary listener (false when fronted by an
    /// external terminator)
    #[arg(
        long,
        env = "MEDLINK_RELAY_TLS_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub tls_enabled: bool,

    /// Path to the TLS certificate PEM (static mode)
    #[arg(long, env = "MEDLINK_RELAY_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to the TLS private key PEM (static mode)
    #[arg(long, env = "MEDLINK_RELAY_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Obtain certificates on demand through ACME
    #[arg(
        long,
        env = "MEDLINK_RELAY_TLS_AUTO_CERT",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub tls_auto_cert: bool,

    /// Contact email for the ACME account (required with auto_cert)
    #[arg(long, env = "MEDLINK_RELAY_ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Directory cache for issued certificates
    #[arg(long, env = "MEDLINK_RELAY_ACME_CACHE", default_value = "acme-cache")]
    pub acme_cache: PathBuf,

    /// Use the Let's Encrypt staging directory
    #[arg(long, env = "MEDLINK_RELAY_ACME_STAGING", default_value_t = false)]
    pub acme_staging: bool,

    /// Session idle cutoff in seconds
    #[arg(long, env = "MEDLINK_RELAY_IDLE_TIMEOUT", default_value_t = 30)]
    pub idle_timeout_secs: u64,

    /// Per-request timeout in seconds (response head wait, and between
    /// body frames)
    #[arg(long, env = "MEDLINK_RELAY_REQUEST_TIMEOUT", default_value_t = 300)]
    pub request_timeout_secs: u64,

    /// Upper bound on concurrent tunnels
    #[arg(long, env = "MEDLINK_RELAY_MAX_CONCURRENT_CONN", default_value_t = 2048)]
    pub max_concurrent_conn: usize,

    /// Admin endpoint address
    #[arg(long, env = "MEDLINK_RELAY_METRICS_ADDR", default_value = "127.0.0.1:9090")]
    pub metrics_addr: std::net::SocketAddr,

    /// Path prefixes that require a download token (comma separated)
    #[arg(
        long,
        env = "MEDLINK_RELAY_DOWNLOAD_TOKEN_PATHS",
        value_delimiter = ','
    )]
    pub download_token_paths: Vec<String>,

    /// Log filter (any tracing directive, e.g. info or medlink_relay=debug)
    #[arg(long, env = "MEDLINK_RELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "MEDLINK_RELAY_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.domain.is_empty() {
            anyhow::bail!("domain must be set");
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            anyhow::bail!("tls.cert_file and tls.key_file must be provided together");
        }
        if self.tls_enabled {
            if self.tls_auto_cert {
                if self.acme_email.is_none() {
                    anyhow::bail!("tls.acme_email is required when tls.auto_cert is enabled");
                }
            } else if self.tls_cert.is_none() {
                anyhow::bail!(
                    "TLS is enabled: provide tls.cert_file and tls.key_file, or enable tls.auto_cert"
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON config file support
// ---------------------------------------------------------------------------

/// One hospital in the config file's `hospitals` array. The `token` may be
/// omitted when a `<CODE>_TOKEN` environment variable supplies it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalEntry {
    pub code: String,
    pub subdomain: String,
    #[serde(default)]
    pub token: String,
}

/// The `tls` section of the config file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TlsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_cert: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acme_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acme_cache: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acme_staging: Option<bool>,
}

/// Serializable config for the JSON file. All scalar fields are optional;
/// populated values are injected as env-var defaults before clap parsing,
/// preserving the precedence CLI > env > config file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_conn: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_token_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
    #[serde(default)]
    pub hospitals: Vec<HospitalEntry>,
}

impl ConfigFile {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Inject values as environment variables so clap picks them up.
    ///
    /// Only sets variables that are not already present, so real env vars
    /// and CLI flags keep precedence over the file.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("MEDLINK_RELAY_LISTEN_ADDR", self.listen_addr);
        set!("MEDLINK_RELAY_HTTP_ADDR", self.http_addr);
        set!("MEDLINK_RELAY_DOMAIN", self.domain);
        set!("MEDLINK_RELAY_IDLE_TIMEOUT", self.idle_timeout);
        set!("MEDLINK_RELAY_REQUEST_TIMEOUT", self.request_timeout);
        set!("MEDLINK_RELAY_MAX_CONCURRENT_CONN", self.max_concurrent_conn);
        set!("MEDLINK_RELAY_METRICS_ADDR", self.metrics_addr);
        set!("MEDLINK_RELAY_LOG_LEVEL", self.log_level);
        set!("MEDLINK_RELAY_LOG_JSON", self.log_json);

        if let Some(ref tls) = self.tls {
            set!("MEDLINK_RELAY_TLS_ENABLED", tls.enabled);
            set!("MEDLINK_RELAY_TLS_CERT", tls.cert_file);
            set!("MEDLINK_RELAY_TLS_KEY", tls.key_file);
            set!("MEDLINK_RELAY_TLS_AUTO_CERT", tls.auto_cert);
            set!("MEDLINK_RELAY_ACME_EMAIL", tls.acme_email);
            set!("MEDLINK_RELAY_ACME_CACHE", tls.acme_cache);
            set!("MEDLINK_RELAY_ACME_STAGING", tls.acme_staging);
        }

        // comma-separated list
        if let Some(ref paths) = self.download_token_paths {
            if std::env::var("MEDLINK_RELAY_DOWNLOAD_TOKEN_PATHS").is_err() {
                std::env::set_var("MEDLINK_RELAY_DOWNLOAD_TOKEN_PATHS", paths.join(","));
            }
        }
    }
}
