//! Server configuration (spec.md §6 "Configurable options").
//!
//! Grounded on the teacher's `Config::from_env` in `config.rs`, extended
//! with the core protocol knobs spec.md §6 enumerates (hostname, ident,
//! data-size-limit, SMTPUTF8, decode-data, TLS/STARTTLS, idle timeout, AUTH
//! gating, PROXY-protocol timeout). The teacher's gateway-specific fields
//! (Redis, backend relay, accepted domains) are kept for the bundled demo
//! handler in `demo_handler.rs`.

use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Default message size cap (spec.md §6), matching the RFC-cited aiosmtpd
/// default.
pub const DATA_SIZE_DEFAULT: usize = 33_554_432;

/// Server configuration loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Address to listen on (e.g. 0.0.0.0:25).
    pub listen_addr: SocketAddr,
    /// Hostname reported in the 220 banner and EHLO/HELO replies.
    pub hostname: String,
    /// Software identification string appended to the 220 banner.
    pub ident: String,
    /// Maximum message size in bytes; `None` disables the check.
    pub data_size_limit: Option<usize>,
    /// Advertise and accept SMTPUTF8 (non-ASCII command arguments).
    pub enable_smtputf8: bool,
    /// When true, DATA bodies are delivered to the handler as decoded
    /// text rather than raw bytes; advertises 8BITMIME iff false.
    pub decode_data: bool,
    /// Path to TLS certificate file (PEM). If unset, STARTTLS is disabled.
    pub tls_cert_path: Option<String>,
    /// Path to TLS private key file (PEM). If unset, STARTTLS is disabled.
    pub tls_key_path: Option<String>,
    /// When true, only EHLO/STARTTLS/QUIT are accepted before TLS.
    pub require_starttls: bool,
    /// Per-connection idle command timeout.
    pub timeout: Duration,
    /// TLS handshake timeout.
    pub tls_handshake_timeout: Duration,
    /// When true, non-AUTH verbs (except EHLO/HELP/NOOP/QUIT/STARTTLS)
    /// reply 530 until authenticated.
    pub auth_required: bool,
    /// When true, AUTH is refused without active TLS and AUTH mechanisms
    /// are not advertised without it.
    pub auth_require_tls: bool,
    /// Mechanism names hidden from advertisement and dispatch.
    pub auth_exclude_mechanism: HashSet<String>,
    /// PROXY-protocol preamble budget; `Some` enables PROXY consumption.
    pub proxy_protocol_timeout: Option<Duration>,
    /// Maximum concurrent connections. 0 = unlimited.
    pub max_connections: usize,
    /// Maximum RCPT TO recipients per transaction.
    pub max_recipients: usize,
    /// Maximum connections per IP address per sliding window. 0 = disabled.
    pub max_connections_per_ip: u32,
    /// Metrics reporting interval in seconds. Set to 0 to disable.
    pub metrics_interval_secs: u64,

    // -- bundled demo-handler fields (gateway-style disposition) --
    /// Backend SMTP address to relay accepted mail to.
    pub backend_addr: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// Set of accepted domains (lowercased).
    pub accepted_domains: HashSet<String>,
    /// Redis key pattern for active mailbox check. Use `{address}`.
    pub redis_key_pattern: String,
    /// Redis SET name for the known-addresses fallback check.
    pub redis_set_name: String,
    /// Which Redis checks to perform: "both", "key", or "set".
    pub redis_check_mode: CheckMode,
}

/// Which Redis checks to perform for mailbox existence.
#[derive(Clone, Debug, PartialEq)]
pub enum CheckMode {
    Both,
    KeyOnly,
    SetOnly,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let listen_addr = env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:25".to_string())
            .parse()
            .expect("LISTEN_ADDR must be a valid socket address");

        let hostname = env::var("SERVER_NAME")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| "smtpd".to_string());

        let ident = env::var("SERVER_IDENT").unwrap_or_else(|_| "ESMTP smtpd-core".to_string());

        let data_size_limit = env::var("MAX_MESSAGE_SIZE")
            .ok()
            .map(|v| v.parse().expect("MAX_MESSAGE_SIZE must be an integer"))
            .or(Some(DATA_SIZE_DEFAULT));

        let enable_smtputf8 = env_flag("ENABLE_SMTPUTF8", false);
        let decode_data = env_flag("DECODE_DATA", false);

        let tls_cert_path = env::var("TLS_CERT_PATH").ok();
        let tls_key_path = env::var("TLS_KEY_PATH").ok();
        let require_starttls = env_flag("REQUIRE_STARTTLS", false);

        let timeout = Duration::from_secs(
            env::var("CONNECTION_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        );
        let tls_handshake_timeout = Duration::from_secs(
            env::var("TLS_HANDSHAKE_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        );

        let auth_required = env_flag("AUTH_REQUIRED", false);
        let auth_require_tls = env_flag("AUTH_REQUIRE_TLS", true);
        let auth_exclude_mechanism: HashSet<String> = env::var("AUTH_EXCLUDE_MECHANISM")
            .map(|val| {
                val.split(',')
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let proxy_protocol_timeout = env::var("PROXY_PROTOCOL_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);

        let max_connections = env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let max_recipients = env::var("MAX_RECIPIENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);

        let max_connections_per_ip = env::var("MAX_CONNECTIONS_PER_IP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let metrics_interval_secs = env::var("METRICS_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let backend_addr =
            env::var("BACKEND_SMTP").unwrap_or_else(|_| "127.0.0.1:2525".to_string());

        let redis_url = if let Ok(url) = env::var("REDIS_URL") {
            url
        } else {
            let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
            let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
            let user = env::var("REDIS_USERNAME").unwrap_or_default();
            let pass = env::var("REDIS_PASSWORD").unwrap_or_default();

            if !user.is_empty() && !pass.is_empty() {
                format!("redis://{}:{}@{}:{}", user, pass, host, port)
            } else if !pass.is_empty() {
                format!("redis://:{}@{}:{}", pass, host, port)
            } else {
                format!("redis://{}:{}", host, port)
            }
        };

        let accepted_domains: HashSet<String> = env::var("ACCEPTED_DOMAINS")
            .map(|val| {
                val.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let redis_key_pattern =
            env::var("REDIS_KEY_PATTERN").unwrap_or_else(|_| "mb:{address}".to_string());
        let redis_set_name = env::var("REDIS_SET_NAME").unwrap_or_else(|_| "addresses".to_string());
        let redis_check_mode = match env::var("REDIS_CHECK_MODE")
            .unwrap_or_else(|_| "both".to_string())
            .to_lowercase()
            .as_str()
        {
            "key" | "key_only" => CheckMode::KeyOnly,
            "set" | "set_only" => CheckMode::SetOnly,
            _ => CheckMode::Both,
        };

        Config {
            listen_addr,
            hostname,
            ident,
            data_size_limit,
            enable_smtputf8,
            decode_data,
            tls_cert_path,
            tls_key_path,
            require_starttls,
            timeout,
            tls_handshake_timeout,
            auth_required,
            auth_require_tls,
            auth_exclude_mechanism,
            proxy_protocol_timeout,
            max_connections,
            max_recipients,
            max_connections_per_ip,
            metrics_interval_secs,
            backend_addr,
            redis_url,
            accepted_domains,
            redis_key_pattern,
            redis_set_name,
            redis_check_mode,
        }
    }

    /// Check if STARTTLS is available (both cert and key configured).
    pub fn tls_available(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }

    /// Build a Redis key for the given address using the configured pattern.
    pub fn redis_key_for(&self, address: &str) -> String {
        self.redis_key_pattern
            .replace("{address}", &address.to_lowercase())
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            listen_addr: "0.0.0.0:25".parse().unwrap(),
            hostname: "smtpd".into(),
            ident: "ESMTP smtpd-core".into(),
            data_size_limit: Some(DATA_SIZE_DEFAULT),
            enable_smtputf8: false,
            decode_data: false,
            tls_cert_path: None,
            tls_key_path: None,
            require_starttls: false,
            timeout: Duration::from_secs(300),
            tls_handshake_timeout: Duration::from_secs(30),
            auth_required: false,
            auth_require_tls: true,
            auth_exclude_mechanism: HashSet::new(),
            proxy_protocol_timeout: None,
            max_connections: 1000,
            max_recipients: 100,
            max_connections_per_ip: 0,
            metrics_interval_secs: 60,
            backend_addr: "127.0.0.1:2525".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            accepted_domains: HashSet::new(),
            redis_key_pattern: "mb:{address}".into(),
            redis_set_name: "addresses".into(),
            redis_check_mode: CheckMode::Both,
        }
    }

    #[test]
    fn redis_key_for_substitutes_address() {
        let config = base_config();
        assert_eq!(config.redis_key_for("User@Example.com"), "mb:user@example.com");
        assert!(!config.tls_available());
    }

    #[test]
    fn tls_available_requires_both_paths() {
        let mut config = base_config();
        config.tls_cert_path = Some("cert.pem".into());
        assert!(!config.tls_available());
        config.tls_key_path = Some("key.pem".into());
        assert!(config.tls_available());
    }
}
