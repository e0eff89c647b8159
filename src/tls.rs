//! STARTTLS transport upgrade (spec.md §4.5).
//!
//! Grounded on the teacher's `tls.rs`, extended with a handshake timeout
//! (spec.md §5) and a `TlsInfo` snapshot handed to the session and to the
//! `handle_STARTTLS` hook so it can inspect the negotiated cipher suite.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Certificate/cipher facts captured once a STARTTLS handshake completes,
/// handed to the handler via `handle_STARTTLS` and stored on `Session`.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub protocol_version: String,
    pub cipher_suite: String,
    pub peer_certificate_present: bool,
}

/// TLS configuration wrapper for STARTTLS support.
#[derive(Clone)]
pub struct TlsConfig {
    acceptor: TlsAcceptor,
    pub handshake_timeout: Duration,
}

impl TlsConfig {
    /// Load TLS configuration from PEM certificate and key files.
    pub fn load(
        cert_path: &str,
        key_path: &str,
        handshake_timeout: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let cert_file = File::open(cert_path)?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<_> =
            rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

        if certs.is_empty() {
            return Err("no certificates found in cert file".into());
        }

        let key_file = File::open(key_path)?;
        let mut key_reader = BufReader::new(key_file);
        let key = rustls_pemfile::private_key(&mut key_reader)?
            .ok_or("no private key found in key file")?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        info!(cert = cert_path, key = key_path, "TLS configuration loaded");

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            handshake_timeout,
        })
    }

    /// Perform the TLS handshake on the live connection, honoring the
    /// configured handshake timeout (spec.md §5 — a floor on platforms that
    /// support it).
    pub async fn accept<S>(
        &self,
        stream: S,
    ) -> Result<(tokio_rustls::server::TlsStream<S>, TlsInfo), std::io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out")
            })??;

        let (_, conn) = stream.get_ref();
        let info = TlsInfo {
            protocol_version: conn
                .protocol_version()
                .map(|v| format!("{v:?}"))
                .unwrap_or_else(|| "unknown".to_string()),
            cipher_suite: conn
                .negotiated_cipher_suite()
                .map(|c| format!("{:?}", c.suite()))
                .unwrap_or_else(|| "unknown".to_string()),
            peer_certificate_present: conn.peer_certificates().is_some(),
        };
        Ok((stream, info))
    }
}
