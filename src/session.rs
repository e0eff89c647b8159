//! Per-connection and per-message state records (spec.md §3).
//!
//! Grounded on the teacher's `SessionState` in `session.rs`, generalized to
//! the full Session/Envelope split of aiosmtpd's `Session`/`Envelope`
//! classes, including TLS info, AUTH identity, and per-session command
//! size-limit overrides (spec.md §9 — instantiated fresh per `Session`
//! rather than as a module-global map).

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::tls::TlsInfo;

/// Default per-command line length cap (spec.md §3 invariant 7).
pub const COMMAND_SIZE_LIMIT: usize = 512;

/// Either raw message bytes or, when `decode_data` is enabled, the decoded
/// text form delivered to the handler.
#[derive(Debug, Clone)]
pub enum Content {
    Raw(Vec<u8>),
    Decoded(String),
}

/// Per-connection state, created on connect and reset on STARTTLS
/// completion (invariant 6). Persists across messages within a connection
/// except where noted.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: SocketAddr,
    pub tls: Option<TlsInfo>,
    /// Set by the first HELO/EHLO/LHLO; cleared on STARTTLS upgrade.
    pub host_name: Option<String>,
    pub extended_smtp: bool,
    /// Set once AUTH succeeds; persists across messages (invariant 5),
    /// cleared only on STARTTLS (invariant 6).
    pub authenticated: bool,
    pub login_data: Option<Vec<u8>>,
    /// Set when a STARTTLS handshake hook rejects the negotiated session;
    /// every subsequent non-QUIT command is then refused with `554`.
    pub tls_handshake_failed: bool,
    pub command_size_limits: HashMap<&'static str, usize>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            tls: None,
            host_name: None,
            extended_smtp: false,
            authenticated: false,
            login_data: None,
            tls_handshake_failed: false,
            command_size_limits: HashMap::new(),
        }
    }

    /// The size limit in effect for `verb`, honoring EHLO-granted MAIL
    /// bumps (SIZE= adds 26 bytes, SMTPUTF8 adds 10 — spec.md §4.3).
    pub fn command_size_limit(&self, verb: &str) -> usize {
        self.command_size_limits
            .get(verb)
            .copied()
            .unwrap_or(COMMAND_SIZE_LIMIT)
    }

    pub fn bump_command_size_limit(&mut self, verb: &'static str, by: usize) {
        let cur = self.command_size_limit(verb);
        self.command_size_limits.insert(verb, cur + by);
    }

    /// Full reset performed after a successful STARTTLS handshake
    /// (invariant 6): greeting hostname cleared, extended-SMTP and auth
    /// state cleared, client must re-EHLO.
    pub fn reset_for_starttls(&mut self) {
        self.host_name = None;
        self.extended_smtp = false;
        self.authenticated = false;
        self.login_data = None;
        self.command_size_limits.clear();
    }
}

/// Per-message accumulator, created at connect time and replaced after each
/// RSET or successful DATA (invariant 5). Never carries `mail_from` across
/// the DATA boundary.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub mail_from: Option<String>,
    pub mail_options: Vec<String>,
    pub smtp_utf8: bool,
    pub rcpt_tos: Vec<String>,
    pub rcpt_options: Vec<String>,
    pub content: Option<Content>,
    pub original_content: Vec<u8>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 2525)
    }

    #[test]
    fn default_command_size_limit_is_512() {
        let session = Session::new(peer());
        assert_eq!(session.command_size_limit("MAIL"), COMMAND_SIZE_LIMIT);
    }

    #[test]
    fn ehlo_bumps_are_per_session() {
        let mut a = Session::new(peer());
        let b = Session::new(peer());
        a.bump_command_size_limit("MAIL", 26);
        assert_eq!(a.command_size_limit("MAIL"), COMMAND_SIZE_LIMIT + 26);
        assert_eq!(b.command_size_limit("MAIL"), COMMAND_SIZE_LIMIT);
    }

    #[test]
    fn starttls_reset_clears_greeting_and_auth() {
        let mut session = Session::new(peer());
        session.host_name = Some("client.example".to_string());
        session.extended_smtp = true;
        session.authenticated = true;
        session.login_data = Some(b"user".to_vec());
        session.reset_for_starttls();
        assert!(session.host_name.is_none());
        assert!(!session.extended_smtp);
        assert!(!session.authenticated);
        assert!(session.login_data.is_none());
    }
}
