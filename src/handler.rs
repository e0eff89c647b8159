//! Handler hook bus (spec.md §4.7, §9 Design Notes).
//!
//! aiosmtpd enumerates `handle_<EVENT>` methods on a duck-typed handler
//! object at runtime via `getattr`. The statically typed translation
//! (spec.md §9) is a capability trait with a default ("no override")
//! implementation per hook, so a concrete handler only overrides the
//! events it cares about. `async_trait` is used so the trait stays
//! object-safe as `Arc<dyn Handler>`, which spec.md §5 requires since the
//! handler may be shared across concurrently running connections.

use async_trait::async_trait;

use crate::error::SessionError;
use crate::proxy::ProxyData;
use crate::session::{Envelope, Session};
use crate::tls::TlsInfo;

/// Result of invoking a hook: either "no override" (the dispatcher applies
/// its built-in behavior) or a reply string the dispatcher pushes verbatim,
/// bypassing the default state mutation. A hook returning `Reply` is
/// responsible for populating `envelope`/`session` itself if it wants the
/// command to be considered successful (spec.md §4.7).
#[derive(Debug, Clone)]
pub enum HookResult {
    Default,
    Reply(String),
}

impl HookResult {
    pub fn is_default(&self) -> bool {
        matches!(self, HookResult::Default)
    }
}

/// Per-recipient LMTP delivery status, returned from `handle_DATA` when the
/// server is running in LMTP mode (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct RecipientStatus {
    pub recipient: String,
    pub reply: String,
}

/// Outcome of `handle_DATA`: either a single overall reply (SMTP) or a
/// per-recipient list (LMTP).
#[derive(Debug, Clone)]
pub enum DataOutcome {
    Default,
    Reply(String),
    PerRecipient(Vec<RecipientStatus>),
}

/// User-supplied event hooks. Every method has a default ("no override")
/// implementation so a handler only overrides what it needs.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle_helo(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _hostname: &str,
    ) -> HookResult {
        HookResult::Default
    }

    async fn handle_ehlo(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _hostname: &str,
    ) -> HookResult {
        HookResult::Default
    }

    async fn handle_mail(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _address: &str,
        _options: &[String],
    ) -> HookResult {
        HookResult::Default
    }

    async fn handle_rcpt(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _address: &str,
        _options: &[String],
    ) -> HookResult {
        HookResult::Default
    }

    async fn handle_data(&self, _session: &mut Session, _envelope: &mut Envelope) -> DataOutcome {
        DataOutcome::Default
    }

    /// Called once an AUTH mechanism has already produced a verdict; this
    /// hook may override the final reply but not the credential check
    /// itself (that happens via [`crate::auth::AuthCallback`]).
    async fn handle_auth(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _mechanism: &str,
    ) -> HookResult {
        HookResult::Default
    }

    /// Inspect the negotiated TLS session; returning `false` marks the
    /// session security-failed (spec.md §4.5) — every subsequent non-QUIT
    /// command is then refused with `554`.
    async fn handle_starttls(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _info: &TlsInfo,
    ) -> bool {
        true
    }

    /// Accept or reject a connection based on its PROXY-protocol preamble.
    async fn handle_proxy(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _data: &ProxyData,
    ) -> bool {
        true
    }

    async fn handle_rset(&self, _session: &mut Session, _envelope: &mut Envelope) -> HookResult {
        HookResult::Default
    }

    async fn handle_vrfy(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _address: &str,
    ) -> HookResult {
        HookResult::Default
    }

    /// Translate an otherwise-unhandled error into a reply. Returning
    /// `None` falls back to the dispatcher's fixed `500 Error: (...)`
    /// string (spec.md §7).
    async fn handle_exception(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        _error: &SessionError,
    ) -> Option<String> {
        None
    }
}

/// A handler with every hook at its default — used when no custom
/// disposition logic is needed (e.g. a pure sink).
pub struct NullHandler;

#[async_trait]
impl Handler for NullHandler {}
