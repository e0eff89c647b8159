//! Bundled reference handler: domain allow-list + Redis mailbox existence
//! check at RCPT time, then a relay to a downstream SMTP backend at DATA
//! time (spec.md §4.7 — "a handler is free to reject, relay, or queue").
//!
//! Grounded on the teacher's own gateway disposition logic (formerly
//! `session.rs`'s inline accept/reject checks plus `relay.rs`), now
//! expressed as one `Handler` implementation rather than baked into the
//! protocol loop.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::config::Config;
use crate::handler::{DataOutcome, Handler, HookResult};
use crate::lookup::MailboxLookup;
use crate::metrics::Metrics;
use crate::relay;
use crate::session::{Content, Envelope, Session};

/// `true` iff `domain` is in `accepted` exactly, or is a direct child of a
/// domain in `accepted` (one label stripped — not a full suffix match, so
/// `a.b.tempy.email` is not covered by an `accepted = {"tempy.email"}`
/// entry, only `b.tempy.email` would be).
pub fn is_domain_accepted(domain: &str, accepted: &std::collections::HashSet<String>) -> bool {
    if domain.is_empty() {
        return false;
    }
    if accepted.contains(domain) {
        return true;
    }
    match domain.find('.') {
        Some(idx) => accepted.contains(&domain[idx + 1..]),
        None => false,
    }
}

/// Accepts mail for an allow-listed set of domains whose mailboxes are
/// tracked in Redis, then relays accepted messages to a downstream SMTP
/// server.
pub struct RelayHandler {
    lookup: MailboxLookup,
    backend_addr: String,
    hostname: String,
    accepted_domains: std::collections::HashSet<String>,
    metrics: Option<Arc<Metrics>>,
}

impl RelayHandler {
    pub fn new(lookup: MailboxLookup, config: &Config) -> Self {
        Self {
            lookup,
            backend_addr: config.backend_addr.clone(),
            hostname: config.hostname.clone(),
            accepted_domains: config.accepted_domains.clone(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl Handler for RelayHandler {
    async fn handle_rcpt(
        &self,
        _session: &mut Session,
        _envelope: &mut Envelope,
        address: &str,
        _options: &[String],
    ) -> HookResult {
        let domain = match address.rsplit_once('@') {
            Some((_, domain)) if !domain.is_empty() => domain,
            _ => return HookResult::Reply("501 5.1.3 Bad recipient address syntax".to_string()),
        };
        if !is_domain_accepted(domain, &self.accepted_domains) {
            return HookResult::Reply(
                "550 5.1.1 Recipient address rejected: Domain not found".to_string(),
            );
        }
        if !self.lookup.should_accept(address).await {
            return HookResult::Reply(
                "550 5.1.1 Recipient address rejected: User unknown".to_string(),
            );
        }
        HookResult::Default
    }

    async fn handle_data(&self, _session: &mut Session, envelope: &mut Envelope) -> DataOutcome {
        let sender = envelope.mail_from.clone().unwrap_or_default();
        let recipients = envelope.rcpt_tos.clone();
        let body: Vec<u8> = match &envelope.content {
            Some(Content::Raw(bytes)) => bytes.clone(),
            Some(Content::Decoded(text)) => text.clone().into_bytes(),
            None => envelope.original_content.clone(),
        };

        match relay::relay_message(&self.backend_addr, &self.hostname, &sender, &recipients, &body)
            .await
        {
            Ok(()) => DataOutcome::Default,
            Err(e) => {
                error!(error = %e, sender = %sender, "relay to backend failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_relay_error();
                }
                DataOutcome::Reply("451 4.3.0 Error: relay to backend failed".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(domains: &[&str]) -> std::collections::HashSet<String> {
        domains.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn exact_match() {
        let set = accepted(&["tempy.email"]);
        assert!(is_domain_accepted("tempy.email", &set));
    }

    #[test]
    fn not_accepted() {
        let set = accepted(&["tempy.email"]);
        assert!(!is_domain_accepted("evil.com", &set));
    }

    #[test]
    fn direct_subdomain_matches_parent() {
        let set = accepted(&["tempy.email"]);
        assert!(is_domain_accepted("abc123.tempy.email", &set));
    }

    #[test]
    fn subdomain_of_unaccepted_parent_rejected() {
        let set = accepted(&["tempy.email"]);
        assert!(!is_domain_accepted("abc.evil.com", &set));
    }

    #[test]
    fn empty_domain_rejected() {
        let set = accepted(&["tempy.email"]);
        assert!(!is_domain_accepted("", &set));
    }

    #[test]
    fn no_tld_requires_exact_match() {
        let set = accepted(&["localhost"]);
        assert!(is_domain_accepted("localhost", &set));
        assert!(!is_domain_accepted("notlocalhost", &set));
    }

    #[test]
    fn only_one_level_of_subdomain_is_checked() {
        let set = accepted(&["tempy.email"]);
        // Stripping one label from "a.b.tempy.email" gives "b.tempy.email",
        // which is not itself accepted — two levels down is rejected.
        assert!(!is_domain_accepted("a.b.tempy.email", &set));
        assert!(is_domain_accepted("b.tempy.email", &set));
    }

    #[test]
    fn case_sensitive() {
        let set = accepted(&["tempy.email"]);
        assert!(!is_domain_accepted("TEMPY.EMAIL", &set));
    }
}
