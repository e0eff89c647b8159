use std::collections::HashSet;

use smtpd_core::address::{parse_mailbox, parse_params, strip_keyword};
use smtpd_core::demo_handler::is_domain_accepted;

// -- strip_keyword / parse_mailbox (MAIL FROM: / RCPT TO: framing) --

#[test]
fn strip_keyword_then_parse_mailbox_from() {
    let rest = strip_keyword("FROM:", "FROM:<sender@example.com> SIZE=1024").unwrap();
    let (mailbox, remainder) = parse_mailbox(rest).unwrap();
    assert_eq!(mailbox, "sender@example.com");
    assert_eq!(remainder, "SIZE=1024");
}

#[test]
fn strip_keyword_then_parse_mailbox_to() {
    let rest = strip_keyword("TO:", "TO:<recipient@domain.org>").unwrap();
    let (mailbox, remainder) = parse_mailbox(rest).unwrap();
    assert_eq!(mailbox, "recipient@domain.org");
    assert_eq!(remainder, "");
}

#[test]
fn null_reverse_path_has_empty_mailbox() {
    let rest = strip_keyword("FROM:", "FROM:<>").unwrap();
    let (mailbox, _) = parse_mailbox(rest).unwrap();
    assert_eq!(mailbox, "");
}

#[test]
fn wrong_keyword_does_not_strip() {
    assert!(strip_keyword("TO:", "FROM:<a@b>").is_none());
}

#[test]
fn bare_addr_spec_without_brackets() {
    let rest = strip_keyword("TO:", "TO:postmaster").unwrap();
    let (mailbox, _) = parse_mailbox(rest).unwrap();
    assert_eq!(mailbox, "postmaster");
}

#[test]
fn missing_opening_bracket_falls_back_to_bare_addr_spec() {
    let rest = strip_keyword("TO:", "TO:>user@example.com<").unwrap();
    // No leading '<', so the whole token is read as a bare addr-spec.
    let (mailbox, _) = parse_mailbox(rest).unwrap();
    assert_eq!(mailbox, ">user@example.com<");
}

#[test]
fn params_parsed_after_mailbox() {
    let rest = strip_keyword("FROM:", "FROM:<sender@example.com> SIZE=1024 SMTPUTF8").unwrap();
    let (_, remainder) = parse_mailbox(rest).unwrap();
    let params = parse_params(remainder).unwrap();
    assert_eq!(params.len(), 2);
}

// -- is_domain_accepted --

fn make_domains(domains: &[&str]) -> HashSet<String> {
    domains.iter().map(|s| s.to_string()).collect()
}

#[test]
fn domain_exact_match() {
    let domains = make_domains(&["tempy.email", "example.com"]);
    assert!(is_domain_accepted("tempy.email", &domains));
    assert!(is_domain_accepted("example.com", &domains));
}

#[test]
fn domain_not_accepted() {
    let domains = make_domains(&["tempy.email"]);
    assert!(!is_domain_accepted("evil.com", &domains));
    assert!(!is_domain_accepted("nottempy.email", &domains));
}

#[test]
fn subdomain_match() {
    let domains = make_domains(&["tempy.email"]);
    assert!(is_domain_accepted("abc123.tempy.email", &domains));
    assert!(is_domain_accepted("sub.tempy.email", &domains));
}

#[test]
fn subdomain_no_match_different_parent() {
    let domains = make_domains(&["tempy.email"]);
    assert!(!is_domain_accepted("abc.evil.com", &domains));
}

#[test]
fn domain_empty() {
    let domains = make_domains(&["tempy.email"]);
    assert!(!is_domain_accepted("", &domains));
}

#[test]
fn domain_no_tld() {
    let domains = make_domains(&["localhost"]);
    assert!(is_domain_accepted("localhost", &domains));
    assert!(!is_domain_accepted("notlocalhost", &domains));
}

#[test]
fn deep_subdomain_no_match() {
    let domains = make_domains(&["tempy.email"]);
    assert!(!is_domain_accepted("a.b.tempy.email", &domains));
    assert!(is_domain_accepted("b.tempy.email", &domains));
}

#[test]
fn domain_case_sensitivity() {
    let domains = make_domains(&["tempy.email"]);
    assert!(is_domain_accepted("tempy.email", &domains));
    assert!(!is_domain_accepted("TEMPY.EMAIL", &domains));
}

#[test]
fn multiple_domains() {
    let domains = make_domains(&["tempy.email", "jsondb.net", "getemail.live", "mailtemp.xyz"]);
    assert!(is_domain_accepted("tempy.email", &domains));
    assert!(is_domain_accepted("jsondb.net", &domains));
    assert!(is_domain_accepted("getemail.live", &domains));
    assert!(is_domain_accepted("mailtemp.xyz", &domains));
    assert!(is_domain_accepted("sub.tempy.email", &domains));
    assert!(!is_domain_accepted("evil.com", &domains));
}
