//! Address and parameter parsing (spec.md §4.2).
//!
//! Grounded on the teacher's `extract_address` (angle-bracket form) in
//! `session.rs`, generalized to the bare addr-spec form and to ESMTP
//! parameter parsing per aiosmtpd's `_getaddr`/`_getparams`.

use std::collections::HashMap;

use crate::error::ParamError;

/// A parsed ESMTP parameter value: either a bare flag (`KEY`) or an
/// assignment (`KEY=VALUE`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Flag,
    Value(String),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Value(v) => Some(v),
            ParamValue::Flag => None,
        }
    }
}

/// Strip a leading `keyword:` (case-insensitive) from `arg`, as used by
/// `MAIL FROM:` / `RCPT TO:`. Returns `None` if `arg` does not start with
/// `keyword`.
pub fn strip_keyword<'a>(keyword: &str, arg: &'a str) -> Option<&'a str> {
    let len = keyword.len();
    if arg.len() >= len && arg[..len].eq_ignore_ascii_case(keyword) {
        Some(arg[len..].trim_start())
    } else {
        None
    }
}

/// Parse a mailbox from `<angle-addr>` or a bare addr-spec, tolerating
/// surrounding whitespace. Returns `(mailbox, remainder)` where `remainder`
/// is whatever trailed the address (ESMTP parameters).
///
/// An empty angle-bracket pair (`<>`, the null reverse-path) parses to an
/// empty mailbox string, which is valid for `MAIL FROM:<>`.
pub fn parse_mailbox(arg: &str) -> Option<(String, &str)> {
    let trimmed = arg.trim_start();
    if trimmed.starts_with('<') {
        let end = trimmed.find('>')?;
        let mailbox = trimmed[1..end].to_string();
        let remainder = trimmed[end + 1..].trim_start();
        Some((mailbox, remainder))
    } else {
        // Bare addr-spec: runs until the first whitespace.
        let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        if end == 0 {
            return None;
        }
        let mailbox = trimmed[..end].to_string();
        let remainder = trimmed[end..].trim_start();
        Some((mailbox, remainder))
    }
}

/// Parse an ESMTP parameter remainder (e.g. `SIZE=1024 BODY=8BITMIME`) into
/// a `KEY -> value` map. Keys must be alphanumeric; a malformed pair (an
/// `=` with nothing after it) fails the whole parse.
pub fn parse_params(remainder: &str) -> Result<HashMap<String, ParamValue>, ParamError> {
    let mut result = HashMap::new();
    for token in remainder.split_whitespace() {
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ParamError::Malformed);
        }
        match value {
            Some(v) if v.is_empty() => return Err(ParamError::Malformed),
            Some(v) => {
                result.insert(key.to_ascii_uppercase(), ParamValue::Value(v.to_string()));
            }
            None => {
                result.insert(key.to_ascii_uppercase(), ParamValue::Flag);
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_keyword_case_insensitive() {
        assert_eq!(strip_keyword("FROM:", "from:<a@b>"), Some("<a@b>"));
        assert_eq!(strip_keyword("TO:", "from:<a@b>"), None);
    }

    #[test]
    fn parse_mailbox_angle_form() {
        let (mailbox, rest) = parse_mailbox("<user@example.com> SIZE=10").unwrap();
        assert_eq!(mailbox, "user@example.com");
        assert_eq!(rest, "SIZE=10");
    }

    #[test]
    fn parse_mailbox_null_reverse_path() {
        let (mailbox, rest) = parse_mailbox("<>").unwrap();
        assert_eq!(mailbox, "");
        assert_eq!(rest, "");
    }

    #[test]
    fn parse_mailbox_bare_addr_spec() {
        let (mailbox, rest) = parse_mailbox("user@example.com SIZE=10").unwrap();
        assert_eq!(mailbox, "user@example.com");
        assert_eq!(rest, "SIZE=10");
    }

    #[test]
    fn parse_params_flags_and_values() {
        let params = parse_params("SIZE=1024 SMTPUTF8").unwrap();
        assert_eq!(
            params.get("SIZE"),
            Some(&ParamValue::Value("1024".to_string()))
        );
        assert_eq!(params.get("SMTPUTF8"), Some(&ParamValue::Flag));
    }

    #[test]
    fn parse_params_rejects_empty_value() {
        assert_eq!(parse_params("SIZE=").unwrap_err(), ParamError::Malformed);
    }

    #[test]
    fn parse_params_rejects_non_alnum_key() {
        assert_eq!(
            parse_params("SI-ZE=1024").unwrap_err(),
            ParamError::Malformed
        );
    }

    #[test]
    fn parse_params_empty_remainder() {
        assert!(parse_params("").unwrap().is_empty());
    }
}
