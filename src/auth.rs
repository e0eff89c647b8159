//! SASL AUTH sub-protocol: PLAIN and LOGIN (spec.md §4.4).
//!
//! Grounded on `examples/original_source/aiosmtpd/smtp.py`
//! (`smtp_AUTH`/`auth_PLAIN`/`auth_LOGIN`/`_auth_interact`); not present in
//! the teacher. The credential-check callback is a plain `Fn` rather than
//! async, matching spec.md §4.4's synchronous boolean signature.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncWrite, BufReader};

use crate::error::AuthError;
use crate::line::read_command_line;
use crate::session::COMMAND_SIZE_LIMIT;

/// `(mechanism, login, password) -> accepted`. Must be safe to call from
/// any connection's task (spec.md §5).
pub type AuthCallback = Arc<dyn Fn(&str, &[u8], &[u8]) -> bool + Send + Sync>;

/// Default callback: always refuses, per spec.md §4.4.
pub fn always_refuse() -> AuthCallback {
    Arc::new(|_, _, _| false)
}

/// Outcome of a completed AUTH sub-dialog that didn't already push its own
/// error reply.
pub enum AuthOutcome {
    Success(Vec<u8>),
    Invalid,
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

/// One `334 <prompt>` / read-response round of the AUTH interaction.
/// Returns `Ok(None)` for the `=` (empty value) convention, `Ok(Some(blob))`
/// for a decoded response, or `Err` (reply already sent) for abort/bad
/// base64/disconnection.
async fn interact<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    prompt: &str,
) -> Result<Option<Vec<u8>>, AuthError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_line(writer, prompt).await?;
    let line = read_command_line(reader, COMMAND_SIZE_LIMIT)
        .await
        .map_err(|_| AuthError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof")))?
        .ok_or_else(|| AuthError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof")))?;
    let blob = trim_bytes(&line);
    if blob == b"=" {
        return Ok(None);
    }
    if blob == b"*" {
        send_line(writer, "501 Auth aborted").await?;
        return Err(AuthError::Aborted);
    }
    match BASE64.decode(blob) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(_) => {
            send_line(writer, "501 5.5.2 Can't decode base64").await?;
            Err(AuthError::BadBase64)
        }
    }
}

fn trim_bytes(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(b.len());
    let end = b.iter().rposition(|c| !c.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &b[start..end]
}

/// `AUTH PLAIN [initial-response]`.
pub async fn run_plain<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    initial_response: Option<&str>,
    callback: &AuthCallback,
) -> Result<AuthOutcome, AuthError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let blob = match initial_response {
        // Trailing space after "334" is mandatory per RFC 4954.
        None => interact(reader, writer, "334 ").await?,
        Some("=") => None,
        Some(resp) => match BASE64.decode(resp.as_bytes()) {
            Ok(decoded) => Some(decoded),
            Err(_) => {
                send_line(writer, "501 5.5.2 Can't decode base64").await?;
                return Err(AuthError::BadBase64);
            }
        },
    };

    let (login, password) = match blob {
        None => (None, None),
        Some(blob) => {
            let parts: Vec<&[u8]> = blob.split(|b| *b == 0).collect();
            if parts.len() != 3 {
                send_line(writer, "501 5.5.2 Can't split auth value").await?;
                return Err(AuthError::BadShape);
            }
            (Some(parts[1].to_vec()), Some(parts[2].to_vec()))
        }
    };

    let login_bytes = login.clone().unwrap_or_default();
    let password_bytes = password.unwrap_or_default();
    if callback("PLAIN", &login_bytes, &password_bytes) {
        Ok(AuthOutcome::Success(login.unwrap_or_default()))
    } else {
        Ok(AuthOutcome::Invalid)
    }
}

/// `AUTH LOGIN`.
pub async fn run_login<R, W>(
    reader: &mut BufReader<R>,
    writer: &mut W,
    callback: &AuthCallback,
) -> Result<AuthOutcome, AuthError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // base64("User Name\0")
    let login = interact(reader, writer, "334 VXNlciBOYW1lAA==").await?;
    // base64("Password\0")
    let password = interact(reader, writer, "334 UGFzc3dvcmQA").await?;

    let login_bytes = login.clone().unwrap_or_default();
    let password_bytes = password.unwrap_or_default();
    if callback("LOGIN", &login_bytes, &password_bytes) {
        Ok(AuthOutcome::Success(login.unwrap_or_default()))
    } else {
        Ok(AuthOutcome::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept_user_pass() -> AuthCallback {
        Arc::new(|mechanism, login, password| {
            mechanism != "" && login == b"user" && password == b"pass"
        })
    }

    #[tokio::test]
    async fn plain_with_initial_response_succeeds() {
        let input: &[u8] = b"";
        let mut reader = BufReader::new(input);
        let mut writer = Vec::new();
        let initial = base64::engine::general_purpose::STANDARD.encode(b"\x00user\x00pass");
        let outcome = run_plain(&mut reader, &mut writer, Some(&initial), &accept_user_pass())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Success(ref id) if id.as_slice() == b"user"));
    }

    #[tokio::test]
    async fn plain_interactive_prompts_then_reads() {
        let blob = base64::engine::general_purpose::STANDARD.encode(b"\x00user\x00pass");
        let input = format!("{blob}\r\n");
        let mut reader = BufReader::new(input.as_bytes());
        let mut writer = Vec::new();
        let outcome = run_plain(&mut reader, &mut writer, None, &accept_user_pass())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Success(_)));
        assert!(String::from_utf8_lossy(&writer).starts_with("334 "));
    }

    #[tokio::test]
    async fn plain_bad_shape_rejected() {
        let blob = base64::engine::general_purpose::STANDARD.encode(b"justoneword");
        let input = format!("{blob}\r\n");
        let mut reader = BufReader::new(input.as_bytes());
        let mut writer = Vec::new();
        let err = run_plain(&mut reader, &mut writer, None, &accept_user_pass())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::BadShape));
    }

    #[tokio::test]
    async fn plain_bad_base64_rejected() {
        let input = b"not-valid-base64!!!\r\n";
        let mut reader = BufReader::new(&input[..]);
        let mut writer = Vec::new();
        let err = run_plain(&mut reader, &mut writer, None, &accept_user_pass())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::BadBase64));
    }

    #[tokio::test]
    async fn abort_with_star() {
        let input = b"*\r\n";
        let mut reader = BufReader::new(&input[..]);
        let mut writer = Vec::new();
        let err = run_plain(&mut reader, &mut writer, None, &accept_user_pass())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Aborted));
    }

    #[tokio::test]
    async fn login_flow_success() {
        let login_b64 = base64::engine::general_purpose::STANDARD.encode(b"user");
        let pass_b64 = base64::engine::general_purpose::STANDARD.encode(b"pass");
        let input = format!("{login_b64}\r\n{pass_b64}\r\n");
        let mut reader = BufReader::new(input.as_bytes());
        let mut writer = Vec::new();
        let outcome = run_login(&mut reader, &mut writer, &accept_user_pass())
            .await
            .unwrap();
        assert!(matches!(outcome, AuthOutcome::Success(ref id) if id.as_slice() == b"user"));
    }

    #[tokio::test]
    async fn failed_credentials_report_invalid() {
        let reject = always_refuse();
        let login_b64 = base64::engine::general_purpose::STANDARD.encode(b"user");
        let pass_b64 = base64::engine::general_purpose::STANDARD.encode(b"pass");
        let input = format!("{login_b64}\r\n{pass_b64}\r\n");
        let mut reader = BufReader::new(input.as_bytes());
        let mut writer = Vec::new();
        let outcome = run_login(&mut reader, &mut writer, &reject).await.unwrap();
        assert!(matches!(outcome, AuthOutcome::Invalid));
    }

    #[tokio::test]
    async fn null_identity_via_equals() {
        let input = b"=\r\n=\r\n";
        let mut reader = BufReader::new(&input[..]);
        let mut writer = Vec::new();
        let cb: AuthCallback = Arc::new(|_, login, password| login.is_empty() && password.is_empty());
        let outcome = run_login(&mut reader, &mut writer, &cb).await.unwrap();
        assert!(matches!(outcome, AuthOutcome::Success(ref id) if id.is_empty()));
    }
}
