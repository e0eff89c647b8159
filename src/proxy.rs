//! HAProxy PROXY-protocol preamble, v1 (text) and v2 (binary) (spec.md §4.6).
//!
//! Grounded on `examples/original_source/aiosmtpd/proxy_protocol.py`. Per
//! spec.md §9 REDESIGN FLAGS item 2, the v2 signature check here is a
//! strict 12-byte comparison against the literal magic bytes — the
//! source's `header[16:0]` slice and `signature != "..."` byte/string
//! comparison are bugs in the original and are not reproduced.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use arrayvec::ArrayVec;
use tokio::io::{AsyncReadExt, BufReader};

use crate::error::ProxyError;

const V1_MAX_LEN: usize = 107;
const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\x00\r\nQUIT\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    Local,
    Proxy,
}

#[derive(Debug, Clone)]
pub enum ProxyAddress {
    Tcp4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
    },
    Tcp6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        src_port: u16,
        dst_port: u16,
    },
    Unix {
        src: Vec<u8>,
        dst: Vec<u8>,
    },
    /// `UNKNOWN` (v1) or an unrecognized family/protocol combination (v2);
    /// the remainder is recorded opaquely.
    Unknown(Vec<u8>),
}

/// Parsed PROXY-protocol preamble, handed to `Handler::handle_proxy`.
#[derive(Debug, Clone)]
pub struct ProxyData {
    pub version: u8,
    pub command: ProxyCommand,
    pub address: ProxyAddress,
}

/// Read and validate the PROXY-protocol preamble, bounded by `timeout`.
pub async fn read_preamble<R>(
    reader: &mut BufReader<R>,
    timeout: Duration,
) -> Result<ProxyData, ProxyError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_preamble_inner(reader))
        .await
        .map_err(|_| ProxyError::Timeout)?
}

async fn read_preamble_inner<R>(reader: &mut BufReader<R>) -> Result<ProxyData, ProxyError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut signature = [0u8; 5];
    reader.read_exact(&mut signature).await?;

    if &signature == b"PROXY" {
        read_v1(reader).await
    } else if signature == *b"\r\n\r\n\x00" {
        read_v2(reader, &signature).await
    } else {
        Err(ProxyError::UnrecognizedSignature)
    }
}

async fn read_v1<R>(reader: &mut BufReader<R>) -> Result<ProxyData, ProxyError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    // "PROXY" already consumed; collect the remainder of the line, capped
    // at V1_MAX_LEN total bytes including "PROXY".
    let mut line: ArrayVec<u8, V1_MAX_LEN> = ArrayVec::new();
    line.try_extend_from_slice(b"PROXY")
        .map_err(|_| ProxyError::Malformed("PROXYv1 too long"))?;
    loop {
        let byte = reader.read_u8().await?;
        line.try_push(byte)
            .map_err(|_| ProxyError::Malformed("PROXYv1 too long"))?;
        if line.ends_with(b"\r\n") {
            break;
        }
    }

    let text = std::str::from_utf8(&line).map_err(|_| ProxyError::Malformed("PROXYv1 not ASCII"))?;
    let rest = text
        .strip_prefix("PROXY ")
        .ok_or(ProxyError::Malformed("PROXYv1 malformed"))?;
    let rest = rest
        .strip_suffix("\r\n")
        .ok_or(ProxyError::Malformed("PROXYv1 malformed"))?;

    if let Some(unknown_rest) = rest.strip_prefix("UNKNOWN") {
        return Ok(ProxyData {
            version: 1,
            command: ProxyCommand::Proxy,
            address: ProxyAddress::Unknown(unknown_rest.as_bytes().to_vec()),
        });
    }

    let (family, fields) = if let Some(f) = rest.strip_prefix("TCP4 ") {
        (4u8, f)
    } else if let Some(f) = rest.strip_prefix("TCP6 ") {
        (6u8, f)
    } else {
        return Err(ProxyError::Malformed("PROXYv1 unknown protocol"));
    };

    let parts: Vec<&str> = fields.split(' ').collect();
    let [src_raw, dst_raw, src_port_raw, dst_port_raw] = parts[..] else {
        return Err(ProxyError::Malformed("PROXYv1 malformed"));
    };

    let src_ip: std::net::IpAddr = src_raw
        .parse()
        .map_err(|_| ProxyError::Malformed("PROXYv1 malformed"))?;
    let dst_ip: std::net::IpAddr = dst_raw
        .parse()
        .map_err(|_| ProxyError::Malformed("PROXYv1 malformed"))?;
    let src_port = parse_v1_port(src_port_raw)?;
    let dst_port = parse_v1_port(dst_port_raw)?;

    let address = match (family, src_ip, dst_ip) {
        (4, std::net::IpAddr::V4(src), std::net::IpAddr::V4(dst)) => ProxyAddress::Tcp4 {
            src,
            dst,
            src_port,
            dst_port,
        },
        (6, std::net::IpAddr::V6(src), std::net::IpAddr::V6(dst)) => ProxyAddress::Tcp6 {
            src,
            dst,
            src_port,
            dst_port,
        },
        _ => return Err(ProxyError::Malformed("PROXYv1 address type mismatch")),
    };

    Ok(ProxyData {
        version: 1,
        command: ProxyCommand::Proxy,
        address,
    })
}

fn parse_v1_port(raw: &str) -> Result<u16, ProxyError> {
    // digits, no leading zero unless the value is exactly "0".
    if raw.is_empty() || (raw.len() > 1 && raw.starts_with('0')) || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProxyError::Malformed("PROXYv1 malformed"));
    }
    raw.parse::<u32>()
        .ok()
        .filter(|p| *p <= 65535)
        .map(|p| p as u16)
        .ok_or(ProxyError::Malformed("PROXYv1 port out of bounds"))
}

async fn read_v2<R>(reader: &mut BufReader<R>, initial: &[u8; 5]) -> Result<ProxyData, ProxyError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; 16];
    header[..5].copy_from_slice(initial);
    reader.read_exact(&mut header[5..]).await?;

    if header[..12] != V2_SIGNATURE {
        return Err(ProxyError::Malformed("PROXYv2 wrong signature"));
    }

    let ver_cmd = header[12];
    let fam_proto = header[13];
    let len = u16::from_be_bytes([header[14], header[15]]) as usize;

    if (ver_cmd & 0xF0) != 0x20 {
        return Err(ProxyError::Malformed("PROXYv2 illegal version"));
    }
    let command = match ver_cmd & 0x0F {
        0 => ProxyCommand::Local,
        1 => ProxyCommand::Proxy,
        _ => return Err(ProxyError::Malformed("PROXYv2 unsupported command")),
    };

    let family = (fam_proto & 0xF0) >> 4;
    if !matches!(family, 0 | 1 | 2 | 3) {
        return Err(ProxyError::Malformed("PROXYv2 unsupported family"));
    }
    let protocol = fam_proto & 0x0F;
    if !matches!(protocol, 0 | 1 | 2) {
        return Err(ProxyError::Malformed("PROXYv2 unsupported protocol"));
    }

    let mut rest = vec![0u8; len];
    reader.read_exact(&mut rest).await?;

    let address = match (family, fam_proto) {
        (1, 0x11) | (1, 0x12) => {
            if rest.len() < 12 {
                return Err(ProxyError::Malformed("PROXYv2 short address block"));
            }
            let src = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let dst = Ipv4Addr::new(rest[4], rest[5], rest[6], rest[7]);
            let src_port = u16::from_be_bytes([rest[8], rest[9]]);
            let dst_port = u16::from_be_bytes([rest[10], rest[11]]);
            ProxyAddress::Tcp4 {
                src,
                dst,
                src_port,
                dst_port,
            }
        }
        (2, 0x21) | (2, 0x22) => {
            if rest.len() < 36 {
                return Err(ProxyError::Malformed("PROXYv2 short address block"));
            }
            let src = Ipv6Addr::from(<[u8; 16]>::try_from(&rest[0..16]).unwrap());
            let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&rest[16..32]).unwrap());
            let src_port = u16::from_be_bytes([rest[32], rest[33]]);
            let dst_port = u16::from_be_bytes([rest[34], rest[35]]);
            ProxyAddress::Tcp6 {
                src,
                dst,
                src_port,
                dst_port,
            }
        }
        (3, 0x31) | (3, 0x32) => {
            if rest.len() < 216 {
                return Err(ProxyError::Malformed("PROXYv2 short address block"));
            }
            ProxyAddress::Unix {
                src: rest[0..108].to_vec(),
                dst: rest[108..216].to_vec(),
            }
        }
        _ => ProxyAddress::Unknown(rest),
    };

    Ok(ProxyData {
        version: 2,
        command,
        address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn long_timeout() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn v1_tcp4_parses() {
        let input = b"PROXY TCP4 1.2.3.4 5.6.7.8 65535 65535\r\n";
        let mut reader = BufReader::new(&input[..]);
        let data = read_preamble(&mut reader, long_timeout()).await.unwrap();
        assert_eq!(data.version, 1);
        match data.address {
            ProxyAddress::Tcp4 {
                src,
                dst,
                src_port,
                dst_port,
            } => {
                assert_eq!(src, Ipv4Addr::new(1, 2, 3, 4));
                assert_eq!(dst, Ipv4Addr::new(5, 6, 7, 8));
                assert_eq!(src_port, 65535);
                assert_eq!(dst_port, 65535);
            }
            other => panic!("unexpected address: {other:?}"),
        }
    }

    #[tokio::test]
    async fn v1_unknown_mode() {
        let input = b"PROXY UNKNOWN\r\n";
        let mut reader = BufReader::new(&input[..]);
        let data = read_preamble(&mut reader, long_timeout()).await.unwrap();
        assert!(matches!(data.address, ProxyAddress::Unknown(_)));
    }

    #[tokio::test]
    async fn v1_family_mismatch_aborts() {
        // TCP4 keyword but an IPv6 source address.
        let input = b"PROXY TCP4 ::1 5.6.7.8 1 1\r\n";
        let mut reader = BufReader::new(&input[..]);
        let err = read_preamble(&mut reader, long_timeout()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Malformed(_)));
    }

    #[tokio::test]
    async fn v1_too_long_aborts() {
        let mut input = b"PROXY TCP4 ".to_vec();
        input.extend(std::iter::repeat(b'1').take(200));
        input.extend_from_slice(b"\r\n");
        let mut reader = BufReader::new(&input[..]);
        let err = read_preamble(&mut reader, long_timeout()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Malformed(_)));
    }

    #[tokio::test]
    async fn v2_tcp4_parses() {
        let mut input = Vec::new();
        input.extend_from_slice(&V2_SIGNATURE);
        input.push(0x21); // version 2, command PROXY
        input.push(0x11); // family IP4, protocol STREAM
        input.extend_from_slice(&12u16.to_be_bytes());
        input.extend_from_slice(&[10, 0, 0, 1]);
        input.extend_from_slice(&[10, 0, 0, 2]);
        input.extend_from_slice(&1234u16.to_be_bytes());
        input.extend_from_slice(&443u16.to_be_bytes());

        let mut reader = BufReader::new(&input[..]);
        let data = read_preamble(&mut reader, long_timeout()).await.unwrap();
        assert_eq!(data.version, 2);
        assert_eq!(data.command, ProxyCommand::Proxy);
        match data.address {
            ProxyAddress::Tcp4 {
                src,
                dst,
                src_port,
                dst_port,
            } => {
                assert_eq!(src, Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(dst, Ipv4Addr::new(10, 0, 0, 2));
                assert_eq!(src_port, 1234);
                assert_eq!(dst_port, 443);
            }
            other => panic!("unexpected address: {other:?}"),
        }
    }

    #[tokio::test]
    async fn v2_wrong_signature_aborts() {
        let mut input = vec![0u8; 16];
        input[0] = b'X';
        let mut reader = BufReader::new(&input[..]);
        let err = read_preamble(&mut reader, long_timeout()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Malformed(_)) || matches!(err, ProxyError::UnrecognizedSignature));
    }

    #[tokio::test]
    async fn unrecognized_signature_aborts() {
        let input = b"GARBAGE!!!!";
        let mut reader = BufReader::new(&input[..]);
        let err = read_preamble(&mut reader, long_timeout()).await.unwrap_err();
        assert!(matches!(err, ProxyError::UnrecognizedSignature));
    }
}
