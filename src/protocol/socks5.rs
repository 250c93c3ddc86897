//! SOCKS5 wire constants and request parsers.
//!
//! The RFC 1928 / RFC 1929 subset the user-facing side speaks: method
//! negotiation limited to USERNAME/PASSWORD, commands limited to CONNECT,
//! ATYP IPv4/DOMAIN/IPv6. Every parser buffers incomplete input — it
//! consumes bytes only once a complete message is present, so a user
//! trickling one byte at a time is never treated as a protocol error.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

/// SOCKS protocol version.
pub const VERSION: u8 = 0x05;

/// Username/password subnegotiation version (RFC 1929).
pub const AUTH_VERSION: u8 = 0x01;

/// Username/password authentication method.
pub const METHOD_USERNAME_PASSWORD: u8 = 0x02;

/// No acceptable authentication method.
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Authentication succeeded.
pub const AUTH_SUCCESS: u8 = 0x00;

/// Authentication failed.
pub const AUTH_FAILURE: u8 = 0x01;

/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;

/// IPv4 address type.
pub const ATYP_IPV4: u8 = 0x01;

/// Domain-name address type.
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address type.
pub const ATYP_IPV6: u8 = 0x04;

/// Request succeeded.
pub const REP_SUCCEEDED: u8 = 0x00;

/// General SOCKS server failure.
pub const REP_GENERAL_FAILURE: u8 = 0x01;

/// Command not supported.
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Address type not supported.
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Parse the method-selection message (`VER NMETHODS METHODS…`).
///
/// Returns `Ok(None)` while incomplete, otherwise whether the client
/// offered USERNAME/PASSWORD. A non-SOCKS5 version byte is fatal.
pub fn parse_method_selection(buf: &mut BytesMut) -> Result<Option<bool>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(Error::socks(format!("unsupported version: {}", buf[0])));
    }
    let n_methods = buf[1] as usize;
    if buf.len() < 2 + n_methods {
        return Ok(None);
    }
    let has_userpass = buf[2..2 + n_methods].contains(&METHOD_USERNAME_PASSWORD);
    buf.advance(2 + n_methods);
    Ok(Some(has_userpass))
}

/// A parsed RFC 1929 username/password request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Interpreted as the target client key.
    pub username: String,
    /// Compared against the server-wide shared secret.
    pub password: String,
}

/// Parse the username/password subnegotiation
/// (`VER ULEN UNAME PLEN PASSWD`). Length bytes are unsigned.
pub fn parse_auth_request(buf: &mut BytesMut) -> Result<Option<AuthRequest>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != AUTH_VERSION {
        return Err(Error::socks(format!(
            "unsupported auth version: {}",
            buf[0]
        )));
    }
    let ulen = buf[1] as usize;
    if buf.len() < 2 + ulen + 1 {
        return Ok(None);
    }
    let plen = buf[2 + ulen] as usize;
    if buf.len() < 3 + ulen + plen {
        return Ok(None);
    }

    let username = String::from_utf8_lossy(&buf[2..2 + ulen]).into_owned();
    let password = String::from_utf8_lossy(&buf[3 + ulen..3 + ulen + plen]).into_owned();
    buf.advance(3 + ulen + plen);
    Ok(Some(AuthRequest { username, password }))
}

/// Outcome of parsing a SOCKS5 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectRequest {
    /// A CONNECT to `host:port`.
    Target {
        /// Dotted IPv4, bare IPv6, or domain name
        host: String,
        /// Target port
        port: u16,
    },
    /// The request must be refused with this reply code, then the
    /// connection closed (BIND/UDP → 0x07, unknown ATYP → 0x08).
    Refused(u8),
}

/// Parse the request message (`VER CMD RSV ATYP DST.ADDR DST.PORT`).
pub fn parse_connect_request(buf: &mut BytesMut) -> Result<Option<ConnectRequest>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let ver = buf[0];
    let cmd = buf[1];
    let atyp = buf[3];

    if ver != VERSION || cmd != CMD_CONNECT {
        return Ok(Some(ConnectRequest::Refused(REP_COMMAND_NOT_SUPPORTED)));
    }

    let (host, addr_end) = match atyp {
        ATYP_IPV4 => {
            if buf.len() < 4 + 4 + 2 {
                return Ok(None);
            }
            let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
            (ip.to_string(), 8)
        }
        ATYP_DOMAIN => {
            if buf.len() < 5 {
                return Ok(None);
            }
            let domain_len = buf[4] as usize;
            if buf.len() < 5 + domain_len + 2 {
                return Ok(None);
            }
            let domain = String::from_utf8_lossy(&buf[5..5 + domain_len]).into_owned();
            (domain, 5 + domain_len)
        }
        ATYP_IPV6 => {
            if buf.len() < 4 + 16 + 2 {
                return Ok(None);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[4..20]);
            (Ipv6Addr::from(octets).to_string(), 20)
        }
        _ => {
            return Ok(Some(ConnectRequest::Refused(
                REP_ADDRESS_TYPE_NOT_SUPPORTED,
            )));
        }
    };

    let port = u16::from_be_bytes([buf[addr_end], buf[addr_end + 1]]);
    buf.advance(addr_end + 2);
    Ok(Some(ConnectRequest::Target { host, port }))
}

/// Build a reply to the CONNECT request.
///
/// The bind address is always `0.0.0.0:0` — the real outbound socket
/// lives at the remote client, not at this server, which RFC 1928 permits.
pub fn connect_reply(rep: u8) -> [u8; 10] {
    [VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_selection() {
        let mut buf = BytesMut::from(&[0x05, 0x02, 0x00, 0x02][..]);
        assert_eq!(parse_method_selection(&mut buf).unwrap(), Some(true));
        assert!(buf.is_empty());

        let mut buf = BytesMut::from(&[0x05, 0x01, 0x00][..]);
        assert_eq!(parse_method_selection(&mut buf).unwrap(), Some(false));
    }

    #[test]
    fn test_method_selection_incomplete() {
        let mut buf = BytesMut::from(&[0x05][..]);
        assert_eq!(parse_method_selection(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 1);

        let mut buf = BytesMut::from(&[0x05, 0x03, 0x00, 0x02][..]);
        assert_eq!(parse_method_selection(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_method_selection_bad_version() {
        let mut buf = BytesMut::from(&[0x04, 0x01, 0x00][..]);
        assert!(parse_method_selection(&mut buf).is_err());
    }

    #[test]
    fn test_auth_request() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 0x06]);
        buf.extend_from_slice(b"ZC-ABC");
        buf.extend_from_slice(&[0x05]);
        buf.extend_from_slice(b"11111");

        let req = parse_auth_request(&mut buf).unwrap().unwrap();
        assert_eq!(req.username, "ZC-ABC");
        assert_eq!(req.password, "11111");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_auth_request_incomplete_at_each_boundary() {
        let mut full = Vec::new();
        full.extend_from_slice(&[0x01, 0x06]);
        full.extend_from_slice(b"ZC-ABC");
        full.extend_from_slice(&[0x05]);
        full.extend_from_slice(b"11111");

        for cut in 0..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(parse_auth_request(&mut buf).unwrap(), None, "cut at {cut}");
            assert_eq!(buf.len(), cut, "nothing consumed at cut {cut}");
        }
    }

    #[test]
    fn test_auth_request_long_username_unsigned() {
        // 200 > 127: a signed read of ULEN would reject this.
        let uname = "u".repeat(200);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x01, 200]);
        buf.extend_from_slice(uname.as_bytes());
        buf.extend_from_slice(&[0x02]);
        buf.extend_from_slice(b"pw");

        let req = parse_auth_request(&mut buf).unwrap().unwrap();
        assert_eq!(req.username, uname);
        assert_eq!(req.password, "pw");
    }

    #[test]
    fn test_connect_ipv4() {
        let mut buf = BytesMut::from(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50][..]);
        let req = parse_connect_request(&mut buf).unwrap().unwrap();
        assert_eq!(
            req,
            ConnectRequest::Target {
                host: "127.0.0.1".into(),
                port: 80
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_connect_domain() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 11]);
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&443u16.to_be_bytes());

        let req = parse_connect_request(&mut buf).unwrap().unwrap();
        assert_eq!(
            req,
            ConnectRequest::Target {
                host: "example.com".into(),
                port: 443
            }
        );
    }

    #[test]
    fn test_connect_max_domain() {
        let domain = "d".repeat(255);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 255]);
        buf.extend_from_slice(domain.as_bytes());
        buf.extend_from_slice(&80u16.to_be_bytes());

        let req = parse_connect_request(&mut buf).unwrap().unwrap();
        assert_eq!(
            req,
            ConnectRequest::Target {
                host: domain,
                port: 80
            }
        );
    }

    #[test]
    fn test_connect_ipv6() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x05, 0x01, 0x00, 0x04]);
        buf.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        buf.extend_from_slice(&8080u16.to_be_bytes());

        let req = parse_connect_request(&mut buf).unwrap().unwrap();
        assert_eq!(
            req,
            ConnectRequest::Target {
                host: "::1".into(),
                port: 8080
            }
        );
    }

    #[test]
    fn test_connect_incomplete() {
        // Header only, domain length byte missing.
        let mut buf = BytesMut::from(&[0x05, 0x01, 0x00, 0x03][..]);
        assert_eq!(parse_connect_request(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 4);

        // Domain present but port truncated.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, 3]);
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&[0x00]);
        assert_eq!(parse_connect_request(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_connect_refusals() {
        // BIND
        let mut buf = BytesMut::from(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80][..]);
        assert_eq!(
            parse_connect_request(&mut buf).unwrap(),
            Some(ConnectRequest::Refused(REP_COMMAND_NOT_SUPPORTED))
        );

        // UDP ASSOCIATE
        let mut buf = BytesMut::from(&[0x05, 0x03, 0x00, 0x01, 1, 2, 3, 4, 0, 80][..]);
        assert_eq!(
            parse_connect_request(&mut buf).unwrap(),
            Some(ConnectRequest::Refused(REP_COMMAND_NOT_SUPPORTED))
        );

        // Unknown ATYP
        let mut buf = BytesMut::from(&[0x05, 0x01, 0x00, 0x05, 0, 0][..]);
        assert_eq!(
            parse_connect_request(&mut buf).unwrap(),
            Some(ConnectRequest::Refused(REP_ADDRESS_TYPE_NOT_SUPPORTED))
        );
    }

    #[test]
    fn test_connect_reply_shape() {
        assert_eq!(
            connect_reply(REP_SUCCEEDED),
            [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }
}
