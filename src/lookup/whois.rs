use anyhow::{anyhow, bail, Result};
use encoding_rs::ISO_2022_JP;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::{IpAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

pub const WHOIS_HOST: &str = "whois.nic.ad.jp";
pub const WHOIS_PORT: u16 = 43;
/// literal recorded in the log header when the lookup fails
pub const LOOKUP_FAILED: &str = "取得失敗";

const TOKEN: Token = Token(0);
const WHOIS_TIMEOUT: Duration = Duration::from_secs(10);

/// Organization registered for `ip` per JPNIC whois.
pub fn organization(ip: &IpAddr) -> Result<String> {
    let text = query(ip)?;
    extract_organization(&text).ok_or_else(|| anyhow!("no [組織名] group for {}", ip))
}

/// Sends `<ip>\r\n` and reads to EOF. The response is ISO-2022-JP; decode
/// errors are ignored and the raw bytes never normalized further.
fn query(ip: &IpAddr) -> Result<String> {
    let addr = (WHOIS_HOST, WHOIS_PORT)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("{} did not resolve", WHOIS_HOST))?;
    let request = format!("{}\r\n", ip);

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(64);
    let mut stream = TcpStream::connect(addr)?;
    poll.registry()
        .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)?;

    let deadline = Instant::now() + WHOIS_TIMEOUT;
    let mut written = 0;
    let mut response = Vec::new();

    loop {
        let now = Instant::now();
        if now >= deadline {
            bail!("whois query for {} timed out", ip);
        }
        poll.poll(&mut events, Some((deadline - now).min(Duration::from_millis(500))))?;

        let mut readable = false;
        let mut writable = false;
        for event in events.iter() {
            if event.token() == TOKEN {
                readable |= event.is_readable();
                writable |= event.is_writable();
            }
        }

        if writable {
            if let Ok(Some(err)) = stream.take_error() {
                return Err(err.into());
            }
            let request = request.as_bytes();
            while written < request.len() {
                match stream.write(&request[written..]) {
                    Ok(n) => written += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if readable {
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        let (text, _, _) = ISO_2022_JP.decode(&response);
                        return Ok(text.into_owned());
                    }
                    Ok(n) => response.extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}

/// The group following the literal `[組織名]`, e.g.
/// `a. [組織名]   何某株式会社` → `何某株式会社`.
pub fn extract_organization(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(pos) = line.find("[組織名]") {
            let rest = line[pos + "[組織名]".len()..].trim();
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_organization() {
        let text = "Network Information:\na. [組織名]              何某ネットワーク株式会社\nf. [組織名じゃない]  x\n";
        assert_eq!(
            extract_organization(text).unwrap(),
            "何某ネットワーク株式会社"
        );
    }

    #[test]
    fn test_extract_organization_absent() {
        assert!(extract_organization("No match.\n").is_none());
    }

    #[test]
    fn test_iso_2022_jp_round_trip() {
        let (bytes, _, _) = ISO_2022_JP.encode("a. [組織名]  テスト会社\n");
        let (text, _, _) = ISO_2022_JP.decode(&bytes);
        assert_eq!(extract_organization(&text).unwrap(), "テスト会社");
    }
}
