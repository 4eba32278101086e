use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use url::Url;
use urlencoding::encode_binary;

const TOKEN: Token = Token(0);
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

/// deserialize peers from compact representation for both ipv4 and ipv6
mod peers {
    use serde::de::{self, Deserialize, Deserializer, Visitor};
    use std::fmt;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

    /// `peers` key: 6 bytes per peer, 4 address + 2 port, big endian.
    #[derive(Debug, Clone, Default)]
    pub struct Peers(pub Vec<SocketAddr>);

    /// `peers6` key: 18 bytes per peer, 16 address + 2 port.
    #[derive(Debug, Clone, Default)]
    pub struct Peers6(pub Vec<SocketAddr>);

    struct PeersVisitor;

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Peers;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("compact representation of v4 peers")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("compact v4 peers length not a multiple of 6"));
            }
            let peers = v
                .chunks_exact(6)
                .map(|c| {
                    let addr = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                    let port = u16::from_be_bytes([c[4], c[5]]);
                    SocketAddr::V4(SocketAddrV4::new(addr, port))
                })
                .collect();
            Ok(Peers(peers))
        }
    }

    impl<'de> Deserialize<'de> for Peers {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(PeersVisitor)
        }
    }

    struct Peers6Visitor;

    impl<'de> Visitor<'de> for Peers6Visitor {
        type Value = Peers6;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("compact representation of v6 peers")
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 18 != 0 {
                return Err(E::custom("compact v6 peers length not a multiple of 18"));
            }
            let peers = v
                .chunks_exact(18)
                .map(|c| {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&c[..16]);
                    let addr = Ipv6Addr::from(octets);
                    let port = u16::from_be_bytes([c[16], c[17]]);
                    SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))
                })
                .collect();
            Ok(Peers6(peers))
        }
    }

    impl<'de> Deserialize<'de> for Peers6 {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(Peers6Visitor)
        }
    }
}

pub use peers::{Peers, Peers6};

#[derive(Debug, Default, Deserialize)]
pub struct AnnounceResponse {
    /// can still have a 200 ok, but this indicates a failure within the BT protocol request
    #[serde(default)]
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
    /// warning, similar to failure reason, but the response still gets processed normally
    #[serde(default)]
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,
    /// interval in seconds that the client should wait between regular requests to the tracker
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,
    #[serde(default)]
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,
    /// number of peers with the entire file, i.e. seeders
    #[serde(default)]
    pub complete: Option<u64>,
    /// number of non-seeder peers, aka "leechers"
    #[serde(default)]
    pub incomplete: Option<u64>,
    #[serde(default)]
    pub peers: Option<Peers>,
    #[serde(default)]
    pub peers6: Option<Peers6>,
}

impl AnnounceResponse {
    /// v4 and v6 peers flattened, v4 first.
    pub fn all_peers(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        if let Some(peers) = &self.peers {
            out.extend_from_slice(&peers.0);
        }
        if let Some(peers6) = &self.peers6 {
            out.extend_from_slice(&peers6.0);
        }
        out
    }
}

/// Socket addresses an announce URL resolves to; empty on DNS failure.
pub fn resolve_url(url: &Url) -> Vec<SocketAddr> {
    let Some(host) = url.host_str() else {
        return Vec::new();
    };
    let port = url.port_or_known_default().unwrap_or(6969);
    match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(err) => {
            debug!("failed to resolve tracker {}: {}", host, err);
            Vec::new()
        }
    }
}

/// One announce over HTTP against an already-resolved tracker address.
pub fn announce(
    url: &Url,
    addr: SocketAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    listen_port: u16,
    left: u64,
) -> Result<AnnounceResponse> {
    let host = url.host_str().ok_or_else(|| anyhow!("no host in {}", url))?;
    let query = format!(
        "?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&numwant=50",
        encode_binary(&info_hash),
        encode_binary(&peer_id),
        listen_port,
        left,
    );
    let request = format!(
        "GET {}{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        url.path(),
        query,
        host
    );

    let raw = http_round_trip(addr, request.as_bytes())
        .with_context(|| format!("announce to {} ({}) failed", host, addr))?;
    parse_announce_response(&raw)
}

/// Writes the request and reads to EOF over a non-blocking socket.
fn http_round_trip(addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(64);
    let mut stream = TcpStream::connect(addr)?;
    poll.registry()
        .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)?;

    let deadline = Instant::now() + ANNOUNCE_TIMEOUT;
    let mut written = 0;
    let mut response = Vec::new();

    loop {
        let now = Instant::now();
        if now >= deadline {
            bail!("timed out waiting for tracker response");
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
                    Ok(0) => return Ok(response),
                    Ok(n) => response.extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}

fn parse_announce_response(raw: &[u8]) -> Result<AnnounceResponse> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut parsed = httparse::Response::new(&mut headers);
    let body_start = match parsed.parse(raw)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => bail!("truncated tracker response"),
    };
    if let Some(code) = parsed.code {
        if code != 200 {
            bail!("tracker returned HTTP {}", code);
        }
    }

    let response: AnnounceResponse = serde_bencode::from_bytes(&raw[body_start..])
        .context("failed to parse tracker response body")?;
    if let Some(reason) = &response.failure_reason {
        bail!("tracker refused announce: {}", reason);
    }
    if let Some(warning) = &response.warning_message {
        debug!("tracker warning: {}", warning);
    }
    Ok(response)
}
