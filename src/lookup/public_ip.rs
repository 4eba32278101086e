use anyhow::Result;
use log::warn;
use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

const IPIFY_V4: &str = "https://api.ipify.org?format=json";
const IPIFY_V6: &str = "https://api6.ipify.org?format=json";

/// This host's public addresses as the outside world sees them. Either side
/// can be unknown; enumeration then skips that self-exclusion.
#[derive(Debug, Clone, Default)]
pub struct PublicAddress {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

#[derive(Debug, Deserialize)]
struct IpifyResponse {
    ip: String,
}

/// Two independent best-effort lookups; failures are logged, never fatal.
pub fn detect() -> PublicAddress {
    PublicAddress {
        v4: lookup(IPIFY_V4),
        v6: lookup(IPIFY_V6),
    }
}

fn lookup<T: FromStr>(url: &str) -> Option<T> {
    match fetch(url) {
        Ok(raw) => match raw.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!("unparseable address {:?} from {}", raw, url);
                None
            }
        },
        Err(err) => {
            warn!("public address lookup via {} failed: {:#}", url, err);
            None
        }
    }
}

fn fetch(url: &str) -> Result<String> {
    let response: IpifyResponse = reqwest::blocking::get(url)?.error_for_status()?.json()?;
    Ok(response.ip)
}
