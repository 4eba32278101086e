use ip_network::{Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::str::FromStr;

/// Geographic/organizational allow-list: two disjoint sets of CIDR ranges,
/// loaded once per run and read-only afterwards.
#[derive(Debug, Default)]
pub struct AllowList {
    v4: Vec<Ipv4Network>,
    v6: Vec<Ipv6Network>,
}

impl AllowList {
    /// Loads `ipv4.txt` / `ipv6.txt` style files, one CIDR per line.
    /// A missing file yields an empty list; unparseable lines are skipped.
    pub fn load(v4_path: &Path, v6_path: &Path) -> AllowList {
        AllowList {
            v4: read_ranges(v4_path),
            v6: read_ranges(v6_path),
        }
    }

    pub fn from_ranges(v4: Vec<Ipv4Network>, v6: Vec<Ipv6Network>) -> AllowList {
        AllowList { v4, v6 }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4.iter().any(|net| net.contains(v4)),
            IpAddr::V6(v6) => self.v6.iter().any(|net| net.contains(v6)),
        }
    }

    /// Textual form; an unparseable address is simply not in the list.
    pub fn contains_str(&self, ip: &str) -> bool {
        match ip.parse::<IpAddr>() {
            Ok(addr) => self.contains(addr),
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

fn read_ranges<N: FromStr>(path: &Path) -> Vec<N> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            log::warn!("allow-list {} unreadable: {}", path.display(), err);
            return Vec::new();
        }
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.parse().ok())
        .collect()
}

/// True when both addresses share the same /64, used to exclude the
/// crawler's own network from enumeration.
pub fn in_same_slash64(a: Ipv6Addr, b: Ipv6Addr) -> bool {
    match Ipv6Network::new_truncate(a, 64) {
        Ok(net) => net.contains(b),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Deny,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub low: IpAddr,
    pub high: IpAddr,
    pub action: Action,
}

impl Rule {
    fn matches(&self, ip: IpAddr) -> bool {
        match (self.low, self.high, ip) {
            (IpAddr::V4(low), IpAddr::V4(high), IpAddr::V4(ip)) => {
                u32::from(low) <= u32::from(ip) && u32::from(ip) <= u32::from(high)
            }
            (IpAddr::V6(low), IpAddr::V6(high), IpAddr::V6(ip)) => {
                u128::from(low) <= u128::from(ip) && u128::from(ip) <= u128::from(high)
            }
            _ => false,
        }
    }
}

/// Ordered allow/deny rules over address ranges. Addresses no rule matches
/// are allowed, which is why every restricted session starts from
/// [`IpFilter::deny_all`]. The last matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct IpFilter {
    rules: Vec<Rule>,
}

impl IpFilter {
    pub fn new() -> IpFilter {
        IpFilter { rules: Vec::new() }
    }

    /// Denies the entire v4 and v6 address space.
    pub fn deny_all() -> IpFilter {
        let mut filter = IpFilter::new();
        filter.add_rule(
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)),
            Action::Deny,
        );
        filter.add_rule(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::from(u128::MAX)),
            Action::Deny,
        );
        filter
    }

    pub fn add_rule(&mut self, low: IpAddr, high: IpAddr, action: Action) {
        self.rules.push(Rule { low, high, action });
    }

    pub fn allow_host(&mut self, ip: IpAddr) {
        self.add_rule(ip, ip, Action::Allow);
    }

    /// Effective action for `ip`: the last matching rule decides.
    pub fn allows(&self, ip: IpAddr) -> bool {
        let mut action = Action::Allow;
        for rule in &self.rules {
            if rule.matches(ip) {
                action = rule.action;
            }
        }
        action == Action::Allow
    }

    /// Deny-everything filter that lets through only the resolved tracker
    /// addresses and the one peer under probe.
    pub fn compose_peer_only(peer: IpAddr, trackers: &[IpAddr]) -> IpFilter {
        let mut filter = IpFilter::deny_all();
        for tracker in trackers {
            filter.allow_host(*tracker);
        }
        filter.allow_host(peer);
        filter
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}
