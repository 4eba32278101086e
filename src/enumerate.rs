use crate::engine::PeerInfo;
use crate::filter::{in_same_slash64, AllowList};
use crate::lookup::public_ip::PublicAddress;
use crate::session::Session;
use crate::torrent::Torrent;
use crate::RETRY_COUNTER;
use log::info;
use std::net::IpAddr;
use std::time::Duration;

/// A peer selected for probing. Equality is by address and port; peers are
/// discovered, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Samples up to `max_peers` seeds from the swarm, in discovery order.
/// The torrent is attached under a throwaway directory; nothing is kept.
pub fn enumerate_seeds(
    session: &mut Session,
    torrent: &Torrent,
    max_peers: usize,
    allow: &AllowList,
    self_addr: &PublicAddress,
    poll_interval: Duration,
) -> anyhow::Result<Vec<Peer>> {
    let scratch = tempfile::tempdir()?;
    let mut handle = session.attach(torrent, scratch.path())?;

    let mut selected: Vec<Peer> = Vec::new();
    for round in 0..RETRY_COUNTER {
        for info in handle.peers() {
            if selected.len() >= max_peers {
                break;
            }
            let peer = Peer {
                addr: info.addr,
                port: info.port,
            };
            if accept(&info, allow, self_addr) && !selected.contains(&peer) {
                info!("selected seed {} (poll {})", peer, round);
                selected.push(peer);
            }
        }
        if selected.len() >= max_peers {
            break;
        }
        std::thread::sleep(poll_interval);
    }
    Ok(selected)
}

/// A peer qualifies iff it is a seed, it is not this host (exact v4 match,
/// shared /64 for v6), and it lies inside the allow-list.
pub fn accept(info: &PeerInfo, allow: &AllowList, self_addr: &PublicAddress) -> bool {
    if !info.is_seed {
        return false;
    }
    if let (IpAddr::V4(addr), Some(self_v4)) = (info.addr, self_addr.v4) {
        if addr == self_v4 {
            return false;
        }
    }
    if let (IpAddr::V6(addr), Some(self_v6)) = (info.addr, self_addr.v6) {
        if in_same_slash64(self_v6, addr) {
            return false;
        }
    }
    allow.contains(info.addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::torrent::testing::make_torrent;

    const ANNOUNCE: &str = "http://127.0.0.1:6969/announce";

    fn seed(addr: &str, port: u16) -> PeerInfo {
        PeerInfo {
            addr: addr.parse().unwrap(),
            port,
            is_seed: true,
        }
    }

    fn allow_all_test_nets() -> AllowList {
        AllowList::from_ranges(
            vec!["192.0.2.0/24".parse().unwrap(), "198.51.100.0/24".parse().unwrap()],
            vec!["2001:db8::/32".parse().unwrap()],
        )
    }

    #[test]
    fn test_accept_excludes_self_v4() {
        let allow = allow_all_test_nets();
        let self_addr = PublicAddress {
            v4: Some("198.51.100.5".parse().unwrap()),
            v6: None,
        };
        assert!(!accept(&seed("198.51.100.5", 6881), &allow, &self_addr));
        assert!(accept(&seed("198.51.100.6", 6881), &allow, &self_addr));
    }

    #[test]
    fn test_accept_excludes_own_slash64() {
        let allow = allow_all_test_nets();
        let self_addr = PublicAddress {
            v4: None,
            v6: Some("2001:db8:1:2::10".parse().unwrap()),
        };
        assert!(!accept(&seed("2001:db8:1:2::ff", 6881), &allow, &self_addr));
        assert!(accept(&seed("2001:db8:1:3::ff", 6881), &allow, &self_addr));
    }

    #[test]
    fn test_accept_requires_seed_and_allow_list() {
        let allow = allow_all_test_nets();
        let nobody = PublicAddress::default();
        let mut leecher = seed("192.0.2.10", 6881);
        leecher.is_seed = false;
        assert!(!accept(&leecher, &allow, &nobody));
        // outside the allow-list
        assert!(!accept(&seed("203.0.113.10", 6881), &allow, &nobody));
        assert!(accept(&seed("192.0.2.10", 6881), &allow, &nobody));
    }

    #[test]
    fn test_enumerate_filters_and_dedupes() {
        let (engine, state) = FakeEngine::new();
        let self_v4 = "198.51.100.5";
        state.borrow_mut().peers_per_poll = vec![
            vec![seed(self_v4, 6881), seed("192.0.2.10", 51413)],
            vec![seed("192.0.2.10", 51413), seed("192.0.2.11", 6881)],
        ];

        let torrent = make_torrent("t", 16, &[1u8; 32], ANNOUNCE);
        let mut session = Session::open_sampling(Box::new(engine), &torrent);
        let peers = enumerate_seeds(
            &mut session,
            &torrent,
            10,
            &allow_all_test_nets(),
            &PublicAddress {
                v4: Some(self_v4.parse().unwrap()),
                v6: None,
            },
            Duration::ZERO,
        )
        .unwrap();

        assert_eq!(
            peers,
            vec![
                Peer {
                    addr: "192.0.2.10".parse().unwrap(),
                    port: 51413,
                },
                Peer {
                    addr: "192.0.2.11".parse().unwrap(),
                    port: 6881,
                },
            ]
        );
    }

    #[test]
    fn test_enumerate_respects_max_peers() {
        let (engine, state) = FakeEngine::new();
        state.borrow_mut().peers_per_poll = vec![vec![
            seed("192.0.2.1", 1),
            seed("192.0.2.2", 2),
            seed("192.0.2.3", 3),
        ]];

        let torrent = make_torrent("t", 16, &[1u8; 32], ANNOUNCE);
        let mut session = Session::open_sampling(Box::new(engine), &torrent);
        let peers = enumerate_seeds(
            &mut session,
            &torrent,
            2,
            &allow_all_test_nets(),
            &PublicAddress::default(),
            Duration::ZERO,
        )
        .unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].addr, "192.0.2.1".parse::<IpAddr>().unwrap());
    }
}
