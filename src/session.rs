use crate::engine::{Alert, EngineHandle, EngineSession};
use crate::filter::IpFilter;
use crate::torrent::Torrent;
use log::{debug, warn};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

/// Owns the engine for one phase of a run. A restricted session carries the
/// deny-all baseline (trackers excepted) from the moment it opens, so no
/// torrent is ever attached behind a permissive filter; a sampling session
/// leaves the filter open because the enumerator and the full-download
/// driver must see the swarm.
pub struct Session {
    engine: Box<dyn EngineSession>,
    trackers: Vec<IpAddr>,
    current: IpFilter,
}

impl Session {
    /// Probe session: upload pinned to zero, deny-all base plus one allow
    /// rule per resolved tracker, installed before any attach.
    pub fn open(engine: Box<dyn EngineSession>, torrent: &Torrent) -> Session {
        Session::with_engine(engine, torrent, true)
    }

    /// Unrestricted session for enumeration and the full download.
    pub fn open_sampling(engine: Box<dyn EngineSession>, torrent: &Torrent) -> Session {
        Session::with_engine(engine, torrent, false)
    }

    fn with_engine(
        mut engine: Box<dyn EngineSession>,
        torrent: &Torrent,
        restricted: bool,
    ) -> Session {
        engine.set_upload_rate_limit(0);
        let trackers = resolve_trackers(torrent);
        let current = if restricted {
            let mut filter = IpFilter::deny_all();
            for tracker in &trackers {
                filter.allow_host(*tracker);
            }
            engine.set_ip_filter(filter.clone());
            filter
        } else {
            IpFilter::new()
        };
        Session {
            engine,
            trackers,
            current,
        }
    }

    pub fn attach(
        &mut self,
        torrent: &Torrent,
        save_path: &Path,
    ) -> anyhow::Result<Box<dyn EngineHandle>> {
        self.engine.add_torrent(torrent, save_path)
    }

    /// Baseline plus a single-host allow rule for the peer under probe.
    /// Must run before the torrent for that probe is attached.
    pub fn narrow_to_peer(&mut self, peer: IpAddr) {
        let filter = IpFilter::compose_peer_only(peer, &self.trackers);
        self.set_filter(filter);
    }

    pub fn set_filter(&mut self, filter: IpFilter) {
        self.current = filter.clone();
        self.engine.set_ip_filter(filter);
    }

    pub fn pop_alerts(&mut self) -> Vec<Alert> {
        self.engine.pop_alerts()
    }

    /// One pass over the alert queue; returns the buffer of a piece-read
    /// alert for `index` if one arrived. Other alerts are logged away.
    pub fn drain_piece_alerts(&mut self, index: usize) -> Option<Vec<u8>> {
        let mut captured = None;
        for alert in self.engine.pop_alerts() {
            match alert {
                Alert::ReadPiece { index: got, buffer } if got == index => {
                    captured = Some(buffer);
                }
                Alert::ReadPiece { index: got, .. } => {
                    debug!("ignoring read of unrequested piece {}", got);
                }
                Alert::Error { message } => warn!("engine: {}", message),
            }
        }
        captured
    }

    /// Discards alerts left over from an earlier probe so a later one never
    /// observes them.
    pub fn drain_stale_alerts(&mut self) {
        let stale = self.engine.pop_alerts();
        if !stale.is_empty() {
            debug!("discarded {} stale alerts", stale.len());
        }
    }

    pub fn current_filter(&self) -> &IpFilter {
        &self.current
    }

    pub fn trackers(&self) -> &[IpAddr] {
        &self.trackers
    }
}

/// DNS resolution of every tracker URL; unresolvable hosts are skipped.
pub fn resolve_trackers(torrent: &Torrent) -> Vec<IpAddr> {
    let mut out: Vec<IpAddr> = Vec::new();
    for url in torrent.trackers() {
        let Some(host) = url.host_str() else {
            continue;
        };
        let port = url.port_or_known_default().unwrap_or(6969);
        match (host, port).to_socket_addrs() {
            Ok(addrs) => {
                for addr in addrs {
                    if !out.contains(&addr.ip()) {
                        out.push(addr.ip());
                    }
                }
            }
            Err(err) => warn!("failed to resolve tracker {}: {}", host, err),
        }
    }
    out
}
