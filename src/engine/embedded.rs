use crate::engine::{Alert, EngineHandle, EngineSession, PeerInfo, TorrentStatus};
use crate::filter::IpFilter;
use crate::peer::connection::Connection;
use crate::peer::message::Message;
use crate::torrent::Torrent;
use crate::tracker::http as tracker_http;
use anyhow::{Context, Result};
use log::{debug, warn};
use mio::net::TcpListener;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

const BLOCK_LEN: usize = 16 * 1024;
const MAX_CONNS: usize = 20;
const MAX_CONNECT_ATTEMPTS: usize = 3;
/// per-connection poll timeout inside one pump
const CONN_POLL: Duration = Duration::from_millis(20);
const IDLE_CUTOFF: Duration = Duration::from_secs(30);

/// The in-crate BitTorrent engine. It has no threads of its own: every
/// `status()`, `peers()` and `pop_alerts()` call pumps the tracker announce,
/// outbound connections and piece assembly forward, so the orchestrator's
/// sleep-poll loops are what drive the wire.
pub struct EmbeddedEngine {
    shared: Rc<RefCell<Shared>>,
    torrents: Vec<Weak<RefCell<TorrentState>>>,
}

struct Shared {
    filter: IpFilter,
    alerts: VecDeque<Alert>,
    peer_id: [u8; 20],
    listen_port: u16,
    listeners: Vec<TcpListener>,
}

impl EmbeddedEngine {
    /// Binds the v4 and v6 listeners. A v6 bind failure is tolerated; a v4
    /// failure aborts, since an engine that cannot open its port is fatal.
    pub fn new(listen_port: u16) -> Result<EmbeddedEngine> {
        let v4 = TcpListener::bind(format!("0.0.0.0:{}", listen_port).parse().unwrap())
            .with_context(|| format!("failed to listen on 0.0.0.0:{}", listen_port))?;
        let mut listeners = vec![v4];
        match TcpListener::bind(format!("[::]:{}", listen_port).parse().unwrap()) {
            Ok(v6) => listeners.push(v6),
            Err(err) => warn!("failed to listen on [::]:{}: {}", listen_port, err),
        }

        Ok(EmbeddedEngine {
            shared: Rc::new(RefCell::new(Shared {
                filter: IpFilter::new(),
                alerts: VecDeque::new(),
                peer_id: crate::utils::generate_peer_id(),
                listen_port,
                listeners,
            })),
            torrents: Vec::new(),
        })
    }

    pub fn add_torrent_embedded(
        &mut self,
        torrent: &Torrent,
        save_path: &Path,
    ) -> Result<EmbeddedHandle> {
        std::fs::create_dir_all(save_path)
            .with_context(|| format!("failed to create {}", save_path.display()))?;
        let state = Rc::new(RefCell::new(TorrentState::new(torrent.clone(), save_path)));
        self.torrents.push(Rc::downgrade(&state));
        Ok(EmbeddedHandle {
            state,
            shared: Rc::clone(&self.shared),
        })
    }

    fn pump_all(&mut self) {
        self.torrents.retain(|weak| weak.upgrade().is_some());
        for weak in &self.torrents {
            if let Some(state) = weak.upgrade() {
                state.borrow_mut().pump(&mut self.shared.borrow_mut());
            }
        }
    }
}

impl EngineSession for EmbeddedEngine {
    fn set_upload_rate_limit(&mut self, limit: i64) {
        // upload is structurally zero, this engine never serves a block
        debug!("upload rate limit set to {}", limit);
    }

    fn set_ip_filter(&mut self, filter: IpFilter) {
        self.shared.borrow_mut().filter = filter;
    }

    fn add_torrent(
        &mut self,
        torrent: &Torrent,
        save_path: &Path,
    ) -> Result<Box<dyn EngineHandle>> {
        Ok(Box::new(self.add_torrent_embedded(torrent, save_path)?))
    }

    fn pop_alerts(&mut self) -> Vec<Alert> {
        self.pump_all();
        self.shared.borrow_mut().alerts.drain(..).collect()
    }
}

pub struct EmbeddedHandle {
    state: Rc<RefCell<TorrentState>>,
    shared: Rc<RefCell<Shared>>,
}

impl EmbeddedHandle {
    /// Injects a peer directly, bypassing the tracker. The filter still
    /// applies at connect time.
    pub fn add_peer(&mut self, addr: SocketAddr) {
        self.state.borrow_mut().candidates.push_back(addr);
    }
}

impl EngineHandle for EmbeddedHandle {
    fn status(&mut self) -> TorrentStatus {
        let mut state = self.state.borrow_mut();
        state.pump(&mut self.shared.borrow_mut());
        state.status()
    }

    fn peers(&mut self) -> Vec<PeerInfo> {
        let mut state = self.state.borrow_mut();
        state.pump(&mut self.shared.borrow_mut());
        state
            .conns
            .iter()
            .filter(|conn| conn.handshaken && conn.is_open())
            .map(|conn| PeerInfo {
                addr: conn.addr.ip(),
                port: conn.addr.port(),
                is_seed: conn.is_seed(),
            })
            .collect()
    }

    fn prioritize_pieces(&mut self, priorities: &[u8]) {
        let mut state = self.state.borrow_mut();
        let mut priorities = priorities.to_vec();
        priorities.resize(state.num_pieces, 0);
        state.priorities = priorities;
    }

    fn read_piece(&mut self, index: usize) {
        let mut state = self.state.borrow_mut();
        let mut shared = self.shared.borrow_mut();
        if state.have.get(index).copied().unwrap_or(false) {
            state.post_piece_read(index, &mut shared);
        } else {
            state.pending_reads.push(index);
        }
    }

    fn info_hash(&self) -> [u8; 20] {
        self.state.borrow().info_hash
    }
}

struct PartialPiece {
    buf: Vec<u8>,
    received: Vec<bool>,
    assigned_to: Option<SocketAddr>,
}

struct TorrentState {
    torrent: Torrent,
    info_hash: [u8; 20],
    num_pieces: usize,
    payload_path: PathBuf,
    priorities: Vec<u8>,
    have: Vec<bool>,
    partials: HashMap<usize, PartialPiece>,
    candidates: VecDeque<SocketAddr>,
    attempts: HashMap<SocketAddr, usize>,
    conns: Vec<Connection>,
    announced: bool,
    pending_reads: Vec<usize>,
    rate_bytes: u64,
    rate_window: Instant,
    last_rate: f64,
}

impl TorrentState {
    fn new(torrent: Torrent, save_path: &Path) -> TorrentState {
        let num_pieces = torrent.num_pieces();
        let info_hash = torrent.info_hash();
        let payload_path = save_path.join(torrent.name());
        TorrentState {
            torrent,
            info_hash,
            num_pieces,
            payload_path,
            priorities: vec![1; num_pieces],
            have: vec![false; num_pieces],
            partials: HashMap::new(),
            candidates: VecDeque::new(),
            attempts: HashMap::new(),
            conns: Vec::new(),
            announced: false,
            pending_reads: Vec::new(),
            rate_bytes: 0,
            rate_window: Instant::now(),
            last_rate: 0.0,
        }
    }

    fn pump(&mut self, shared: &mut Shared) {
        accept_and_drop(&shared.listeners);

        if !self.announced {
            self.announce(shared);
            self.announced = true;
        }
        self.connect_candidates(shared);

        for idx in 0..self.conns.len() {
            let messages = self.conns[idx].pump(CONN_POLL);
            for message in messages {
                self.handle_message(idx, message, shared);
            }
        }

        for idx in 0..self.conns.len() {
            if !self.conns[idx].handshaken || !self.conns[idx].is_open() {
                continue;
            }
            if !self.conns[idx].am_interested && self.peer_has_wanted(idx) {
                self.conns[idx].send_interested();
            }
            if !self.conns[idx].peer_choking {
                self.assign_next(idx);
            }
        }

        self.prune_conns();
    }

    fn announce(&mut self, shared: &Shared) {
        for url in self.torrent.trackers() {
            let addrs = tracker_http::resolve_url(&url);
            let Some(addr) = addrs.iter().find(|a| shared.filter.allows(a.ip())) else {
                if !addrs.is_empty() {
                    debug!("tracker {} blocked by ip filter", url);
                }
                continue;
            };
            let left = self.torrent.total_size();
            match tracker_http::announce(
                &url,
                *addr,
                self.info_hash,
                shared.peer_id,
                shared.listen_port,
                left,
            ) {
                Ok(response) => {
                    debug!(
                        "tracker {} returned {} peers ({:?} seeds)",
                        url,
                        response.all_peers().len(),
                        response.complete,
                    );
                    for peer in response.all_peers() {
                        if !self.candidates.contains(&peer) {
                            self.candidates.push_back(peer);
                        }
                    }
                }
                Err(err) => warn!("announce to {} failed: {:#}", url, err),
            }
        }
    }

    fn connect_candidates(&mut self, shared: &Shared) {
        while self.conns.len() < MAX_CONNS {
            let Some(addr) = self.candidates.pop_front() else {
                break;
            };
            if !shared.filter.allows(addr.ip()) {
                debug!("peer {} blocked by ip filter", addr);
                continue;
            }
            if self.conns.iter().any(|conn| conn.addr == addr) {
                continue;
            }
            let attempts = self.attempts.entry(addr).or_insert(0);
            if *attempts >= MAX_CONNECT_ATTEMPTS {
                continue;
            }
            *attempts += 1;
            match Connection::connect(addr, self.info_hash, shared.peer_id, self.num_pieces) {
                Ok(conn) => self.conns.push(conn),
                Err(err) => debug!("connect to {} failed: {}", addr, err),
            }
        }
    }

    fn handle_message(&mut self, idx: usize, message: Message, shared: &mut Shared) {
        match message {
            Message::Unchoke => self.assign_next(idx),
            Message::Choke => {
                let addr = self.conns[idx].addr;
                self.unassign(addr);
            }
            Message::Piece(index, begin, block) => {
                self.store_block(index as usize, begin as usize, &block, shared);
            }
            // upload is pinned to zero, serve nothing
            Message::Request(..) | Message::Cancel(..) => {}
            _ => {}
        }
    }

    fn peer_has_wanted(&self, idx: usize) -> bool {
        let conn = &self.conns[idx];
        (0..self.num_pieces).any(|i| self.wanted(i) && conn.bitfield.has_piece(i))
    }

    fn wanted(&self, index: usize) -> bool {
        self.priorities.get(index).copied().unwrap_or(0) > 0 && !self.have[index]
    }

    /// Hands the connection its next piece, one piece per peer at a time.
    fn assign_next(&mut self, idx: usize) {
        let addr = self.conns[idx].addr;
        if self
            .partials
            .values()
            .any(|partial| partial.assigned_to == Some(addr))
        {
            return;
        }
        let Some(index) = (0..self.num_pieces).find(|&i| {
            self.wanted(i)
                && self.conns[idx].bitfield.has_piece(i)
                && self
                    .partials
                    .get(&i)
                    .map(|partial| partial.assigned_to.is_none())
                    .unwrap_or(true)
        }) else {
            return;
        };

        let piece_size = self.torrent.piece_size(index);
        let num_blocks = (piece_size + BLOCK_LEN - 1) / BLOCK_LEN;
        let partial = self.partials.entry(index).or_insert_with(|| PartialPiece {
            buf: vec![0; piece_size],
            received: vec![false; num_blocks],
            assigned_to: None,
        });
        partial.assigned_to = Some(addr);

        let missing: Vec<usize> = partial
            .received
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(b, _)| b)
            .collect();
        for b in missing {
            let begin = b * BLOCK_LEN;
            let len = (piece_size - begin).min(BLOCK_LEN);
            self.conns[idx].send(&Message::Request(index as u32, begin as u32, len as u32));
        }
    }

    fn unassign(&mut self, addr: SocketAddr) {
        for partial in self.partials.values_mut() {
            if partial.assigned_to == Some(addr) {
                partial.assigned_to = None;
            }
        }
    }

    fn store_block(&mut self, index: usize, begin: usize, block: &[u8], shared: &mut Shared) {
        if index >= self.num_pieces || self.have[index] {
            return;
        }
        let piece_size = self.torrent.piece_size(index);
        let Some(partial) = self.partials.get_mut(&index) else {
            return;
        };
        if begin % BLOCK_LEN != 0 || begin >= piece_size {
            return;
        }
        let expected = (piece_size - begin).min(BLOCK_LEN);
        if block.len() != expected {
            debug!(
                "unexpected block length {} for piece {} offset {}",
                block.len(),
                index,
                begin
            );
            return;
        }
        let b = begin / BLOCK_LEN;
        if partial.received[b] {
            return;
        }
        partial.buf[begin..begin + expected].copy_from_slice(block);
        partial.received[b] = true;
        self.rate_bytes += expected as u64;

        if partial.received.iter().all(|done| *done) {
            self.finish_piece(index, shared);
        }
    }

    fn finish_piece(&mut self, index: usize, shared: &mut Shared) {
        let Some(partial) = self.partials.remove(&index) else {
            return;
        };
        if crate::verify::digest(&partial.buf) != self.torrent.hash_for_piece(index) {
            warn!("piece {} failed its hash check, discarding", index);
            return;
        }
        if let Err(err) = self.write_piece(index, &partial.buf) {
            warn!("failed to store piece {}: {}", index, err);
            shared.alerts.push_back(Alert::Error {
                message: format!("failed to store piece {}: {}", index, err),
            });
            return;
        }
        self.have[index] = true;

        if let Some(pos) = self.pending_reads.iter().position(|&i| i == index) {
            self.pending_reads.remove(pos);
            shared.alerts.push_back(Alert::ReadPiece {
                index,
                buffer: partial.buf,
            });
        }
    }

    /// Serves an already-held piece back as a `ReadPiece` alert.
    fn post_piece_read(&mut self, index: usize, shared: &mut Shared) {
        match self.read_piece_bytes(index) {
            Ok(buffer) => shared.alerts.push_back(Alert::ReadPiece { index, buffer }),
            Err(err) => shared.alerts.push_back(Alert::Error {
                message: format!("failed to read piece {}: {}", index, err),
            }),
        }
    }

    fn write_piece(&mut self, index: usize, buf: &[u8]) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.payload_path)?;
        file.seek(SeekFrom::Start(
            index as u64 * self.torrent.piece_length().max(0) as u64,
        ))?;
        file.write_all(buf)
    }

    fn read_piece_bytes(&self, index: usize) -> std::io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(&self.payload_path)?;
        file.seek(SeekFrom::Start(
            index as u64 * self.torrent.piece_length().max(0) as u64,
        ))?;
        let mut buf = vec![0; self.torrent.piece_size(index)];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn prune_conns(&mut self) {
        let mut dropped: Vec<SocketAddr> = Vec::new();
        self.conns.retain(|conn| {
            if conn.is_open() && conn.idle_for() < IDLE_CUTOFF {
                true
            } else {
                dropped.push(conn.addr);
                false
            }
        });
        for addr in dropped {
            debug!("dropping connection to {}", addr);
            self.unassign(addr);
            if self.attempts.get(&addr).copied().unwrap_or(0) < MAX_CONNECT_ATTEMPTS {
                self.candidates.push_back(addr);
            }
        }
    }

    fn status(&mut self) -> TorrentStatus {
        let held = self.have.iter().filter(|h| **h).count();
        let progress = if self.num_pieces == 0 {
            1.0
        } else {
            held as f64 / self.num_pieces as f64
        };
        let seeding = self.num_pieces > 0 && held == self.num_pieces;

        let elapsed = self.rate_window.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.last_rate = self.rate_bytes as f64 / elapsed;
            self.rate_bytes = 0;
            self.rate_window = Instant::now();
        }

        TorrentStatus {
            is_seeding: seeding,
            progress,
            num_peers: self
                .conns
                .iter()
                .filter(|conn| conn.handshaken && conn.is_open())
                .count(),
            pieces: self.have.clone(),
            download_rate: self.last_rate,
            upload_rate: 0.0,
            state: if seeding { "seeding" } else { "downloading" },
        }
    }
}

/// Inbound connections are never served; accept and hang up.
fn accept_and_drop(listeners: &[TcpListener]) {
    for listener in listeners {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("dropping inbound connection from {}", addr);
                    drop(stream);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!("accept failed: {}", err);
                    break;
                }
            }
        }
    }
}
