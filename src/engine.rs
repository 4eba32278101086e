//! Capability surface of the BitTorrent engine the collector drives. The
//! orchestration layer only ever talks to these traits; the in-crate
//! implementation lives in [`embedded`] and tests script a fake.

pub mod embedded;

use crate::filter::IpFilter;
use crate::torrent::Torrent;
use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Clone)]
pub enum Alert {
    /// a `read_piece` request completed; `buffer` holds the piece bytes
    ReadPiece { index: usize, buffer: Vec<u8> },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: IpAddr,
    pub port: u16,
    pub is_seed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TorrentStatus {
    pub is_seeding: bool,
    /// fraction of pieces held, 0.0..=1.0
    pub progress: f64,
    pub num_peers: usize,
    /// one flag per piece
    pub pieces: Vec<bool>,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub state: &'static str,
}

pub trait EngineHandle {
    fn status(&mut self) -> TorrentStatus;
    fn peers(&mut self) -> Vec<PeerInfo>;
    /// One priority value per piece; 0 means the piece is never requested.
    fn prioritize_pieces(&mut self, priorities: &[u8]);
    /// Asks the engine to surface piece `index` as a `ReadPiece` alert once
    /// it is held.
    fn read_piece(&mut self, index: usize);
    fn info_hash(&self) -> [u8; 20];
}

pub trait EngineSession {
    fn set_upload_rate_limit(&mut self, limit: i64);
    fn set_ip_filter(&mut self, filter: IpFilter);
    fn add_torrent(
        &mut self,
        torrent: &Torrent,
        save_path: &Path,
    ) -> anyhow::Result<Box<dyn EngineHandle>>;
    fn pop_alerts(&mut self) -> Vec<Alert>;
}
