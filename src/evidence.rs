use crate::enumerate::Peer;
use crate::probe::PieceRecord;
use crate::utils::format_timestamp;
use anyhow::{Context, Result};
use log::debug;
use std::ffi::OsStr;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

pub const PEER_INDEX: &str = "peer.csv";

/// Everything the per-peer provenance header carries besides the peer
/// itself. Built once per peer by the orchestrator (whois included) so the
/// writer stays pure file I/O.
#[derive(Debug, Clone)]
pub struct EvidenceMeta {
    pub organization: String,
    pub payload_name: String,
    pub info_hash_hex: String,
    pub started_at: String,
    pub version: String,
}

/// Appends evidence under the save root: the peer index, the per-peer log
/// and, when enabled, the raw piece bytes. Creation is idempotent per peer;
/// everything else is append-only.
pub struct EvidenceWriter {
    save_root: PathBuf,
    piece_download: bool,
}

impl EvidenceWriter {
    pub fn new(save_root: &Path, piece_download: bool) -> EvidenceWriter {
        EvidenceWriter {
            save_root: save_root.to_path_buf(),
            piece_download,
        }
    }

    pub fn append(&self, record: &PieceRecord, meta: &EvidenceMeta) -> Result<()> {
        let dir = self.save_root.join(peer_dir_name(&record.peer));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        self.record_peer(&record.peer)?;

        if self.piece_download {
            if let Some(bytes) = record.bytes.as_deref().filter(|b| !b.is_empty()) {
                let name = format!(
                    "{}{:05}_{}_{}_{}.bin",
                    record.status.file_prefix(),
                    record.piece_index,
                    addr_dashes(&record.peer.addr),
                    record.peer.port,
                    meta.info_hash_hex,
                );
                let path = unique_path(dir.join(name));
                std::fs::write(&path, bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                debug!("piece bytes saved to {}", path.display());
            }
        }

        let log_path = dir.join(format!(
            "{}_{}_{}.log",
            addr_dashes(&record.peer.addr),
            record.peer.port,
            meta.info_hash_hex,
        ));
        if !log_path.exists() {
            self.write_header(&log_path, &record.peer, meta)?;
        }
        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .with_context(|| format!("failed to open {}", log_path.display()))?;
        writeln!(
            log,
            "piece{}{} 完了時刻: {} {}",
            record.piece_index,
            record.status.log_note(),
            format_timestamp(&record.completed_at),
            meta.version,
        )?;
        Ok(())
    }

    /// One `address,port` row per unique peer, ever.
    pub fn record_peer(&self, peer: &Peer) -> Result<()> {
        let path = self.save_root.join(PEER_INDEX);
        let entry = format!("{},{}", peer.addr, peer.port);
        let existing = std::fs::read_to_string(&path).unwrap_or_default();
        if existing.lines().any(|line| line == entry) {
            return Ok(());
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }

    fn write_header(&self, path: &Path, peer: &Peer, meta: &EvidenceMeta) -> Result<()> {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        writeln!(file, "IP: {}", peer.addr)?;
        writeln!(file, "ポート: {}", peer.port)?;
        writeln!(file, "組織名: {}", meta.organization)?;
        writeln!(file, "ファイル名: {}", meta.payload_name)?;
        writeln!(file, "インフォハッシュ: {}", meta.info_hash_hex)?;
        writeln!(file, "証拠採取開始時刻: {}", meta.started_at)?;
        writeln!(file, "クローラーバージョン: {}", meta.version)?;
        writeln!(file, "---")?;
        Ok(())
    }
}

/// `192.0.2.10` → `192.0.2.10`, `2001:db8::1` → `2001-db8--1`.
pub fn addr_dashes(addr: &IpAddr) -> String {
    addr.to_string().replace(':', "-")
}

pub fn peer_dir_name(peer: &Peer) -> String {
    format!("{}_{}", addr_dashes(&peer.addr), peer.port)
}

/// First unused variant of `path`, suffixing `_1`, `_2`, … before the
/// extension.
fn unique_path(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or("piece")
        .to_string();
    let ext = path
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or("bin")
        .to_string();
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut n = 1;
    loop {
        let candidate = parent.join(format!("{}_{}.{}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
