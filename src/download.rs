use crate::engine::TorrentStatus;
use crate::session::Session;
use crate::torrent::Torrent;
use crate::utils::{format_timestamp, jst_now};
use anyhow::Result;
use log::info;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sentinel: when present under the save root, the payload download is
/// skipped without touching the network.
pub const SKIP_SENTINEL: &str = ".download_skip";

/// Acquires the full payload under `save_root` and returns its path; the
/// result is the reference file the binary check runs against. Already
/// complete payloads (by byte size) short-circuit.
pub fn fetch_payload(
    session: &mut Session,
    torrent: &Torrent,
    save_root: &Path,
    poll_interval: Duration,
) -> Result<PathBuf> {
    let target = save_root.join(torrent.name());

    if save_root.join(SKIP_SENTINEL).exists() {
        info!("{} present, skipping payload download", SKIP_SENTINEL);
        return Ok(target);
    }
    if let Some(size) = path_size(&target) {
        if size == torrent.total_size() {
            info!("payload already complete at {}", target.display());
            return Ok(target);
        }
    }

    std::fs::create_dir_all(save_root)?;
    let mut handle = session.attach(torrent, save_root)?;
    info!("starting {}", torrent.name());

    loop {
        let status = handle.status();
        if status.is_seeding {
            break;
        }
        log_progress(&status);
        std::thread::sleep(poll_interval);
    }

    info!("complete {}", torrent.name());
    info!(
        "File Hash: {}, File size: {}, Time: {}",
        torrent.info_hash_hex(),
        torrent.total_size(),
        format_timestamp(&jst_now())
    );
    Ok(target)
}

fn log_progress(status: &TorrentStatus) {
    info!(
        "downloading: {:.2}% complete (down: {:.1} kB/s, up: {:.1} kB/s, peers: {}) {}",
        status.progress * 100.0,
        status.download_rate / 1000.0,
        status.upload_rate / 1000.0,
        status.num_peers,
        status.state
    );
}

/// Byte size of a file, or the recursive sum for a directory. None when the
/// path does not exist.
fn path_size(path: &Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    if metadata.is_file() {
        return Some(metadata.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path).ok()? {
        let entry = entry.ok()?;
        total += path_size(&entry.path())?;
    }
    Some(total)
}
