use crate::enumerate::Peer;
use crate::evidence::{EvidenceMeta, EvidenceWriter};
use crate::session::Session;
use crate::torrent::Torrent;
use crate::utils::jst_now;
use crate::verify::{self, BinaryCheck, HashCheck};
use crate::RETRY_COUNTER;
use anyhow::Result;
use chrono::{DateTime, FixedOffset};
use log::{debug, info, warn};
use rand::{Rng, RngCore};
use std::path::Path;
use std::time::Duration;

/// Outcome of one probe. The wire strings and filename prefixes these map
/// to are fixed by the evidence format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Ok,
    /// nothing (or an empty buffer) arrived inside the drain window
    Blank,
    /// bytes arrived but their SHA-1 is not the torrent's declared digest
    HashMismatch,
    /// digest fine, content differs from the reference payload
    BinaryMismatch,
}

impl PieceStatus {
    pub fn file_prefix(&self) -> &'static str {
        match self {
            PieceStatus::Ok => "",
            PieceStatus::Blank => "BLANK_",
            PieceStatus::HashMismatch => "FALSE_",
            PieceStatus::BinaryMismatch => "INVALID_",
        }
    }

    /// Annotation appended to the log line, empty on success.
    pub fn log_note(&self) -> &'static str {
        match self {
            PieceStatus::Ok => "",
            PieceStatus::Blank => " エラー：ピースダウンロード失敗",
            PieceStatus::HashMismatch => " エラー：ピースハッシュ不一致",
            PieceStatus::BinaryMismatch => " エラー：バイナリ不一致",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PieceStatus::Ok)
    }
}

/// What one probe attests: this peer served this piece at this time.
#[derive(Debug)]
pub struct PieceRecord {
    pub peer: Peer,
    pub piece_index: usize,
    /// piece bytes as received; None when nothing usable arrived
    pub bytes: Option<Vec<u8>>,
    pub declared_digest: [u8; 20],
    pub observed_digest: Option<[u8; 20]>,
    pub status: PieceStatus,
    /// sampled the instant the alert drain ended, not at emit time
    pub completed_at: DateTime<FixedOffset>,
}

/// Downloads exactly one piece from exactly one peer and writes exactly one
/// evidence entry.
///
/// The narrowed filter (baseline + this peer) is installed before the
/// torrent is attached, hence before any read; stale alerts from earlier
/// probes are discarded first. The torrent is attached under a throwaway
/// directory so the piece can only come off the wire, never from a local
/// copy of the payload.
#[allow(clippy::too_many_arguments)]
pub fn probe_peer(
    session: &mut Session,
    torrent: &Torrent,
    peer: &Peer,
    reference: Option<&Path>,
    meta: &EvidenceMeta,
    writer: &EvidenceWriter,
    rng: &mut dyn RngCore,
    poll_interval: Duration,
) -> Result<PieceRecord> {
    session.drain_stale_alerts();
    session.narrow_to_peer(peer.addr);

    let scratch = tempfile::tempdir()?;
    let mut handle = session.attach(torrent, scratch.path())?;

    let piece_index = rng.gen_range(0..torrent.num_pieces());
    let mut priorities = vec![0u8; torrent.num_pieces()];
    priorities[piece_index] = 1;
    handle.prioritize_pieces(&priorities);
    handle.read_piece(piece_index);
    info!("probing {} for piece {}", peer, piece_index);

    let mut captured: Option<Vec<u8>> = None;
    for _ in 0..RETRY_COUNTER {
        std::thread::sleep(poll_interval);
        if let Some(buffer) = session.drain_piece_alerts(piece_index) {
            debug!("piece read");
            captured = Some(buffer);
            break;
        }
    }
    let completed_at = jst_now();

    let declared_digest = torrent.hash_for_piece(piece_index);
    let (status, observed_digest) = match &captured {
        None => (PieceStatus::Blank, None),
        Some(bytes) => match verify::verify_against_torrent(bytes, piece_index, torrent) {
            HashCheck::Empty => (PieceStatus::Blank, None),
            HashCheck::Mismatch => (PieceStatus::HashMismatch, Some(verify::digest(bytes))),
            HashCheck::Ok => {
                let observed = Some(verify::digest(bytes));
                match verify::binary_match(bytes, piece_index, torrent, reference) {
                    BinaryCheck::Mismatch => (PieceStatus::BinaryMismatch, observed),
                    BinaryCheck::Matched | BinaryCheck::Uncheckable => (PieceStatus::Ok, observed),
                }
            }
        },
    };
    if !status.is_ok() {
        warn!("probe of {}: {:?}", peer, status);
    }

    let record = PieceRecord {
        peer: peer.clone(),
        piece_index,
        bytes: match status {
            PieceStatus::Blank => None,
            _ => captured,
        },
        declared_digest,
        observed_digest,
        status,
        completed_at,
    };
    writer.append(&record, meta)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::torrent::testing::make_torrent;
    use rand::rngs::mock::StepRng;
    use std::io::Write;
    use std::path::PathBuf;

    const ANNOUNCE: &str = "http://127.0.0.1:6969/announce";

    fn payload() -> Vec<u8> {
        (0u8..64).collect()
    }

    fn peer() -> Peer {
        Peer {
            addr: "192.0.2.10".parse().unwrap(),
            port: 51413,
        }
    }

    fn meta() -> EvidenceMeta {
        EvidenceMeta {
            organization: "テスト組織".to_string(),
            payload_name: "payload.bin".to_string(),
            info_hash_hex: "aa".repeat(20),
            started_at: "2024-01-01 00:00:00".to_string(),
            version: "v1.0".to_string(),
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        reference: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let reference = root.path().join("payload.bin");
        let mut file = std::fs::File::create(&reference).unwrap();
        file.write_all(&payload()).unwrap();
        Fixture { root, reference }
    }

    fn run_probe(
        piece_source: Option<Box<dyn Fn(usize) -> Option<Vec<u8>>>>,
        fixture: &Fixture,
        piece_download: bool,
    ) -> (PieceRecord, std::rc::Rc<std::cell::RefCell<crate::engine::fake::FakeState>>) {
        let (engine, state) = FakeEngine::new();
        state.borrow_mut().piece_source = piece_source;
        let torrent = make_torrent("payload.bin", 16, &payload(), ANNOUNCE);
        let mut session = Session::open(Box::new(engine), &torrent);
        let writer = EvidenceWriter::new(fixture.root.path(), piece_download);
        let mut rng = StepRng::new(0, 1);
        let record = probe_peer(
            &mut session,
            &torrent,
            &peer(),
            Some(&fixture.reference),
            &meta(),
            &writer,
            &mut rng,
            Duration::ZERO,
        )
        .unwrap();
        (record, state)
    }

    fn log_path(fixture: &Fixture) -> PathBuf {
        fixture
            .root
            .path()
            .join("192.0.2.10_51413")
            .join(format!("192.0.2.10_51413_{}.log", "aa".repeat(20)))
    }

    #[test]
    fn test_happy_path() {
        let fixture = fixture();
        let payload = payload();
        let (record, state) = run_probe(
            Some(Box::new(move |i| Some(payload[i * 16..(i + 1) * 16].to_vec()))),
            &fixture,
            true,
        );

        assert!(record.status.is_ok());
        assert_eq!(record.observed_digest, Some(record.declared_digest));

        let state = state.borrow();
        assert_eq!(state.attach_count, 1);
        assert_eq!(state.reads, vec![record.piece_index]);
        // one-hot priority vector
        let priorities = &state.priorities[0];
        assert_eq!(priorities.iter().filter(|p| **p == 1).count(), 1);
        assert_eq!(priorities[record.piece_index], 1);

        // narrowed filter admits exactly tracker + peer
        let narrowed = state.filters.last().unwrap();
        assert!(narrowed.allows("192.0.2.10".parse().unwrap()));
        assert!(narrowed.allows("127.0.0.1".parse().unwrap()));
        assert!(!narrowed.allows("192.0.2.11".parse().unwrap()));
        assert!(!narrowed.allows("8.8.8.8".parse().unwrap()));

        // evidence on disk
        let csv = std::fs::read_to_string(fixture.root.path().join("peer.csv")).unwrap();
        assert_eq!(csv, "192.0.2.10,51413\n");
        let log = std::fs::read_to_string(log_path(&fixture)).unwrap();
        assert!(log.contains("組織名: テスト組織"));
        assert!(log.contains("---"));
        assert!(log.contains(&format!("piece{} 完了時刻: ", record.piece_index)));
        assert!(log.trim_end().ends_with("v1.0"));

        let bin = fixture.root.path().join("192.0.2.10_51413").join(format!(
            "{:05}_192.0.2.10_51413_{}.bin",
            record.piece_index,
            "aa".repeat(20)
        ));
        assert_eq!(
            std::fs::read(bin).unwrap(),
            record.bytes.clone().unwrap()
        );
    }

    #[test]
    fn test_pinned_rng_chooses_piece_zero() {
        let fixture = fixture();
        let payload = payload();
        let (record, _) = run_probe(
            Some(Box::new(move |i| Some(payload[i * 16..(i + 1) * 16].to_vec()))),
            &fixture,
            false,
        );
        assert_eq!(record.piece_index, 0);
    }

    #[test]
    fn test_hash_mismatch() {
        let fixture = fixture();
        let (record, _) = run_probe(
            Some(Box::new(|_| Some(vec![0xEE; 16]))),
            &fixture,
            true,
        );

        assert_eq!(record.status, PieceStatus::HashMismatch);
        assert_ne!(record.observed_digest, Some(record.declared_digest));

        let log = std::fs::read_to_string(log_path(&fixture)).unwrap();
        assert!(log.contains("エラー：ピースハッシュ不一致"));

        let bin = fixture.root.path().join("192.0.2.10_51413").join(format!(
            "FALSE_{:05}_192.0.2.10_51413_{}.bin",
            record.piece_index,
            "aa".repeat(20)
        ));
        assert!(bin.exists());
    }

    #[test]
    fn test_binary_mismatch() {
        let fixture = fixture();
        // poison the reference so the hash passes but the content check fails
        std::fs::write(&fixture.reference, vec![0u8; 64]).unwrap();
        let payload = payload();
        let (record, _) = run_probe(
            Some(Box::new(move |i| Some(payload[i * 16..(i + 1) * 16].to_vec()))),
            &fixture,
            true,
        );

        assert_eq!(record.status, PieceStatus::BinaryMismatch);
        let log = std::fs::read_to_string(log_path(&fixture)).unwrap();
        assert!(log.contains("エラー：バイナリ不一致"));

        let bin_dir = fixture.root.path().join("192.0.2.10_51413");
        let invalid = std::fs::read_dir(bin_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("INVALID_"));
        assert!(invalid);
    }

    #[test]
    fn test_timeout_is_blank() {
        let fixture = fixture();
        let (record, _) = run_probe(None, &fixture, true);

        assert_eq!(record.status, PieceStatus::Blank);
        assert!(record.bytes.is_none());
        assert!(record.observed_digest.is_none());

        let log = std::fs::read_to_string(log_path(&fixture)).unwrap();
        assert!(log.contains("エラー：ピースダウンロード失敗"));

        // no bytes file, even with piece_download enabled
        let bin_dir = fixture.root.path().join("192.0.2.10_51413");
        let bins = std::fs::read_dir(bin_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".bin"))
            .count();
        assert_eq!(bins, 0);
    }

    #[test]
    fn test_empty_capture_is_blank() {
        let fixture = fixture();
        let (record, _) = run_probe(Some(Box::new(|_| Some(Vec::new()))), &fixture, true);
        assert_eq!(record.status, PieceStatus::Blank);
        assert!(record.bytes.is_none());
    }

    #[test]
    fn test_delayed_alert_still_captured() {
        let fixture = fixture();
        let (engine, state) = FakeEngine::new();
        let payload_bytes = payload();
        {
            let mut state = state.borrow_mut();
            state.piece_source = Some(Box::new(move |i| {
                Some(payload_bytes[i * 16..(i + 1) * 16].to_vec())
            }));
            state.alert_delay = 5;
        }
        let torrent = make_torrent("payload.bin", 16, &payload(), ANNOUNCE);
        let mut session = Session::open(Box::new(engine), &torrent);
        let writer = EvidenceWriter::new(fixture.root.path(), false);
        let mut rng = StepRng::new(0, 1);
        let record = probe_peer(
            &mut session,
            &torrent,
            &peer(),
            Some(&fixture.reference),
            &meta(),
            &writer,
            &mut rng,
            Duration::ZERO,
        )
        .unwrap();
        assert!(record.status.is_ok());
    }

    #[test]
    fn test_second_probe_appends_without_second_header() {
        let fixture = fixture();
        let payload_a = payload();
        let payload_b = payload();
        let (_, _) = run_probe(
            Some(Box::new(move |i| {
                Some(payload_a[i * 16..(i + 1) * 16].to_vec())
            })),
            &fixture,
            false,
        );
        let (_, _) = run_probe(
            Some(Box::new(move |i| {
                Some(payload_b[i * 16..(i + 1) * 16].to_vec())
            })),
            &fixture,
            false,
        );

        let csv = std::fs::read_to_string(fixture.root.path().join("peer.csv")).unwrap();
        assert_eq!(csv.lines().count(), 1);

        let log = std::fs::read_to_string(log_path(&fixture)).unwrap();
        assert_eq!(log.matches("組織名:").count(), 1);
        assert_eq!(log.matches("完了時刻:").count(), 2);
    }
}
