use crate::torrent::Torrent;
use sha1::{Digest, Sha1};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// SHA-1 over the piece bytes.
pub fn digest(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashCheck {
    Ok,
    Mismatch,
    Empty,
}

/// Compares the observed SHA-1 with the digest the torrent declares for
/// piece `index`.
pub fn verify_against_torrent(bytes: &[u8], index: usize, torrent: &Torrent) -> HashCheck {
    if bytes.is_empty() {
        return HashCheck::Empty;
    }
    if digest(bytes) == torrent.hash_for_piece(index) {
        HashCheck::Ok
    } else {
        HashCheck::Mismatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryCheck {
    Matched,
    Mismatch,
    Uncheckable,
}

/// Compares the piece bytes with the corresponding slice of the reference
/// payload. The hash check proves the bytes match what the torrent claims;
/// this one proves the torrent claims the real payload.
///
/// A missing reference is `Uncheckable`, not a failure.
pub fn binary_match(
    bytes: &[u8],
    index: usize,
    torrent: &Torrent,
    reference: Option<&Path>,
) -> BinaryCheck {
    let Some(path) = reference else {
        return BinaryCheck::Uncheckable;
    };
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) => {
            log::warn!("reference payload {} unreadable: {}", path.display(), err);
            return BinaryCheck::Uncheckable;
        }
    };

    let offset = index as u64 * torrent.piece_length().max(0) as u64;
    let mut slice = vec![0u8; bytes.len()];
    let matched = file
        .seek(SeekFrom::Start(offset))
        .and_then(|_| file.read_exact(&mut slice))
        .is_ok()
        && slice == bytes;
    if matched {
        BinaryCheck::Matched
    } else {
        BinaryCheck::Mismatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::testing::make_torrent;
    use std::io::Write;

    const ANNOUNCE: &str = "http://tracker.test/announce";

    #[test]
    fn test_digest_known_vector() {
        // sha1("abc")
        assert_eq!(
            crate::utils::hex(&digest(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_verify_against_torrent() {
        let payload = b"0123456789abcdefXYZW0123456789ab".to_vec();
        let torrent = make_torrent("v", 16, &payload, ANNOUNCE);

        assert_eq!(
            verify_against_torrent(&payload[16..32], 1, &torrent),
            HashCheck::Ok
        );
        assert_eq!(
            verify_against_torrent(&payload[0..16], 1, &torrent),
            HashCheck::Mismatch
        );
        assert_eq!(verify_against_torrent(&[], 1, &torrent), HashCheck::Empty);
    }

    #[test]
    fn test_binary_match() {
        let payload = b"0123456789abcdefXYZW0123456789ab".to_vec();
        let torrent = make_torrent("b", 16, &payload, ANNOUNCE);

        let mut reference = tempfile::NamedTempFile::new().unwrap();
        reference.write_all(&payload).unwrap();
        reference.flush().unwrap();

        assert_eq!(
            binary_match(&payload[16..32], 1, &torrent, Some(reference.path())),
            BinaryCheck::Matched
        );
        assert_eq!(
            binary_match(b"xxxxxxxxxxxxxxxx", 1, &torrent, Some(reference.path())),
            BinaryCheck::Mismatch
        );
        assert_eq!(
            binary_match(&payload[16..32], 1, &torrent, None),
            BinaryCheck::Uncheckable
        );
    }

    #[test]
    fn test_binary_match_short_reference() {
        let payload = b"0123456789abcdefXYZW".to_vec();
        let torrent = make_torrent("s", 16, &payload, ANNOUNCE);

        let mut reference = tempfile::NamedTempFile::new().unwrap();
        reference.write_all(&payload[..8]).unwrap();
        reference.flush().unwrap();

        // reference truncated before the requested slice
        assert_eq!(
            binary_match(&payload[0..16], 0, &torrent, Some(reference.path())),
            BinaryCheck::Mismatch
        );
    }
}
