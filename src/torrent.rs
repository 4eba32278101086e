use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;
use url::Url;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Node(String, i64);

/// a file can be single xor multi file torrent, if length is None, it's a multi file torrent, else it's a single file torrent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    /// The length of the file in bytes (integer)
    pub path: Vec<String>,
    /// The length of the file in bytes (integer)
    pub length: i64,
    /// (optional) a 32-character hexadecimal string corresponding to the MD5 sum of the file. This is not used by BitTorrent at all, but it is included by some programs for greater compatibility.
    #[serde(default)]
    pub md5sum: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    /// string consisting of the concatenation of all 20-byte SHA1 hash values, one per piece (byte string, i.e. not urlencoded)
    pub pieces: ByteBuf,
    /// number of bytes in each piece (integer)
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub files: Option<Vec<File>>,
    #[serde(default)]
    pub private: Option<u8>,
    #[serde(default)]
    pub path: Option<Vec<String>>,
    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Torrent {
    pub info: Info,
    #[serde(default)]
    /// The announce URL of the tracker (string)
    announce: Option<String>,
    /// (optional) this is an extension to the official specification, offering backwards-compatibility. (list of lists of strings).
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    httpseeds: Option<Vec<String>>,
    /// (optional) tiered tracker URLs, tried in order (list of lists of strings)
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    /// (optional) the creation time of the torrent, in standard UNIX epoch format (integer, seconds since 1-Jan-1970 00:00:00 UTC)
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    /// (optional) free-form textual comments of the author (string)
    #[serde(rename = "comment")]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

impl Torrent {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_bytes(bytes).context("failed to deserialize torrent")
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn info_hash(&self) -> [u8; 20] {
        let bytes = to_bytes(&self.info).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    pub fn info_hash_hex(&self) -> String {
        crate::utils::hex(&self.info_hash())
    }

    // if length is None, it's a multi file torrent, else it's a single file torrent
    pub fn length(&self) -> i64 {
        if let Some(length) = self.info.length {
            length
        } else {
            self.info
                .files
                .as_ref()
                .map(|files| files.iter().map(|f| f.length).sum())
                .unwrap_or(0)
        }
    }

    pub fn total_size(&self) -> u64 {
        self.length().max(0) as u64
    }

    pub fn piece_length(&self) -> i64 {
        self.info.piece_length
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Length in bytes of piece `index`, accounting for the short last piece.
    pub fn piece_size(&self, index: usize) -> usize {
        let piece_len = self.piece_length().max(0) as u64;
        let start = index as u64 * piece_len;
        let remaining = self.total_size().saturating_sub(start);
        remaining.min(piece_len) as usize
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut array = [0u8; 20];
                array.copy_from_slice(chunk);
                array
            })
            .collect()
    }

    /// Canonical SHA-1 digest the torrent declares for piece `index`.
    pub fn hash_for_piece(&self, index: usize) -> [u8; 20] {
        let mut array = [0u8; 20];
        array.copy_from_slice(&self.info.pieces[index * 20..index * 20 + 20]);
        array
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Every tracker URL the torrent carries: `announce` plus the flattened
    /// `announce-list` tiers, deduplicated, unparseable entries skipped.
    pub fn trackers(&self) -> Vec<Url> {
        let mut urls: Vec<Url> = Vec::new();
        let mut push = |raw: &str| {
            if let Ok(url) = Url::parse(raw) {
                if !urls.contains(&url) {
                    urls.push(url);
                }
            }
        };
        if let Some(announce) = &self.announce {
            push(announce);
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for raw in tier {
                    push(raw);
                }
            }
        }
        urls
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Fabricate a single-file torrent over `payload`, split into
    /// `piece_length`-byte pieces, without touching the filesystem.
    pub fn make_torrent(name: &str, piece_length: i64, payload: &[u8], announce: &str) -> Torrent {
        let mut pieces = Vec::new();
        for chunk in payload.chunks(piece_length as usize) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            let digest: [u8; 20] = hasher.finalize().into();
            pieces.extend_from_slice(&digest);
        }
        Torrent {
            info: Info {
                name: name.to_string(),
                pieces: ByteBuf::from(pieces),
                piece_length,
                md5sum: None,
                length: Some(payload.len() as i64),
                files: None,
                private: None,
                path: None,
                root_hash: None,
            },
            announce: Some(announce.to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        }
    }
}
