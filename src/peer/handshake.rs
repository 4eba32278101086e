use std::io::{Error, ErrorKind};

pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    /// string identifier of the protocol (19 bytes), e.g. "BitTorrent protocol"
    pub pstr: String,
    /// 8 reserved bytes; peers advertise extensions here, we ignore them
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    /// 20-byte string used as a unique ID for the client.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            pstr: "BitTorrent protocol".to_string(),
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, Error> {
        if bytes.len() < HANDSHAKE_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Handshake message should be at least 68 bytes long",
            ));
        }
        if bytes[0] != 19 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Handshake message should start with 19",
            ));
        }

        let pstr = String::from_utf8(bytes[1..20].to_vec())
            .map_err(|_| Error::new(ErrorKind::InvalidData, "protocol string is not utf-8"))?;
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Handshake {
            pstr,
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0; HANDSHAKE_LEN];
        bytes[0] = 19;
        bytes[1..20].copy_from_slice(self.pstr.as_bytes());
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// Same protocol, same swarm. Reserved bits are extension flags and do
    /// not participate in the check.
    pub fn check(&self, info_hash: &[u8]) -> bool {
        self.info_hash == info_hash && self.pstr == "BitTorrent protocol"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([7u8; 20], [9u8; 20]);
        let bytes = handshake.to_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        let parsed = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(handshake, parsed);
        assert!(parsed.check(&[7u8; 20]));
        assert!(!parsed.check(&[8u8; 20]));
    }

    #[test]
    fn test_handshake_rejects_short_input() {
        assert!(Handshake::from_bytes(&[19u8; 10]).is_err());
    }

    #[test]
    fn test_handshake_keeps_reserved_bits() {
        let mut handshake = Handshake::new([1u8; 20], [2u8; 20]);
        handshake.reserved = [0, 0, 0, 0, 0, 0x10, 0, 0];
        let parsed = Handshake::from_bytes(&handshake.to_bytes()).unwrap();
        assert_eq!(parsed.reserved[5], 0x10);
        assert!(parsed.check(&[1u8; 20]));
    }
}
