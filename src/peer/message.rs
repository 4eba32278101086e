use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Error, ErrorKind, Read};

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    /// Full wire frame: 4-byte big-endian length prefix followed by the
    /// message payload (id + body).
    pub fn serialize(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::KeepAlive => {}
            Message::Choke => payload.push(0),
            Message::Unchoke => payload.push(1),
            Message::Interested => payload.push(2),
            Message::NotInterested => payload.push(3),
            Message::Have(index) => {
                payload.push(4);
                payload.write_u32::<BigEndian>(*index).unwrap();
            }
            Message::Bitfield(bitfield) => {
                payload.push(5);
                payload.extend_from_slice(bitfield);
            }
            Message::Request(index, begin, length) => {
                payload.push(6);
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.write_u32::<BigEndian>(*length).unwrap();
            }
            Message::Piece(index, begin, block) => {
                payload.push(7);
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.extend_from_slice(block);
            }
            Message::Cancel(index, begin, length) => {
                payload.push(8);
                payload.write_u32::<BigEndian>(*index).unwrap();
                payload.write_u32::<BigEndian>(*begin).unwrap();
                payload.write_u32::<BigEndian>(*length).unwrap();
            }
            Message::Port(port) => {
                payload.push(9);
                payload.write_u16::<BigEndian>(*port).unwrap();
            }
        }
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.write_u32::<BigEndian>(payload.len() as u32).unwrap();
        frame.extend_from_slice(&payload);
        frame
    }

    /// Parses a message payload, i.e. a frame with the length prefix already
    /// stripped. An empty payload is a keep-alive.
    pub fn parse(payload: &[u8]) -> Result<Message, Error> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = payload[0];
        let mut body = Cursor::new(&payload[1..]);
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                expect_len(payload, 5, "Have")?;
                Message::Have(body.read_u32::<BigEndian>()?)
            }
            5 => Message::Bitfield(payload[1..].to_vec()),
            6 => {
                expect_len(payload, 13, "Request")?;
                Message::Request(
                    body.read_u32::<BigEndian>()?,
                    body.read_u32::<BigEndian>()?,
                    body.read_u32::<BigEndian>()?,
                )
            }
            7 => {
                if payload.len() < 9 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "Piece message should be at least 9 bytes long",
                    ));
                }
                let index = body.read_u32::<BigEndian>()?;
                let begin = body.read_u32::<BigEndian>()?;
                let mut block = Vec::new();
                body.read_to_end(&mut block)?;
                Message::Piece(index, begin, block)
            }
            8 => {
                expect_len(payload, 13, "Cancel")?;
                Message::Cancel(
                    body.read_u32::<BigEndian>()?,
                    body.read_u32::<BigEndian>()?,
                    body.read_u32::<BigEndian>()?,
                )
            }
            9 => {
                expect_len(payload, 3, "Port")?;
                Message::Port(body.read_u16::<BigEndian>()?)
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("Unknown message id {}", id),
                ))
            }
        };
        Ok(msg)
    }

    pub fn id(&self) -> u8 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request(_, _, _) => 6,
            Message::Piece(_, _, _) => 7,
            Message::Cancel(_, _, _) => 8,
            Message::Port(_) => 9,
        }
    }
}

fn expect_len(payload: &[u8], len: usize, what: &str) -> Result<(), Error> {
    if payload.len() != len {
        return Err(Error::new(
            ErrorKind::InvalidData,
            format!("{} message should be {} bytes long", what, len),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let frame = msg.serialize();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(Message::parse(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn test_message_keep_alive() {
        let msg = Message::KeepAlive;
        assert_eq!(msg.serialize(), vec![0, 0, 0, 0]);
        round_trip(msg);
    }

    #[test]
    fn test_message_choke() {
        let msg = Message::Choke;
        assert_eq!(msg.serialize(), vec![0, 0, 0, 1, 0]);
        round_trip(msg);
    }

    #[test]
    fn test_message_have() {
        let msg = Message::Have(0x01020304);
        assert_eq!(msg.serialize(), vec![0, 0, 0, 5, 4, 1, 2, 3, 4]);
        round_trip(msg);
    }

    #[test]
    fn test_message_request() {
        round_trip(Message::Request(2, 16384, 16384));
    }

    #[test]
    fn test_message_piece() {
        round_trip(Message::Piece(3, 0, vec![0xaa; 16384]));
    }

    #[test]
    fn test_large_bitfield_length_prefix() {
        // frames longer than 255 bytes must still carry the right length
        let msg = Message::Bitfield(vec![0xff; 1000]);
        let frame = msg.serialize();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap());
        assert_eq!(len, 1001);
        round_trip(msg);
    }

    #[test]
    fn test_parse_rejects_unknown_id() {
        assert!(Message::parse(&[42]).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_request() {
        assert!(Message::parse(&[6, 0, 0]).is_err());
    }
}
