use crate::bitfield::BitField;
use crate::peer::handshake::{Handshake, HANDSHAKE_LEN};
use crate::peer::message::Message;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const TOKEN: Token = Token(0);
/// sanity cap on a single wire frame (a block message is ~16 KiB)
const MAX_FRAME: usize = 1024 * 1024;

/// One outbound peer connection, driven by [`Connection::pump`]. All I/O is
/// non-blocking; unread wire bytes and unsent frames sit in the buffers
/// between pumps.
pub struct Connection {
    pub addr: SocketAddr,
    stream: TcpStream,
    poll: Poll,
    events: Events,
    inbuf: BytesMut,
    outbuf: BytesMut,
    info_hash: [u8; 20],
    /// the peer id of the remote peer (recv in handshake)
    pub peer_id: [u8; 20],
    pub handshaken: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub bitfield: BitField,
    closed: bool,
    last_activity: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("handshaken", &self.handshaken)
            .field("am_interested", &self.am_interested)
            .field("peer_choking", &self.peer_choking)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    /// Starts a non-blocking connect and queues our handshake. The peer is
    /// not reachable yet when this returns; pump until `handshaken`.
    pub fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        my_id: [u8; 20],
        num_pieces: usize,
    ) -> io::Result<Connection> {
        let poll = Poll::new()?;
        let mut stream = TcpStream::connect(addr)?;
        poll.registry()
            .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)?;

        let mut outbuf = BytesMut::new();
        outbuf.extend_from_slice(&Handshake::new(info_hash, my_id).to_bytes());

        log::debug!("connecting to {:?}", addr);

        Ok(Connection {
            addr,
            stream,
            poll,
            events: Events::with_capacity(64),
            inbuf: BytesMut::new(),
            outbuf,
            info_hash,
            peer_id: [0; 20],
            handshaken: false,
            am_interested: false,
            peer_choking: true,
            bitfield: BitField::empty(num_pieces),
            closed: false,
            last_activity: Instant::now(),
        })
    }

    /// Polls the socket once, flushes queued frames, drains readable bytes
    /// and returns every complete message that arrived. Choke state and the
    /// peer's bitfield are tracked internally; I/O errors close the
    /// connection instead of propagating.
    pub fn pump(&mut self, timeout: Duration) -> Vec<Message> {
        if self.closed {
            return Vec::new();
        }
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            log::debug!("poll failed for {:?}: {}", self.addr, err);
            self.closed = true;
            return Vec::new();
        }

        let mut readable = false;
        let mut writable = false;
        for event in self.events.iter() {
            if event.token() == TOKEN {
                readable |= event.is_readable();
                writable |= event.is_writable();
            }
        }

        if writable {
            match self.stream.take_error() {
                Ok(None) => {}
                Ok(Some(err)) | Err(err) => {
                    log::debug!("connect to {:?} failed: {}", self.addr, err);
                    self.closed = true;
                    return Vec::new();
                }
            }
            self.try_flush();
        }
        if readable {
            self.fill_inbuf();
        }
        self.parse_frames()
    }

    /// Queues a frame and flushes as much as the socket will take.
    pub fn send(&mut self, message: &Message) {
        if self.closed {
            return;
        }
        self.outbuf.extend_from_slice(&message.serialize());
        self.try_flush();
    }

    pub fn send_interested(&mut self) {
        if !self.am_interested {
            self.send(&Message::Interested);
            self.am_interested = true;
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn is_seed(&self) -> bool {
        self.bitfield.is_complete()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn close(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn try_flush(&mut self) {
        while !self.outbuf.is_empty() {
            match self.stream.write(&self.outbuf) {
                Ok(0) => {
                    self.closed = true;
                    return;
                }
                Ok(n) => {
                    self.outbuf.advance(n);
                    self.last_activity = Instant::now();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::NotConnected => return,
                Err(err) => {
                    log::debug!("write to {:?} failed: {}", self.addr, err);
                    self.closed = true;
                    return;
                }
            }
        }
    }

    fn fill_inbuf(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return;
                }
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    self.last_activity = Instant::now();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("read from {:?} failed: {}", self.addr, err);
                    self.closed = true;
                    return;
                }
            }
        }
    }

    fn parse_frames(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        loop {
            if !self.handshaken {
                if self.inbuf.len() < HANDSHAKE_LEN {
                    break;
                }
                match Handshake::from_bytes(&self.inbuf[..HANDSHAKE_LEN]) {
                    Ok(handshake) if handshake.check(&self.info_hash) => {
                        self.peer_id = handshake.peer_id;
                        self.handshaken = true;
                        self.inbuf.advance(HANDSHAKE_LEN);
                        log::debug!("handshake with {:?} ok", self.addr);
                    }
                    _ => {
                        log::debug!("handshake with {:?} rejected", self.addr);
                        self.close();
                        break;
                    }
                }
                continue;
            }

            if self.inbuf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes(self.inbuf[..4].try_into().unwrap()) as usize;
            if len > MAX_FRAME {
                log::debug!("oversized frame ({} bytes) from {:?}", len, self.addr);
                self.close();
                break;
            }
            if self.inbuf.len() < 4 + len {
                break;
            }
            self.inbuf.advance(4);
            let payload = self.inbuf.split_to(len);
            match Message::parse(&payload) {
                Ok(message) => {
                    self.note(&message);
                    messages.push(message);
                }
                Err(err) => {
                    log::debug!("bad frame from {:?}: {}", self.addr, err);
                    self.close();
                    break;
                }
            }
        }
        messages
    }

    fn note(&mut self, message: &Message) {
        match message {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Have(index) => self.bitfield.set(*index as usize),
            Message::Bitfield(payload) => {
                self.bitfield = BitField::from_payload(payload.clone(), self.bitfield.len());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::thread;

    /// Accepts one connection, answers the handshake, advertises a complete
    /// bitfield and unchokes.
    fn spawn_greeter(info_hash: [u8; 20], num_pieces: usize) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).unwrap();

            stream
                .write_all(&Handshake::new(info_hash, [3u8; 20]).to_bytes())
                .unwrap();
            let full = vec![0xffu8; (num_pieces + 7) / 8];
            stream
                .write_all(&Message::Bitfield(full).serialize())
                .unwrap();
            stream.write_all(&Message::Unchoke.serialize()).unwrap();

            // hold the socket open until the peer hangs up
            let mut sink = [0u8; 256];
            while let Ok(n) = stream.read(&mut sink) {
                if n == 0 {
                    break;
                }
            }
        });
        addr
    }

    #[test]
    fn test_handshake_and_bitfield_over_loopback() {
        let info_hash = [5u8; 20];
        let addr = spawn_greeter(info_hash, 4);
        let mut conn = Connection::connect(addr, info_hash, [1u8; 20], 4).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saw_unchoke = false;
        while Instant::now() < deadline && !(conn.handshaken && saw_unchoke) {
            for message in conn.pump(Duration::from_millis(20)) {
                if message == Message::Unchoke {
                    saw_unchoke = true;
                }
            }
        }

        assert!(conn.handshaken);
        assert!(saw_unchoke);
        assert!(!conn.peer_choking);
        assert!(conn.is_seed());
        assert_eq!(conn.peer_id, [3u8; 20]);
        conn.close();
    }

    #[test]
    fn test_wrong_info_hash_closes() {
        let addr = spawn_greeter([5u8; 20], 4);
        let mut conn = Connection::connect(addr, [6u8; 20], [1u8; 20], 4).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && conn.is_open() {
            conn.pump(Duration::from_millis(20));
        }
        assert!(!conn.is_open());
        assert!(!conn.handshaken);
    }
}
