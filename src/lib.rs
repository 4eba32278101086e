pub mod bitfield;

pub mod config;
pub mod download;
pub mod engine;
pub mod enumerate;
pub mod evidence;
pub mod filter;
pub mod probe;
pub mod session;
pub mod torrent;
pub mod utils;
pub mod verify;
pub mod tracker {
    pub mod http;
}

pub mod peer {
    pub mod connection;
    pub mod handshake;
    pub mod message;
}

pub mod lookup {
    pub mod public_ip;
    pub mod whois;
}

/// Engine polls before a probe or the enumerator gives up.
pub const RETRY_COUNTER: usize = 10;
