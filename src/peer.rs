use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::protocol::PeerId;

/// Represents a peer in the BitTorrent network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip:   IpAddr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

/// What we know about the remote side of one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerState {
    /// The peer is willing to serve our requests
    pub unchoked:   bool,
    /// The peer advertised at least one piece
    pub has_pieces: bool,
    /// Filled in from the peer's handshake
    pub peer_id:    Option<PeerId>,
}

impl PeerState {
    pub fn new() -> Self {
        Self::default()
    }
}
