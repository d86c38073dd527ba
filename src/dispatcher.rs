use tracing::{debug, trace};

use crate::error::ApplicationError;
use crate::peer::PeerState;
use crate::protocol::{Handshake, InfoHash, Message};
use crate::registry::PieceRegistry;

/// Piece indices whose bit is set, most-significant bit of each byte first.
pub fn bitfield_indices(bits: &[u8]) -> impl Iterator<Item = usize> + '_ {
    bits.iter().enumerate().flat_map(|(i, byte)| {
        (0..8)
            .filter(move |&bit| byte & (0b1000_0000u8 >> bit) != 0)
            .map(move |bit| i * 8 + bit)
    })
}

/// Applies received messages to a peer's state and the piece registry.
pub struct Dispatcher<'a> {
    registry:  &'a PieceRegistry,
    info_hash: InfoHash,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a PieceRegistry, info_hash: InfoHash) -> Self {
        Self {
            registry,
            info_hash,
        }
    }

    /// Walks `buf` message by message. With `has_handshake` the buffer
    /// starts with a handshake record.
    ///
    /// Fails on the first malformed or unknown message; messages before it
    /// have already taken effect.
    pub fn dispatch(
        &self,
        mut buf: &[u8],
        has_handshake: bool,
        peer: &mut PeerState,
    ) -> Result<(), ApplicationError> {
        if has_handshake {
            let handshake = Handshake::read_from(&mut buf)?;
            if handshake.info_hash != self.info_hash {
                return Err(ApplicationError::protocol(format!(
                    "info hash mismatch: expected {}, got {}",
                    self.info_hash, handshake.info_hash
                )));
            }
            debug!(peer_id = %handshake.peer_id, "got handshake");
            peer.peer_id = Some(handshake.peer_id);
        }

        while !buf.is_empty() {
            let message = Message::read_from(&mut buf)?;
            self.apply(message, peer)?;
        }

        Ok(())
    }

    fn apply(&self, message: Message, peer: &mut PeerState) -> Result<(), ApplicationError> {
        match message {
            Message::Bitfield(bits) => {
                self.apply_bitfield(&bits, peer)?;
            }
            Message::Have(index) => {
                let index = index as usize;
                if index >= self.registry.len() {
                    return Err(ApplicationError::protocol(format!(
                        "have for piece {} but torrent has {} pieces",
                        index,
                        self.registry.len()
                    )));
                }
                self.registry.mark_available(index, peer.peer_id)?;
                peer.has_pieces = true;
                debug!(index, "got have");
            }
            Message::Unchoke => {
                peer.unchoked = true;
                debug!("got unchoke");
            }
            Message::Choke => {
                peer.unchoked = false;
                debug!("got choke");
            }
            // Serving peers is not implemented; these only get logged.
            Message::Interested
            | Message::NotInterested
            | Message::Request { .. }
            | Message::Cancel { .. }
            | Message::KeepAlive => {
                trace!(?message, "ignored");
            }
            // Piece payloads are streamed by the downloader and never
            // reach this path in practice.
            Message::Piece { index, begin, .. } => {
                trace!(index, begin, "ignored piece outside download");
            }
        }
        Ok(())
    }

    fn apply_bitfield(&self, bits: &[u8], peer: &mut PeerState) -> Result<(), ApplicationError> {
        let indices: Vec<usize> = bitfield_indices(bits).collect();

        // Reject the whole message before touching the registry.
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.registry.len()) {
            return Err(ApplicationError::protocol(format!(
                "bitfield sets bit {} but torrent has {} pieces",
                bad,
                self.registry.len()
            )));
        }

        for &index in &indices {
            self.registry.mark_available(index, peer.peer_id)?;
        }

        if !indices.is_empty() {
            peer.has_pieces = true;
        }
        debug!(pieces = indices.len(), "got bitfield");
        Ok(())
    }
}
