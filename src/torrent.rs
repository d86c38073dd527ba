use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

use crate::error::ApplicationError;
use crate::peer::Peer;
use crate::protocol::{InfoHash, PeerId};

/// Client prefix used when the metadata carries no peer id of our own
const PEER_ID_PREFIX: &[u8; 8] = b"-PW0001-";

/// On-disk layout of the metadata file
#[derive(Debug, Serialize, Deserialize)]
struct RawMetadata {
    info_hash: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    our_peer_id: Option<ByteBuf>,
    num_of_pieces: i64,
    piece_length: i64,
    /// Concatenated 20-byte SHA-1 hashes, one per piece
    pieces: ByteBuf,
    peers: Vec<RawPeer>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawPeer {
    ip:   String,
    port: i64,
}

/// Everything a session needs to know about the torrent and its peers
#[derive(Debug, Clone)]
pub struct Metadata {
    pub info_hash:     InfoHash,
    pub our_peer_id:   PeerId,
    pub num_of_pieces: usize,
    pub piece_length:  usize,
    pub piece_hashes:  Vec<[u8; 20]>,
    pub peers:         Vec<Peer>,
}

fn id20(bytes: &[u8], field: &str) -> Result<[u8; 20], ApplicationError> {
    bytes.try_into().map_err(|_| {
        ApplicationError::ParserError(format!(
            "{} must be 20 bytes, got {}",
            field,
            bytes.len()
        ))
    })
}

/// A positive metadata integer that fits a u32 wire field.
fn wire_count(value: i64, field: &str) -> Result<usize, ApplicationError> {
    match u32::try_from(value) {
        Ok(v) if v > 0 => usize::try_from(v).map_err(|_| {
            ApplicationError::ParserError(format!("{} {} too large", field, value))
        }),
        _ => Err(ApplicationError::ParserError(format!(
            "{} must be in 1..={}, got {}",
            field,
            u32::MAX,
            value
        ))),
    }
}

/// Random `-PW0001-` prefixed peer id
pub fn generate_peer_id() -> PeerId {
    const DIGITS: &[u8] = b"0123456789";
    let mut rng = rand::thread_rng();
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    for b in &mut id[8..] {
        *b = DIGITS[rng.gen_range(0..DIGITS.len())];
    }
    PeerId(id)
}

impl Metadata {
    /// Reads a bencoded metadata file from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ApplicationError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| {
            ApplicationError::ResourceError(format!("{}: {}", path.display(), e))
        })?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ApplicationError> {
        let raw: RawMetadata = serde_bencode::from_bytes(data)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let info_hash = InfoHash(id20(&raw.info_hash, "info_hash")?);
        let our_peer_id = match &raw.our_peer_id {
            Some(id) => PeerId(id20(id, "our_peer_id")?),
            None => generate_peer_id(),
        };

        // Piece indices and block offsets travel as u32 on the wire.
        let num_of_pieces = wire_count(raw.num_of_pieces, "num_of_pieces")?;
        let piece_length = wire_count(raw.piece_length, "piece_length")?;

        let expected = num_of_pieces.checked_mul(20).ok_or_else(|| {
            ApplicationError::ParserError(format!("{} piece hashes overflow", num_of_pieces))
        })?;
        if raw.pieces.len() != expected {
            return Err(ApplicationError::ParserError(format!(
                "expected {} piece hashes, got {} bytes",
                num_of_pieces,
                raw.pieces.len()
            )));
        }
        let piece_hashes = raw
            .pieces
            .chunks_exact(20)
            .map(|chunk| id20(chunk, "piece hash"))
            .collect::<Result<Vec<_>, _>>()?;

        let peers = raw
            .peers
            .iter()
            .map(|p| {
                let ip = p.ip.parse::<IpAddr>().map_err(|e| {
                    ApplicationError::ParserError(format!("peer ip {:?}: {}", p.ip, e))
                })?;
                let port = u16::try_from(p.port).map_err(|_| {
                    ApplicationError::ParserError(format!("peer port {} out of range", p.port))
                })?;
                Ok(Peer { ip, port })
            })
            .collect::<Result<Vec<_>, ApplicationError>>()?;

        Ok(Self {
            info_hash,
            our_peer_id,
            num_of_pieces,
            piece_length,
            piece_hashes,
            peers,
        })
    }

    /// Size of the store backing this torrent
    pub fn total_size(&self) -> u64 {
        (self.num_of_pieces as u64).saturating_mul(self.piece_length as u64)
    }

    pub fn log_info(&self) {
        info!(
            info_hash = %self.info_hash,
            our_peer_id = %self.our_peer_id,
            pieces = self.num_of_pieces,
            piece_length = self.piece_length,
            total_size = self.total_size(),
            peers = self.peers.len(),
            "metadata loaded"
        );
    }
}
