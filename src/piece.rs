use crate::protocol::PeerId;

/// Size of a requested block, except a possibly shorter final one
pub const BLOCK_LEN: usize = 16 * 1024;

/// Availability of a piece as seen by this session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PieceStatus {
    /// No peer has advertised the piece
    NotAvailable = 0,
    /// At least one peer advertised it
    Available = 1,
    /// A download attempt is in progress
    Started = 2,
    /// Downloaded and verified
    Complete = 3,
}

impl PieceStatus {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => PieceStatus::Available,
            2 => PieceStatus::Started,
            3 => PieceStatus::Complete,
            _ => PieceStatus::NotAvailable,
        }
    }
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: usize,
    pub status: PieceStatus,
    /// Peer that first advertised the piece (attribution only)
    pub peer: Option<PeerId>,
}

/// Represents the current state of a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    NotDownloaded,
    Downloaded,
}

/// A contiguous block of data within a piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Offset (in bytes) from the start of the piece
    pub offset: usize,
    /// Length of the block in bytes
    pub length: usize,
    pub state: BlockState,
}

/// Splits a piece into `BLOCK_LEN` blocks. The last block carries the
/// remainder when `piece_length` is not a multiple of `BLOCK_LEN`.
pub fn partition(piece_length: usize) -> Vec<Block> {
    (0..piece_length)
        .step_by(BLOCK_LEN)
        .map(|off| Block {
            offset: off,
            length: std::cmp::min(BLOCK_LEN, piece_length - off),
            state: BlockState::NotDownloaded,
        })
        .collect()
}
