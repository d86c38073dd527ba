use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ApplicationError;
use crate::piece::{Piece, PieceStatus};
use crate::protocol::PeerId;

struct Slot {
    status: AtomicU8,
    peer: OnceLock<PeerId>,
}

/// Session-scoped availability table, one entry per piece index.
///
/// Every transition is a compare-and-set on the entry's status, so several
/// sessions can share one registry behind an `Arc`.
pub struct PieceRegistry {
    slots: Vec<Slot>,
}

impl PieceRegistry {
    pub fn new(num_of_pieces: usize) -> Self {
        let slots = (0..num_of_pieces)
            .map(|_| Slot {
                status: AtomicU8::new(PieceStatus::NotAvailable as u8),
                peer: OnceLock::new(),
            })
            .collect();

        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: usize) -> Result<&Slot, ApplicationError> {
        self.slots.get(index).ok_or_else(|| {
            ApplicationError::protocol(format!(
                "piece index {} out of range ({} pieces)",
                index,
                self.slots.len()
            ))
        })
    }

    pub fn status(&self, index: usize) -> Option<PieceStatus> {
        self.slots
            .get(index)
            .map(|s| PieceStatus::from_u8(s.status.load(Ordering::Acquire)))
    }

    pub fn get(&self, index: usize) -> Option<Piece> {
        self.slots.get(index).map(|s| Piece {
            index,
            status: PieceStatus::from_u8(s.status.load(Ordering::Acquire)),
            peer: s.peer.get().copied(),
        })
    }

    /// NotAvailable -> Available. The first peer to advertise the piece is
    /// recorded; later advertisements leave it untouched. Returns whether
    /// this call made the transition.
    pub fn mark_available(
        &self,
        index: usize,
        peer: Option<PeerId>,
    ) -> Result<bool, ApplicationError> {
        let slot = self.slot(index)?;
        // Attribution goes first so readers never see Available without it.
        if let Some(peer) = peer {
            let _ = slot.peer.set(peer);
        }
        Ok(Self::transition(slot, PieceStatus::NotAvailable, PieceStatus::Available))
    }

    /// Available -> Started, reserving the piece for one download attempt.
    pub fn claim(&self, index: usize) -> Result<bool, ApplicationError> {
        let slot = self.slot(index)?;
        Ok(Self::transition(slot, PieceStatus::Available, PieceStatus::Started))
    }

    /// Started -> Complete.
    pub fn complete(&self, index: usize) -> Result<bool, ApplicationError> {
        let slot = self.slot(index)?;
        Ok(Self::transition(slot, PieceStatus::Started, PieceStatus::Complete))
    }

    /// Started -> Available, after a failed attempt.
    pub fn release(&self, index: usize) -> Result<bool, ApplicationError> {
        let slot = self.slot(index)?;
        Ok(Self::transition(slot, PieceStatus::Started, PieceStatus::Available))
    }

    fn transition(slot: &Slot, from: PieceStatus, to: PieceStatus) -> bool {
        slot.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Indices currently in the Available state, ascending.
    pub fn available(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.status(i) == Some(PieceStatus::Available))
            .collect()
    }

    pub fn count(&self, status: PieceStatus) -> usize {
        (0..self.slots.len())
            .filter(|&i| self.status(i) == Some(status))
            .count()
    }
}
