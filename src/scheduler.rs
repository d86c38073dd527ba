use rand::Rng;

use crate::piece::PieceStatus;
use crate::protocol::PeerId;
use crate::registry::PieceRegistry;

/// Random probes before falling back to a linear scan
pub const SCHEDULER_ATTEMPTS: usize = 10;

/// Picks the next piece to download.
///
/// Tries a few uniformly random indices first so that concurrent sessions
/// spread out, then scans linearly so an Available piece is always found if
/// one exists.
pub fn choose_piece(registry: &PieceRegistry) -> Option<usize> {
    choose_piece_with(registry, &mut rand::thread_rng())
}

pub fn choose_piece_with<R: Rng + ?Sized>(registry: &PieceRegistry, rng: &mut R) -> Option<usize> {
    pick(registry, rng, |i| registry.status(i) == Some(PieceStatus::Available))
}

/// Like [`choose_piece`], but first looks among the pieces `peer` was the
/// first to advertise. Any other Available piece is the fallback.
pub fn choose_piece_for(registry: &PieceRegistry, peer: Option<PeerId>) -> Option<usize> {
    choose_piece_for_with(registry, peer, &mut rand::thread_rng())
}

pub fn choose_piece_for_with<R: Rng + ?Sized>(
    registry: &PieceRegistry,
    peer: Option<PeerId>,
    rng: &mut R,
) -> Option<usize> {
    peer.and_then(|peer| {
        pick(registry, rng, |i| {
            registry
                .get(i)
                .is_some_and(|p| p.status == PieceStatus::Available && p.peer == Some(peer))
        })
    })
    .or_else(|| choose_piece_with(registry, rng))
}

/// Random probes, then a linear scan, for an index that passes `accept`.
fn pick<R, F>(registry: &PieceRegistry, rng: &mut R, accept: F) -> Option<usize>
where
    R: Rng + ?Sized,
    F: Fn(usize) -> bool,
{
    if registry.is_empty() {
        return None;
    }

    for _ in 0..SCHEDULER_ATTEMPTS {
        let index = rng.gen_range(0..registry.len());
        if accept(index) {
            return Some(index);
        }
    }

    (0..registry.len()).find(|&i| accept(i))
}
