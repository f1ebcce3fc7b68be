//! Rotation policy: which candidate a slot shows next.

use rand::Rng;

use crate::store::{AdSlot, FeedSnapshot};

/// Advance the slot's cursor to the next candidate worth showing and return
/// its index. Self and inactive ads are always skipped; installed apps are
/// only accepted once a full pass has found nothing better. Scans at most
/// twice the candidate count to tolerate wraparound, then reports no ad.
pub fn select_next(slot: &mut AdSlot) -> Option<usize> {
    let count = slot.candidates.len();
    if count == 0 {
        return None;
    }

    for step in 0..count * 2 {
        slot.cursor = if slot.cursor + 1 >= count {
            0
        } else {
            slot.cursor + 1
        };
        let candidate = &slot.candidates[slot.cursor];

        if !candidate.eligible() {
            continue;
        }
        // Not-installed wins; installed only after the first full pass
        if !candidate.installed || step >= count {
            return Some(slot.cursor);
        }
    }

    None
}

/// Give every slot in the snapshot a random starting cursor so the first
/// candidate listed in the feed gets no deterministic head start.
pub fn randomize_cursors<R: Rng>(snapshot: &mut FeedSnapshot, rng: &mut R) {
    for slot in &mut snapshot.slots {
        if !slot.candidates.is_empty() {
            slot.cursor = rng.gen_range(0..slot.candidates.len());
        }
    }
}
