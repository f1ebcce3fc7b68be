//! Slot store: the merged table of every feed's slots and candidates, plus
//! versioned snapshot persistence.

mod models;

pub use models::{AdCandidate, AdSlot, FeedSnapshot, TextureState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PromoError, PromoResult};
use crate::feed::DecodedAd;

/// Bumped whenever the persisted shape changes; older or unknown versions
/// load as "no cached data".
const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PersistedStore {
    version: u32,
    saved_at: DateTime<Utc>,
    feeds: Vec<FeedSnapshot>,
}

/// What a merge changed, so the refresh driver knows which follow-up work
/// to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// A candidate is newly seen or its update timestamp advanced;
    /// rotation should re-run for this feed.
    pub changed: bool,
    /// A brand-new candidate appeared; cursors should be re-randomized so
    /// the first-seen candidate gets no permanent head start.
    pub new_candidates: bool,
}

#[derive(Debug, Default)]
pub struct SlotStore {
    feeds: Vec<FeedSnapshot>,
}

impl SlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    pub fn feed(&self, index: usize) -> Option<&FeedSnapshot> {
        self.feeds.get(index)
    }

    pub fn feed_mut(&mut self, index: usize) -> Option<&mut FeedSnapshot> {
        self.feeds.get_mut(index)
    }

    /// Slot lookup across the feed table; `None` for unknown feed or slot.
    pub fn slot(&self, feed: usize, slot_id: u32) -> Option<&AdSlot> {
        self.feeds.get(feed)?.slot(slot_id)
    }

    pub fn slot_mut(&mut self, feed: usize, slot_id: u32) -> Option<&mut AdSlot> {
        self.feeds.get_mut(feed)?.slot_mut(slot_id)
    }

    /// Merge one decoded feed into the table. Existing slots keep their
    /// rotation cursors; mutable candidate fields are overwritten
    /// unconditionally, including the derived self/installed flags.
    pub fn merge<F>(
        &mut self,
        feed: usize,
        entries: &[DecodedAd],
        bundle_id: &str,
        is_installed: F,
    ) -> MergeOutcome
    where
        F: Fn(&str) -> bool,
    {
        while self.feeds.len() <= feed {
            self.feeds.push(FeedSnapshot::default());
        }
        let snapshot = &mut self.feeds[feed];

        let mut outcome = MergeOutcome::default();

        for entry in entries {
            let slot_ix = match snapshot.slots.iter().position(|s| s.id == entry.slot_id) {
                Some(ix) => ix,
                None => {
                    snapshot.slots.push(AdSlot::new(entry.slot_id));
                    snapshot.slots.len() - 1
                }
            };
            let slot = &mut snapshot.slots[slot_ix];

            let cand_ix = match slot.candidates.iter().position(|c| c.id == entry.candidate) {
                Some(ix) => ix,
                None => {
                    slot.candidates.push(AdCandidate::new(entry.candidate));
                    outcome.new_candidates = true;
                    outcome.changed = true;
                    slot.candidates.len() - 1
                }
            };
            let candidate = &mut slot.candidates[cand_ix];

            if candidate.latest_update_time < entry.update_time
                || candidate.latest_update_time == 0
            {
                outcome.changed = true;
            }

            candidate.file_name = entry.file_name.clone();
            candidate.active = entry.active;
            candidate.self_ad =
                !bundle_id.is_empty() && entry.package_name.contains(bundle_id);
            candidate.installed = is_installed(&entry.package_name);
            candidate.ad_url = entry.ad_url.clone();
            candidate.img_url = entry.img_url.clone();
            candidate.package_name = entry.package_name.clone();
            candidate.latest_update_time = entry.update_time;
        }

        outcome
    }

    /// Serialize the full table for persistence. Texture state is
    /// session-local and not included.
    pub fn serialize(&self) -> PromoResult<Vec<u8>> {
        let persisted = PersistedStore {
            version: STORE_VERSION,
            saved_at: Utc::now(),
            feeds: self.feeds.clone(),
        };
        serde_json::to_vec(&persisted)
            .map_err(|err| PromoError::Storage(format!("snapshot encode: {err}")))
    }

    /// Rebuild a store from a persisted blob. Any decode problem or version
    /// skew means "no cached data". Texture state always comes back
    /// NotReady: cached images are re-validated next session, never assumed
    /// loaded.
    pub fn load(bytes: &[u8]) -> PromoResult<Self> {
        let persisted: PersistedStore = serde_json::from_slice(bytes)
            .map_err(|err| PromoError::Storage(format!("snapshot decode: {err}")))?;

        if persisted.version != STORE_VERSION {
            return Err(PromoError::Storage(format!(
                "unsupported snapshot version {}",
                persisted.version
            )));
        }

        let mut store = Self {
            feeds: persisted.feeds,
        };
        for feed in &mut store.feeds {
            for slot in &mut feed.slots {
                for candidate in &mut slot.candidates {
                    candidate.texture = TextureState::NotReady;
                }
            }
        }
        Ok(store)
    }
}
