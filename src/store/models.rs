use serde::{Deserialize, Serialize};

/// Where a candidate's image is in its lifecycle this session. Never
/// persisted: handles index into the engine's texture list and die with it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextureState {
    #[default]
    NotReady,
    /// A fetch or disk read is in flight; further ensure calls are no-ops
    /// until it settles.
    Downloading,
    /// Decoded and available at this index in the texture list.
    Ready(usize),
}

impl TextureState {
    pub fn is_ready(&self) -> bool {
        matches!(self, TextureState::Ready(_))
    }

    pub fn handle(&self) -> Option<usize> {
        match self {
            TextureState::Ready(handle) => Some(*handle),
            _ => None,
        }
    }
}

/// One ad creative inside a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdCandidate {
    /// Single-character id, unique within the slot.
    pub id: char,
    /// Cache file name on disk (composite slot id plus image extension).
    pub file_name: String,
    /// Raw image bytes were written to the cache dir in some session.
    pub disk_cached: bool,
    /// Session-local; always comes back NotReady after a load.
    #[serde(skip)]
    pub texture: TextureState,
    /// The host device already has this app installed. Re-derived every
    /// session from the installed-apps source.
    pub installed: bool,
    /// Promotes the host app itself; never surfaced.
    pub self_ad: bool,
    /// Feed-controlled kill switch.
    pub active: bool,
    /// `updatetime` of the creative the ready texture was decoded from.
    pub ready_update_time: i64,
    /// Latest `updatetime` seen in any feed for this candidate.
    pub latest_update_time: i64,
    pub img_url: String,
    pub ad_url: String,
    pub package_name: String,
}

impl AdCandidate {
    pub fn new(id: char) -> Self {
        Self {
            id,
            file_name: String::new(),
            disk_cached: false,
            texture: TextureState::NotReady,
            installed: false,
            self_ad: false,
            active: false,
            ready_update_time: 0,
            latest_update_time: 0,
            img_url: String::new(),
            ad_url: String::new(),
            package_name: String::new(),
        }
    }

    /// May this candidate be surfaced at all? Installed is a preference
    /// handled by rotation, not a bar.
    pub fn eligible(&self) -> bool {
        self.active && !self.self_ad
    }

    /// The ready texture still matches the newest known creative.
    pub fn texture_fresh(&self) -> bool {
        self.texture.is_ready() && self.ready_update_time >= self.latest_update_time
    }
}

/// One advertising placement and its rotation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdSlot {
    pub id: u32,
    pub candidates: Vec<AdCandidate>,
    /// Index of the last-shown candidate; stays in bounds once the slot is
    /// non-empty.
    pub cursor: usize,
}

impl AdSlot {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            candidates: Vec::new(),
            cursor: 0,
        }
    }

    pub fn candidate(&self, id: char) -> Option<&AdCandidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    pub fn candidate_mut(&mut self, id: char) -> Option<&mut AdCandidate> {
        self.candidates.iter_mut().find(|c| c.id == id)
    }

    /// Candidate the cursor points at, provided it may be surfaced at all.
    /// Self and inactive ads never leak through here, even if a rotation
    /// scan parked the cursor on one.
    pub fn current(&self) -> Option<&AdCandidate> {
        self.candidates.get(self.cursor).filter(|c| c.eligible())
    }
}

/// Full slot table for one feed endpoint. Feeds are independent; the feed
/// id is the index into the store's snapshot list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub slots: Vec<AdSlot>,
}

impl FeedSnapshot {
    pub fn slot(&self, id: u32) -> Option<&AdSlot> {
        self.slots.iter().find(|s| s.id == id)
    }

    pub fn slot_mut(&mut self, id: u32) -> Option<&mut AdSlot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }
}
