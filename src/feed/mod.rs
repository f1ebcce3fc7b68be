//! Feed decoding: a downloaded JSON ad feed becomes per-ad entries ready to
//! merge into the slot store.

use serde::Deserialize;

use crate::config::PackageIdRule;
use crate::error::{PromoError, PromoResult};
use crate::net::SERVER_ERROR_MARKER;

/// Wire shape of one feed document. `containers` is reserved server-side
/// and currently unused.
#[derive(Debug, Deserialize)]
pub struct FeedDocument {
    pub slots: Vec<FeedSlot>,
    #[serde(default)]
    pub containers: Vec<FeedSlot>,
}

/// One entry in the `slots` array. `slotid` is a composite like `"12a"`:
/// numeric slot id followed by a single candidate character.
#[derive(Debug, Deserialize)]
pub struct FeedSlot {
    pub slotid: String,
    pub updatetime: i64,
    pub active: bool,
    pub adurl: String,
    pub imgurl: String,
}

/// A decoded ad entry with the composite slot id split apart and the
/// derived fields filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAd {
    pub slot_id: u32,
    pub candidate: char,
    pub active: bool,
    pub update_time: i64,
    pub ad_url: String,
    pub img_url: String,
    /// Derived from the ad URL via the configured [`PackageIdRule`].
    pub package_name: String,
    /// Deterministic cache file name: composite slot id plus the image
    /// extension found in the image URL.
    pub file_name: String,
}

/// Decode a downloaded feed body. An empty body, a server-side error page,
/// or any malformed slot id fails the whole feed; the refresh driver
/// discards partial results and retries on its next cycle.
pub fn decode_feed(body: &str, rule: &PackageIdRule) -> PromoResult<Vec<DecodedAd>> {
    if body.trim().is_empty() {
        return Err(PromoError::Transport("empty feed body".into()));
    }
    if body.contains(SERVER_ERROR_MARKER) {
        return Err(PromoError::Transport(
            "server-side error marker in feed body".into(),
        ));
    }

    let document: FeedDocument = serde_json::from_str(body)
        .map_err(|err| PromoError::Parse(format!("feed json: {err}")))?;

    let mut decoded = Vec::with_capacity(document.slots.len());
    for slot in &document.slots {
        let (slot_id, candidate) = split_slot_id(&slot.slotid)?;

        decoded.push(DecodedAd {
            slot_id,
            candidate,
            active: slot.active,
            update_time: slot.updatetime,
            ad_url: slot.adurl.clone(),
            img_url: slot.imgurl.clone(),
            package_name: rule.extract(&slot.adurl),
            file_name: format!("{}{}", slot.slotid, image_extension(&slot.imgurl)),
        });
    }

    Ok(decoded)
}

/// Split a composite slot id like `"12a"` into its numeric slot and
/// single-character candidate parts.
fn split_slot_id(slot_id: &str) -> PromoResult<(u32, char)> {
    let digits: String = slot_id.chars().filter(|c| c.is_ascii_digit()).collect();
    let letters: Vec<char> = slot_id.chars().filter(|c| c.is_ascii_lowercase()).collect();

    let number = digits
        .parse::<u32>()
        .map_err(|_| PromoError::Parse(format!("no numeric slot id in '{slot_id}'")))?;

    match letters.as_slice() {
        [candidate] => Ok((number, *candidate)),
        _ => Err(PromoError::Parse(format!(
            "expected one candidate char in '{slot_id}'"
        ))),
    }
}

/// Pull the image file extension (with the leading dot) out of an image
/// URL, ignoring any query or fragment. Unknown shapes come back empty,
/// which just means an extension-less cache file.
fn image_extension(img_url: &str) -> String {
    let path = img_url.split(['?', '#']).next().unwrap_or(img_url);
    let file = path.rsplit('/').next().unwrap_or(path);

    match file.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!(".{ext}")
        }
        _ => String::new(),
    }
}
