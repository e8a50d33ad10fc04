//! Tag search with anti-bounce promotion.
//!
//! One poll tick sweeps the technologies in fixed order
//! ([`SEARCH_ORDER`]). For each, the tag type masks are narrowed to that one
//! technology and a search is issued. A UID sighted for the first time is
//! provisional. When the same UID is sighted again on the next tick it is
//! stable and the tick returns every detection gathered so far, which is
//! every token on the physical key. A provisional UID missing from a tick is
//! forgotten.
//!
//! ```text
//!  tick 1:  HITAG 04A1..  new         -> provisional
//!           MIFARE 9F3C.. new (SAK)   -> provisional
//!  tick 2:  HITAG 04A1..  seen again  -> stable, return [HITAG, MIFARE]
//! ```

use crate::classifier::TagClassifier;
use keycreator_core::{
    Result, TagDetection, Technology, Uid, constants::DETECTION_STABILITY_THRESHOLD,
};
use keycreator_hardware::{SearchReply, Twn4Reader};
use keycreator_protocol::tag_type;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, trace, warn};

/// What one search command looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTarget {
    Hitag1S,
    /// ISO 14443A, classified by SAK afterwards.
    Mifare,
    Deister,
    Em,
}

/// Order in which one tick searches.
pub const SEARCH_ORDER: [SearchTarget; 4] = [
    SearchTarget::Hitag1S,
    SearchTarget::Mifare,
    SearchTarget::Deister,
    SearchTarget::Em,
];

impl SearchTarget {
    /// `(lf_mask, hf_mask)` enabling only this target.
    pub fn masks(&self) -> (u32, u32) {
        match self {
            Self::Hitag1S => (tag_type::mask(tag_type::HITAG1S), tag_type::mask(tag_type::NONE)),
            Self::Mifare => (tag_type::mask(tag_type::NONE), tag_type::mask(tag_type::MIFARE)),
            Self::Deister => (tag_type::mask(tag_type::DEISTER), tag_type::mask(tag_type::NONE)),
            Self::Em => (tag_type::mask(tag_type::EM4102), tag_type::mask(tag_type::NONE)),
        }
    }

    /// Target whose search finds `technology`.
    pub fn for_technology(technology: Technology) -> Self {
        match technology {
            Technology::Hitag1S => Self::Hitag1S,
            Technology::MifareClassic | Technology::MifareDesfire => Self::Mifare,
            Technology::Deister => Self::Deister,
            Technology::Em => Self::Em,
        }
    }
}

impl fmt::Display for SearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hitag1S => write!(f, "HITAG1S"),
            Self::Mifare => write!(f, "MIFARE"),
            Self::Deister => write!(f, "DEISTER"),
            Self::Em => write!(f, "EM"),
        }
    }
}

#[derive(Debug, Clone)]
struct Sighting {
    detection: TagDetection,
    count: u8,
}

/// Searches the reader field and promotes stable UIDs.
///
/// # Examples
///
/// ```
/// use keycreator_hardware::{AnyLink, ChannelOptions, CommandChannel, MockLink, Twn4Reader, VirtualReader};
/// use keycreator_hardware::mock::VirtualTag;
/// use keycreator_rfid::TagSearch;
///
/// #[tokio::main]
/// async fn main() -> keycreator_core::Result<()> {
///     let sim = VirtualReader::new();
///     sim.place(VirtualTag::hitag([0x04, 0x4A, 0x3C, 0x91]));
///     let (link, _handle) = MockLink::with_responder(sim.clone());
///     let (channel, _worker) = CommandChannel::spawn(AnyLink::Mock(link), ChannelOptions::default());
///
///     let mut search = TagSearch::new(Twn4Reader::new(channel));
///     assert!(search.poll(|_| false).await?.is_none());
///     let stable = search.poll(|_| false).await?.unwrap();
///     assert_eq!(stable.len(), 1);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct TagSearch {
    reader: Twn4Reader,
    classifier: TagClassifier,
    threshold: u8,
    sightings: BTreeMap<Uid, Sighting>,
}

impl TagSearch {
    pub fn new(reader: Twn4Reader) -> Self {
        Self::with_threshold(reader, DETECTION_STABILITY_THRESHOLD)
    }

    /// Promote after `threshold` consecutive sightings (at least 1).
    pub fn with_threshold(reader: Twn4Reader, threshold: u8) -> Self {
        Self {
            classifier: TagClassifier::new(reader.clone()),
            reader,
            threshold: threshold.max(1),
            sightings: BTreeMap::new(),
        }
    }

    /// Run one search for `target`. No stability tracking.
    pub async fn search(&self, target: SearchTarget) -> Result<Option<SearchReply>> {
        let (lf, hf) = target.masks();
        self.reader.set_tag_types(lf, hf).await?;
        let found = self.reader.search_tag().await?;
        trace!(target = %target, found = found.is_some(), "Search");
        Ok(found)
    }

    /// Search once for `technology` and classify the hit.
    ///
    /// A MIFARE hit of the other family (Classic vs DESFire) yields `None`.
    pub async fn detect(&self, technology: Technology) -> Result<Option<TagDetection>> {
        let target = SearchTarget::for_technology(technology);
        let Some(found) = self.search(target).await? else {
            return Ok(None);
        };
        Ok(self
            .identify(target, found)
            .await?
            .filter(|detection| detection.technology == technology))
    }

    /// Search once for every target in [`SEARCH_ORDER`] and return all hits.
    pub async fn detect_all(&self) -> Result<Vec<TagDetection>> {
        let mut detections = Vec::new();
        for target in SEARCH_ORDER {
            if let Some(found) = self.search(target).await?
                && let Some(detection) = self.identify(target, found).await?
                && !detections.iter().any(|d: &TagDetection| d.uid == detection.uid)
            {
                detections.push(detection);
            }
        }
        Ok(detections)
    }

    /// One poll tick.
    ///
    /// UIDs for which `skip` returns true (already judged in this session)
    /// are ignored. Returns the gathered detections once a UID turns stable.
    pub async fn poll(&mut self, skip: impl Fn(&Uid) -> bool) -> Result<Option<Vec<TagDetection>>> {
        let mut seen = BTreeSet::new();

        for target in SEARCH_ORDER {
            let Some(found) = self.search(target).await? else {
                continue;
            };
            let uid = Uid::new(found.uid.clone());
            if skip(&uid) {
                trace!(uid = %uid, "Tag already judged, ignoring");
                continue;
            }
            if !seen.insert(uid.clone()) {
                continue;
            }

            let count = match self.sightings.get_mut(&uid) {
                Some(sighting) => {
                    sighting.count = sighting.count.saturating_add(1);
                    sighting.count
                }
                None => {
                    let Some(detection) = self.identify(target, found).await? else {
                        continue;
                    };
                    info!(tag = %detection, "New tag found");
                    self.sightings.insert(uid.clone(), Sighting { detection, count: 1 });
                    1
                }
            };

            if count >= self.threshold {
                info!(uid = %uid, count, "Tag stable");
                return Ok(Some(self.take()));
            }
        }

        let before = self.sightings.len();
        self.sightings.retain(|uid, _| seen.contains(uid));
        if self.sightings.len() < before {
            debug!(dropped = before - self.sightings.len(), "Provisional tags left the field");
        }
        Ok(None)
    }

    /// Provisional detections of the current sweep sequence.
    pub fn provisional(&self) -> impl Iterator<Item = &TagDetection> {
        self.sightings.values().map(|s| &s.detection)
    }

    /// Forget every provisional sighting.
    pub fn reset(&mut self) {
        self.sightings.clear();
    }

    fn take(&mut self) -> Vec<TagDetection> {
        std::mem::take(&mut self.sightings)
            .into_values()
            .map(|s| s.detection)
            .collect()
    }

    async fn identify(&self, target: SearchTarget, found: SearchReply) -> Result<Option<TagDetection>> {
        let technology = match target {
            SearchTarget::Hitag1S => Technology::Hitag1S,
            SearchTarget::Deister => Technology::Deister,
            SearchTarget::Em => Technology::Em,
            SearchTarget::Mifare => {
                let class = self.classifier.classify().await?;
                match class.technology() {
                    Some(technology) => technology,
                    None => {
                        warn!(uid = %Uid::new(found.uid.clone()), "Unsupported MIFARE tag ignored");
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(TagDetection::new(
            Uid::new(found.uid),
            technology,
            found.id_bit_count,
        )))
    }
}
