//! Per session bookkeeping of judged tags.

use keycreator_core::{TagDetection, Technology, TechnologySet, Uid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a tag fared in this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Provisioned and registered.
    Correct,
    /// Mismatched or failed; ignored until cleared.
    Wrong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgedTag {
    pub technology: Technology,
    pub verdict: Verdict,
}

/// State owned by one session. Dropped when the session ends, so nothing
/// carries over into the next one.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: u64,
    required: TechnologySet,
    judged: BTreeMap<Uid, JudgedTag>,
    provisioned: u32,
    rejected: u32,
}

impl SessionContext {
    pub fn new(session_id: u64, required: TechnologySet) -> Self {
        Self {
            session_id,
            required,
            judged: BTreeMap::new(),
            provisioned: 0,
            rejected: 0,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn required(&self) -> &TechnologySet {
        &self.required
    }

    /// Already judged UIDs are not looked at again.
    pub fn is_judged(&self, uid: &Uid) -> bool {
        self.judged.contains_key(uid)
    }

    pub fn verdict(&self, uid: &Uid) -> Option<Verdict> {
        self.judged.get(uid).map(|tag| tag.verdict)
    }

    /// Record the verdict for every tag of one token.
    pub fn judge(&mut self, token: &[TagDetection], verdict: Verdict) {
        for detection in token {
            self.judged.insert(
                detection.uid.clone(),
                JudgedTag {
                    technology: detection.technology,
                    verdict,
                },
            );
        }
        match verdict {
            Verdict::Correct => self.provisioned += 1,
            Verdict::Wrong => self.rejected += 1,
        }
    }

    /// Forget `uid` so the next sighting is judged afresh.
    pub fn clear(&mut self, uid: &Uid) -> bool {
        self.judged.remove(uid).is_some()
    }

    pub fn uids_with(&self, verdict: Verdict) -> impl Iterator<Item = &Uid> {
        self.judged
            .iter()
            .filter(move |(_, tag)| tag.verdict == verdict)
            .map(|(uid, _)| uid)
    }

    /// Tokens provisioned in this session.
    pub fn provisioned(&self) -> u32 {
        self.provisioned
    }

    /// Tokens rejected in this session.
    pub fn rejected(&self) -> u32 {
        self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Vec<TagDetection> {
        vec![
            TagDetection::new(Uid::new(vec![0x04, 0x4A, 0x3C, 0x91]), Technology::Hitag1S, 32),
            TagDetection::new(Uid::new(vec![0x9F, 0x3C, 0x11, 0x02]), Technology::MifareClassic, 32),
        ]
    }

    #[test]
    fn test_judged_tags_stay_judged_until_cleared() {
        let mut context = SessionContext::new(1, TechnologySet::new());
        let token = token();
        context.judge(&token, Verdict::Correct);

        assert!(token.iter().all(|d| context.is_judged(&d.uid)));
        assert_eq!(context.uids_with(Verdict::Correct).count(), 2);
        assert_eq!(context.provisioned(), 1);

        assert!(context.clear(&token[0].uid));
        assert!(!context.is_judged(&token[0].uid));
        assert!(!context.clear(&token[0].uid));
        assert_eq!(context.verdict(&token[1].uid), Some(Verdict::Correct));
    }

    #[test]
    fn test_rejudging_overwrites() {
        let mut context = SessionContext::new(7, TechnologySet::new());
        let token = token();
        context.judge(&token, Verdict::Wrong);
        context.judge(&token[..1], Verdict::Correct);

        assert_eq!(context.verdict(&token[0].uid), Some(Verdict::Correct));
        assert_eq!(context.uids_with(Verdict::Wrong).count(), 1);
        assert_eq!(context.rejected(), 1);
        assert_eq!(context.session_id(), 7);
    }
}
