//! # Participant Roster
//!
//! The roster maps each [`ParticipantId`] to its display attributes. It is
//! read-only from this crate's point of view: loaded once at startup, looked
//! up on every scan, never written.
//!
//! ## Roster File Format
//!
//! A JSON object keyed by participant ID:
//!
//! ```json
//! {
//!   "D100": { "name": "Ada Lovelace", "committee": "UNSC", "portfolio": "France" },
//!   "D101": { "display_name": "Grace Hopper", "group": "DISEC" }
//! }
//! ```
//!
//! See [`ParticipantProfile`] for the accepted field names. Extra fields are
//! ignored.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::types::{ParticipantId, ParticipantProfile};

/// Read-only lookup from participant ID to profile.
///
/// Implementations must be cheap to call from any thread; the admission path
/// calls `lookup` once per scan.
pub trait Roster: Send + Sync + 'static {
    /// Returns the participant's profile, or `None` if they are not registered.
    fn lookup(&self, participant_id: &ParticipantId) -> Option<ParticipantProfile>;

    /// Number of registered participants.
    fn registered_count(&self) -> usize;
}

/// In-memory roster loaded from a JSON document.
#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    profiles: HashMap<ParticipantId, ParticipantProfile>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a roster document.
    ///
    /// Keys are trimmed so `" D100 "` and `"D100"` are the same participant.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: HashMap<String, ParticipantProfile> = serde_json::from_str(json)?;

        Ok(raw
            .into_iter()
            .map(|(id, profile)| (ParticipantId::new(id.trim()), profile))
            .collect())
    }

    /// Reads and parses a roster file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let roster = Self::from_json_str(&json)?;
        info!(path = %path.display(), participants = roster.len(), "loaded roster");
        Ok(roster)
    }

    /// Adds or replaces a participant.
    pub fn insert(&mut self, participant_id: impl Into<ParticipantId>, profile: ParticipantProfile) {
        self.profiles.insert(participant_id.into(), profile);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.profiles.contains_key(participant_id)
    }

    /// Registered participant IDs, sorted.
    pub fn ids(&self) -> Vec<ParticipantId> {
        let mut ids: Vec<_> = self.profiles.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl FromIterator<(ParticipantId, ParticipantProfile)> for StaticRoster {
    fn from_iter<I: IntoIterator<Item = (ParticipantId, ParticipantProfile)>>(iter: I) -> Self {
        Self {
            profiles: iter.into_iter().collect(),
        }
    }
}

impl Roster for StaticRoster {
    fn lookup(&self, participant_id: &ParticipantId) -> Option<ParticipantProfile> {
        self.profiles.get(participant_id).cloned()
    }

    fn registered_count(&self) -> usize {
        self.profiles.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const ROSTER: &str = r#"{
        "D100": {"name": "Ada Lovelace", "country": "France", "committee": "UNSC",
                 "portfolio": "France", "liability_form": true, "transport_form": false},
        " D101 ": {"display_name": "Grace Hopper", "group": "DISEC"}
    }"#;

    #[test]
    fn test_lookup() {
        let roster = StaticRoster::from_json_str(ROSTER).unwrap();

        let ada = roster.lookup(&ParticipantId::new("D100")).unwrap();
        assert_eq!(ada.display_name, "Ada Lovelace");
        assert_eq!(ada.group, "UNSC");
        assert_eq!(ada.subgroup.as_deref(), Some("France"));

        let grace = roster.lookup(&ParticipantId::new("D101")).unwrap();
        assert_eq!(grace.subgroup, None);

        assert!(roster.lookup(&ParticipantId::new("D999")).is_none());
        assert_eq!(roster.ids(), vec![ParticipantId::new("D100"), ParticipantId::new("D101")]);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ROSTER.as_bytes()).unwrap();

        let roster = StaticRoster::from_json_file(file.path()).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.registered_count(), 2);
    }

    #[test]
    fn test_bad_documents() {
        assert!(StaticRoster::from_json_str("[1, 2, 3]").is_err());
        assert!(StaticRoster::from_json_str(r#"{"D1": {"committee": "UNSC"}}"#).is_err());
        assert!(StaticRoster::from_json_file("/nonexistent/roster.json").is_err());
    }
}
