//! Serializable session state.
//!
//! A [`SessionSnapshot`] captures what cannot be rebuilt from the engines'
//! configuration: the conversation rounds (full or compacted), the
//! append-only critical information, the compaction history and free-form
//! metadata. Where it is stored is up to the host; only JSON helpers are
//! provided here.

use crate::compaction::{CompactionRecord, ConversationRound, CriticalInformation};
use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Format version written by [`SessionSnapshot::to_json`].
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub rounds: Vec<ConversationRound>,
    pub critical_info: CriticalInformation,
    pub compaction_history: Vec<CompactionRecord>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SessionSnapshot {
    pub fn new(
        rounds: Vec<ConversationRound>,
        critical_info: CriticalInformation,
        compaction_history: Vec<CompactionRecord>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            version: FORMAT_VERSION,
            saved_at: Utc::now(),
            rounds,
            critical_info,
            compaction_history,
            metadata,
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a snapshot, rejecting unknown format versions.
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let snapshot: Self = serde_json::from_str(json)?;
        if snapshot.version != FORMAT_VERSION {
            return Err(SessionError::Version {
                found: snapshot.version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(snapshot)
    }

    pub fn compacted_rounds(&self) -> usize {
        self.rounds.iter().filter(|r| r.is_compacted()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::{CompactionConfig, CompactionEngine};

    fn engine_with_history() -> CompactionEngine {
        let engine = CompactionEngine::new(CompactionConfig::default().with_retention(1));
        engine.add_round(
            "The API must return JSON.",
            "We decided to use serde for encoding.",
            vec![],
        );
        engine.add_round("Show me the handler", "Here it is.", vec![]);
        engine.perform_compaction(None).unwrap();
        engine
    }

    #[test]
    fn snapshot_survives_json() {
        let engine = engine_with_history();
        let mut metadata = HashMap::new();
        metadata.insert("workspace".to_string(), "/tmp/project".to_string());
        let snapshot = SessionSnapshot::new(
            engine.rounds(),
            engine.critical_info(),
            engine.compaction_history(),
            metadata,
        );
        assert_eq!(snapshot.compacted_rounds(), 1);

        let json = snapshot.to_json().unwrap();
        let parsed = SessionSnapshot::from_json(&json).unwrap();
        assert_eq!(parsed, snapshot);
        assert_eq!(parsed.critical_info.requirements.len(), 1);
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let mut snapshot = SessionSnapshot::new(
            Vec::new(),
            CriticalInformation::default(),
            Vec::new(),
            HashMap::new(),
        );
        snapshot.version = 99;
        let json = serde_json::to_string(&snapshot).unwrap();
        let err = SessionSnapshot::from_json(&json).unwrap_err();
        assert!(matches!(err, SessionError::Version { found: 99, expected: 1 }));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            SessionSnapshot::from_json("{\"version\": 1}"),
            Err(SessionError::Json(_))
        ));
    }
}
