//! Submission and stage records
//!
//! A `Submission` is the immutable intake record (one learner recording set).
//! Each submission owns one `StageRecord` per `StageKind`; the records are the
//! unit the coordinator mutates as stage events arrive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque stage output. Workers decide the shape; the coordinator only stores it.
pub type StagePayload = serde_json::Value;

// ============================================================================
// Submission
// ============================================================================

/// A learner's spoken submission as delivered by the intake service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Opaque identifier assigned by intake
    pub id: String,
    /// Audio recordings, in the order the learner made them
    pub audio_urls: Vec<String>,
    /// When intake accepted the submission
    pub created_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(id: impl Into<String>, audio_urls: Vec<String>) -> Self {
        Self {
            id: id.into(),
            audio_urls,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Stage Kind
// ============================================================================

/// The six analysis stages.
///
/// Stage 1 (`Transcription`, `AudioFeatures`) has no dependencies. Every
/// stage 2 kind needs both stage 1 results before it can be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Transcription,
    AudioFeatures,
    Grammar,
    Pronunciation,
    Lexical,
    Fluency,
}

const ENTRY_DEPENDENCIES: &[StageKind] = &[];
const ANALYSIS_DEPENDENCIES: &[StageKind] = &[StageKind::Transcription, StageKind::AudioFeatures];

impl StageKind {
    /// Every stage, stage 1 first.
    pub const ALL: [Self; 6] = [
        Self::Transcription,
        Self::AudioFeatures,
        Self::Grammar,
        Self::Pronunciation,
        Self::Lexical,
        Self::Fluency,
    ];

    /// Stages that must have succeeded before this one may be dispatched.
    pub const fn dependencies(self) -> &'static [Self] {
        match self {
            Self::Transcription | Self::AudioFeatures => ENTRY_DEPENDENCIES,
            Self::Grammar | Self::Pronunciation | Self::Lexical | Self::Fluency => {
                ANALYSIS_DEPENDENCIES
            }
        }
    }

    /// True for the stages dispatched as soon as a submission arrives.
    pub const fn is_entry(self) -> bool {
        self.dependencies().is_empty()
    }

    /// Name used in topic strings and serialized maps.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::AudioFeatures => "audiofeatures",
            Self::Grammar => "grammar",
            Self::Pronunciation => "pronunciation",
            Self::Lexical => "lexical",
            Self::Fluency => "fluency",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage kind '{0}'")]
pub struct UnknownStageKind(pub String);

impl FromStr for StageKind {
    type Err = UnknownStageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStageKind(s.to_string()))
    }
}

// ============================================================================
// Stage Record
// ============================================================================

/// Lifecycle of a single stage within one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
}

/// Per-(submission, stage) progress record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub submission_id: String,
    pub kind: StageKind,
    pub status: StageStatus,
    /// Worker output, set once the stage succeeds
    pub result: Option<StagePayload>,
    /// Failed attempts so far (reported or timed out)
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// When the current attempt was dispatched, or confirmed on the bus
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    /// Whether the current attempt's input reached the bus
    #[serde(default)]
    pub input_published: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn new(submission_id: impl Into<String>, kind: StageKind) -> Self {
        Self {
            submission_id: submission_id.into(),
            kind,
            status: StageStatus::Pending,
            result: None,
            attempt_count: 0,
            last_error: None,
            dispatched_at: None,
            input_published: false,
            completed_at: None,
        }
    }

    /// 1-based number of the attempt currently in flight (or next to be sent).
    pub const fn current_attempt(&self) -> u32 {
        self.attempt_count.saturating_add(1)
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_table() {
        assert!(StageKind::Transcription.is_entry());
        assert!(StageKind::AudioFeatures.is_entry());
        for kind in [
            StageKind::Grammar,
            StageKind::Pronunciation,
            StageKind::Lexical,
            StageKind::Fluency,
        ] {
            assert_eq!(
                kind.dependencies(),
                &[StageKind::Transcription, StageKind::AudioFeatures]
            );
        }
    }

    #[test]
    fn test_kind_names_match_serde() {
        for kind in StageKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(kind.as_str().parse::<StageKind>().unwrap(), kind);
        }
        assert!("spelling".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_current_attempt_is_one_based() {
        let mut record = StageRecord::new("S1", StageKind::Grammar);
        assert_eq!(record.current_attempt(), 1);
        record.attempt_count = 2;
        assert_eq!(record.current_attempt(), 3);
    }
}
