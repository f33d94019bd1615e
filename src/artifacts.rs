//! Artifact references and the object-store path layout.
//!
//! Artifacts live in content-addressed blob storage under
//! `{date}/{stage}/{filename}`; the documents the orchestrator persists only
//! ever hold [`ArtifactRef`]s pointing at them. A reference is owned by the
//! stage that produced it and never mutated after write.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::paths::is_valid_pipeline_id;

// ── ArtifactRef ────────────────────────────────────────────────────────

/// Media kind of a stored artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Audio,
    Video,
    Image,
    Json,
    Text,
}

/// Immutable pointer to one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    /// URL in the content-addressed store.
    pub url: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub generated_at: DateTime<Utc>,
    /// Stage that produced (and owns) this artifact.
    pub stage: String,
}

// ── Path layout ────────────────────────────────────────────────────────

/// Stage directories permitted in the artifact store.
pub const ARTIFACT_STAGES: &[&str] = &[
    "research",
    "script-drafts",
    "script-gen",
    "tts",
    "audio-segments",
    "visual-gen",
    "thumbnails",
    "render",
];

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum ArtifactPathError {
    #[error("invalid artifact date: {date}")]
    #[diagnostic(
        code(nexus::artifacts::bad_date),
        help("Dates must match YYYY-MM-DD and be real calendar days.")
    )]
    BadDate { date: String },

    #[error("unknown artifact stage: {stage}")]
    #[diagnostic(code(nexus::artifacts::bad_stage))]
    BadStage { stage: String },

    #[error("invalid artifact filename: {filename}")]
    #[diagnostic(
        code(nexus::artifacts::bad_filename),
        help("Filenames must be non-empty and free of path separators.")
    )]
    BadFilename { filename: String },
}

/// Build the canonical `{date}/{stage}/{filename}` object path.
pub fn artifact_path(
    date: &str,
    stage: &str,
    filename: &str,
) -> Result<String, ArtifactPathError> {
    if !is_valid_pipeline_id(date) {
        return Err(ArtifactPathError::BadDate {
            date: date.to_string(),
        });
    }
    if !ARTIFACT_STAGES.contains(&stage) {
        return Err(ArtifactPathError::BadStage {
            stage: stage.to_string(),
        });
    }
    if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
        return Err(ArtifactPathError::BadFilename {
            filename: filename.to_string(),
        });
    }
    Ok(format!("{date}/{stage}/{filename}"))
}
