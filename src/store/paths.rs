//! Pure builders for every collection/id pair the orchestrator persists.
//!
//! Persisted layout:
//!
//! | Document | Collection | Id |
//! |---|---|---|
//! | Pipeline state | `pipelines` | `{date}/state` |
//! | Pipeline artifacts | `pipelines` | `{date}/artifacts` |
//! | Pipeline costs | `pipelines` | `{date}/costs` |
//! | Pipeline quality | `pipelines` | `{date}/quality` |
//! | Buffer video | `buffer-videos` | `{uuid}` |
//! | Incident | `incidents` | `{date}-{nnn}` |
//! | Review item | `review-queue` | `{id}` |
//! | Budget | `budget` | `current` |
//! | YouTube quota | `youtube-quota` | `{date}` |
//!
//! There is no hidden state: the same inputs always produce the same pair.

use std::sync::LazyLock;

/// A resolved document location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocPath {
    pub collection: &'static str,
    pub id: String,
}

static DATE_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("static pattern"));

/// Whether `id` is a valid `YYYY-MM-DD` pipeline id (shape and calendar).
#[must_use]
pub fn is_valid_pipeline_id(id: &str) -> bool {
    DATE_PATTERN.is_match(id) && chrono::NaiveDate::parse_from_str(id, "%Y-%m-%d").is_ok()
}

#[must_use]
pub fn pipeline_state(pipeline_id: &str) -> DocPath {
    DocPath {
        collection: "pipelines",
        id: format!("{pipeline_id}/state"),
    }
}

#[must_use]
pub fn pipeline_artifacts(pipeline_id: &str) -> DocPath {
    DocPath {
        collection: "pipelines",
        id: format!("{pipeline_id}/artifacts"),
    }
}

#[must_use]
pub fn pipeline_costs(pipeline_id: &str) -> DocPath {
    DocPath {
        collection: "pipelines",
        id: format!("{pipeline_id}/costs"),
    }
}

#[must_use]
pub fn pipeline_quality(pipeline_id: &str) -> DocPath {
    DocPath {
        collection: "pipelines",
        id: format!("{pipeline_id}/quality"),
    }
}

#[must_use]
pub fn buffer_video(buffer_id: &str) -> DocPath {
    DocPath {
        collection: "buffer-videos",
        id: buffer_id.to_string(),
    }
}

#[must_use]
pub fn incident(incident_id: &str) -> DocPath {
    DocPath {
        collection: "incidents",
        id: incident_id.to_string(),
    }
}

#[must_use]
pub fn review_item(item_id: &str) -> DocPath {
    DocPath {
        collection: "review-queue",
        id: item_id.to_string(),
    }
}

#[must_use]
pub fn budget_current() -> DocPath {
    DocPath {
        collection: "budget",
        id: "current".to_string(),
    }
}

#[must_use]
pub fn youtube_quota(date: &str) -> DocPath {
    DocPath {
        collection: "youtube-quota",
        id: date.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_paths_are_deterministic() {
        assert_eq!(pipeline_state("2026-01-22").id, "2026-01-22/state");
        assert_eq!(pipeline_state("2026-01-22"), pipeline_state("2026-01-22"));
        assert_eq!(pipeline_costs("2026-01-22").collection, "pipelines");
        assert_eq!(budget_current().id, "current");
    }

    #[test]
    fn pipeline_id_validation() {
        assert!(is_valid_pipeline_id("2026-01-22"));
        assert!(!is_valid_pipeline_id("2026-1-22"));
        assert!(!is_valid_pipeline_id("2026-13-01"));
        assert!(!is_valid_pipeline_id("2026-02-30"));
        assert!(!is_valid_pipeline_id("not-a-date"));
    }
}
