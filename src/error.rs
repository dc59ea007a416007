use thiserror::Error;

use crate::entities::event;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Locked day: day {day} is not open (unlocked day is {unlocked})")]
    LockedDay { day: i32, unlocked: i32 },
    #[error(
        "Version conflict: event id {} expected version {expected}, current version is {}",
        current.id,
        current.lock_version
    )]
    VersionConflict {
        expected: i32,
        current: Box<event::Model>,
    },
    #[error("Already a participant: {0}")]
    AlreadyParticipant(String),
    #[error("Already resolved: invitation is {0}")]
    AlreadyResolved(String),
    #[error("Expired: {0}")]
    Expired(String),
    #[error("Not authorized: {0}")]
    NotAuthorized(String),
}

impl AppError {
    /// Process exit code for the CLI; a version conflict maps to 2 so callers
    /// can tell "refetch and reapply" apart from every other failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::VersionConflict { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event(version: i32) -> event::Model {
        let now = Utc::now();
        event::Model {
            id: 7,
            external_id: "ext".to_string(),
            creator_id: "alice".to_string(),
            challenge_id: None,
            title: "Standup".to_string(),
            start_at: now,
            end_at: now,
            event_type: "normal".to_string(),
            status: "scheduled".to_string(),
            description: None,
            color: "#000000".to_string(),
            lock_version: version,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn version_conflict_reports_both_versions() {
        let err = AppError::VersionConflict {
            expected: 5,
            current: Box::new(sample_event(6)),
        };
        let message = err.to_string();
        assert!(message.contains("expected version 5"));
        assert!(message.contains("current version is 6"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn locked_day_names_the_open_day() {
        let err = AppError::LockedDay { day: 4, unlocked: 3 };
        assert_eq!(
            err.to_string(),
            "Locked day: day 4 is not open (unlocked day is 3)"
        );
        assert_eq!(err.exit_code(), 1);
    }
}
