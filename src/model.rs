use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TemplateCategory {
    Routine,
    Study,
    Workout,
    Custom,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Routine => "routine",
            Self::Study => "study",
            Self::Workout => "workout",
            Self::Custom => "custom",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TemplateVisibility {
    Private,
    Public,
    Unlisted,
}

impl TemplateVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
            Self::Unlisted => "unlisted",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChallengeMode {
    Template,
    Custom,
}

impl ChallengeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Custom => "custom",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChallengeStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl ChallengeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ChallengeStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::InvalidInput(format!(
                "unknown challenge status '{other}'"
            ))),
        }
    }
}

/// Explicit user-driven status transitions; the engine never takes these on
/// its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusAction {
    Pause,
    Resume,
    Cancel,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Challenge,
    Dday,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Challenge => "challenge",
            Self::Dday => "dday",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ParticipantRole {
    Owner,
    Editor,
    Viewer,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Self::Owner | Self::Editor)
    }
}

impl FromStr for ParticipantRole {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "owner" => Ok(Self::Owner),
            "editor" => Ok(Self::Editor),
            "viewer" => Ok(Self::Viewer),
            other => Err(AppError::InvalidInput(format!(
                "unknown participant role '{other}'"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Expired => "expired",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateInput {
    pub title: String,
    pub description: Option<String>,
    pub category: TemplateCategory,
    pub duration_days: i32,
    pub visibility: TemplateVisibility,
}

/// One task row of a template or custom challenge, addressed by day number.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskInput {
    pub day_number: i32,
    pub title: String,
    pub description: Option<String>,
    pub is_required: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChallengeInput {
    pub title: Option<String>,
    pub color: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub with_event: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChallengeChanges {
    pub title: Option<String>,
    pub color: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DailyLogInput {
    pub review_text: Option<String>,
    pub difficulty_score: Option<i32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventInput {
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub event_type: EventType,
    pub description: Option<String>,
    pub color: Option<String>,
}

/// Any subset of the mutable Event fields.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub color: Option<String>,
    pub status: Option<EventStatus>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && self.color.is_none()
            && self.status.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_owner_and_editor_can_edit() {
        assert!(ParticipantRole::Owner.can_edit());
        assert!(ParticipantRole::Editor.can_edit());
        assert!(!ParticipantRole::Viewer.can_edit());
    }

    #[test]
    fn status_parses_stored_values() {
        for status in [
            ChallengeStatus::Active,
            ChallengeStatus::Paused,
            ChallengeStatus::Completed,
            ChallengeStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ChallengeStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ChallengeStatus>().is_err());
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(EventPatch::default().is_empty());
        let patch = EventPatch {
            color: Some("#ffffff".to_string()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
