use sea_orm::entity::prelude::*;
use serde::Serialize;

use super::{challenge, event_user, invitation};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub external_id: String,
    pub creator_id: String,
    pub challenge_id: Option<i64>,
    pub title: String,
    pub start_at: DateTimeUtc,
    pub end_at: DateTimeUtc,
    pub event_type: String,
    pub status: String,
    pub description: Option<String>,
    pub color: String,
    pub lock_version: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Challenge,
    Participant,
    Invitation,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Challenge => Entity::belongs_to(challenge::Entity)
                .from(Column::ChallengeId)
                .to(challenge::Column::Id)
                .into(),
            Self::Participant => Entity::has_many(event_user::Entity).into(),
            Self::Invitation => Entity::has_many(invitation::Entity).into(),
        }
    }
}

impl Related<challenge::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Challenge.def()
    }
}

impl Related<event_user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Participant.def()
    }
}

impl Related<invitation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Invitation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
