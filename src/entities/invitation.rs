use sea_orm::entity::prelude::*;
use serde::Serialize;

use super::event;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize)]
#[sea_orm(table_name = "event_invitations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub event_id: i64,
    pub inviter_id: String,
    pub email: String,
    pub role: String,
    pub token: String,
    pub status: String,
    pub expires_at: DateTimeUtc,
    pub responded_by: Option<String>,
    pub responded_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Event,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Event => Entity::belongs_to(event::Entity)
                .from(Column::EventId)
                .to(event::Column::Id)
                .into(),
        }
    }
}

impl Related<event::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Event.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
