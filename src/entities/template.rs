use sea_orm::entity::prelude::*;

use super::{challenge, template_day};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "challenge_templates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub owner_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub duration_days: i32,
    pub visibility: String,
    pub is_system: bool,
    pub is_active: bool,
    pub usage_count: i32,
    pub like_count: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Day,
    Challenge,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Day => Entity::has_many(template_day::Entity).into(),
            Self::Challenge => Entity::has_many(challenge::Entity).into(),
        }
    }
}

impl Related<template_day::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Day.def()
    }
}

impl Related<challenge::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Challenge.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
